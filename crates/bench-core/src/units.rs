//! Dimensional unit strings such as `kg m-2 s-1` or `g m-2 d-1`.
//!
//! A unit is a space separated product of symbols with optional integer
//! exponents (`m-2`, `m^2`, `s-1`). Two units convert into each other when
//! their base dimensions agree; the conversion is then a pure scale, except
//! for bare temperatures where `degC` and `K` also differ by an offset.

use crate::{ConfrontError, Result};

// mass, length, time, temperature, amount
type Dims = [i32; 5];

const DIMENSIONLESS: Dims = [0, 0, 0, 0, 0];
const DAYS_PER_YEAR: f64 = 365.0;
const KELVIN_OFFSET: f64 = 273.15;

#[derive(Clone, Copy, Debug, PartialEq)]
struct Quantity {
    factor: f64,
    dims: Dims,
}

impl Quantity {
    fn new(factor: f64, dims: Dims) -> Self {
        Self { factor, dims }
    }

    fn powi(self, exp: i32) -> Self {
        let mut dims = self.dims;
        for d in dims.iter_mut() {
            *d *= exp;
        }
        Self::new(self.factor.powi(exp), dims)
    }

    fn mul(self, other: Quantity) -> Self {
        let mut dims = self.dims;
        for (d, o) in dims.iter_mut().zip(other.dims.iter()) {
            *d += o;
        }
        Self::new(self.factor * other.factor, dims)
    }
}

fn base_symbol(symbol: &str) -> Option<Quantity> {
    let q = match symbol {
        "kg" => Quantity::new(1.0, [1, 0, 0, 0, 0]),
        "g" => Quantity::new(1e-3, [1, 0, 0, 0, 0]),
        "mg" => Quantity::new(1e-6, [1, 0, 0, 0, 0]),
        "Mg" => Quantity::new(1e3, [1, 0, 0, 0, 0]),
        "Tg" => Quantity::new(1e9, [1, 0, 0, 0, 0]),
        "Pg" => Quantity::new(1e12, [1, 0, 0, 0, 0]),
        "m" => Quantity::new(1.0, [0, 1, 0, 0, 0]),
        "km" => Quantity::new(1e3, [0, 1, 0, 0, 0]),
        "cm" => Quantity::new(1e-2, [0, 1, 0, 0, 0]),
        "mm" => Quantity::new(1e-3, [0, 1, 0, 0, 0]),
        "s" => Quantity::new(1.0, [0, 0, 1, 0, 0]),
        "min" => Quantity::new(60.0, [0, 0, 1, 0, 0]),
        "h" | "hr" => Quantity::new(3600.0, [0, 0, 1, 0, 0]),
        "d" | "day" => Quantity::new(86400.0, [0, 0, 1, 0, 0]),
        "y" | "yr" | "year" => Quantity::new(86400.0 * DAYS_PER_YEAR, [0, 0, 1, 0, 0]),
        "K" | "degC" | "C" => Quantity::new(1.0, [0, 0, 0, 1, 0]),
        "mol" => Quantity::new(1.0, [0, 0, 0, 0, 1]),
        "umol" => Quantity::new(1e-6, [0, 0, 0, 0, 1]),
        "W" => Quantity::new(1.0, [1, 2, -3, 0, 0]),
        "J" => Quantity::new(1.0, [1, 2, -2, 0, 0]),
        "MJ" => Quantity::new(1e6, [1, 2, -2, 0, 0]),
        "Pa" => Quantity::new(1.0, [1, -1, -2, 0, 0]),
        "hPa" => Quantity::new(1e2, [1, -1, -2, 0, 0]),
        "kPa" => Quantity::new(1e3, [1, -1, -2, 0, 0]),
        "%" => Quantity::new(1e-2, DIMENSIONLESS),
        "-" => Quantity::new(1.0, DIMENSIONLESS),
        _ => return None,
    };
    Some(q)
}

fn parse_token(token: &str) -> Option<Quantity> {
    if let Ok(v) = token.parse::<f64>() {
        return Some(Quantity::new(v, DIMENSIONLESS));
    }
    let token = token.replace('^', "");
    let split = token
        .char_indices()
        .skip(1)
        .find(|(_, c)| c.is_ascii_digit() || *c == '-' || *c == '+')
        .map(|(i, _)| i);
    match split {
        Some(i) => {
            let exp = token[i..].parse::<i32>().ok()?;
            Some(base_symbol(&token[..i])?.powi(exp))
        }
        None => base_symbol(&token),
    }
}

fn parse(unit: &str) -> Option<Quantity> {
    let mut q = Quantity::new(1.0, DIMENSIONLESS);
    for token in unit.split_whitespace() {
        q = q.mul(parse_token(token)?);
    }
    Some(q)
}

fn celsius_offset(unit: &str) -> Option<f64> {
    match unit.trim() {
        "degC" | "C" => Some(KELVIN_OFFSET),
        "K" => Some(0.0),
        _ => None,
    }
}

/// Affine map `value * scale + offset` from one unit to another.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Conversion {
    pub scale: f64,
    pub offset: f64,
}

impl Conversion {
    pub fn apply(&self, value: f64) -> f64 {
        value * self.scale + self.offset
    }

    pub fn is_identity(&self) -> bool {
        self.scale == 1.0 && self.offset == 0.0
    }
}

pub fn conversion(from: &str, to: &str) -> Result<Conversion> {
    let mismatch = || ConfrontError::UnitMismatch {
        from: from.to_string(),
        to: to.to_string(),
    };
    if from.trim() == to.trim() {
        return Ok(Conversion {
            scale: 1.0,
            offset: 0.0,
        });
    }
    if let (Some(a), Some(b)) = (celsius_offset(from), celsius_offset(to)) {
        return Ok(Conversion {
            scale: 1.0,
            offset: a - b,
        });
    }
    let src = parse(from).ok_or_else(mismatch)?;
    let dst = parse(to).ok_or_else(mismatch)?;
    if src.dims != dst.dims {
        return Err(mismatch());
    }
    Ok(Conversion {
        scale: src.factor / dst.factor,
        offset: 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * b.abs().max(1.0)
    }

    #[test]
    fn flux_rate_converts_per_second_to_per_day() {
        let c = conversion("kg m-2 s-1", "g m-2 d-1").expect("compatible");
        assert!(close(c.apply(1.0), 1000.0 * 86400.0));
        let back = conversion("g m-2 d-1", "kg m-2 s-1").expect("compatible");
        assert!(close(back.apply(c.apply(2.5)), 2.5));
    }

    #[test]
    fn energy_flux_accepts_caret_exponents() {
        let c = conversion("W m^-2", "MJ m-2 d-1").expect("compatible");
        assert!(close(c.apply(1.0), 86400.0 / 1e6));
    }

    #[test]
    fn temperatures_carry_offset() {
        let c = conversion("degC", "K").expect("compatible");
        assert!(close(c.apply(0.0), 273.15));
        let k = conversion("K", "degC").expect("compatible");
        assert!(close(k.apply(300.0), 26.85));
    }

    #[test]
    fn incompatible_dimensions_are_rejected() {
        let err = conversion("kg m-2 s-1", "W m-2").expect_err("mass flux vs energy flux");
        assert!(matches!(err, ConfrontError::UnitMismatch { .. }));
        assert!(conversion("furlong", "m").is_err());
    }

    #[test]
    fn identical_strings_are_identity_even_if_unknown() {
        assert!(conversion("furlong", "furlong").expect("same").is_identity());
    }
}
