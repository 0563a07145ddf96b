use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::units::conversion;
use crate::{atomic_write_bytes, ConfrontError, Result};

/// Spatial layout of a variable's cells.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Grid {
    /// A single value per time sample.
    #[default]
    None,
    /// A regular lat/lon grid, cells stored lat-major.
    Spatial { lat: Vec<f64>, lon: Vec<f64> },
    /// Scattered measurement sites, `lat[i]`/`lon[i]` per site.
    Sites { lat: Vec<f64>, lon: Vec<f64> },
}

impl Grid {
    pub fn ncell(&self) -> usize {
        match self {
            Grid::None => 1,
            Grid::Spatial { lat, lon } => lat.len() * lon.len(),
            Grid::Sites { lat, .. } => lat.len(),
        }
    }

    /// Center coordinates of cell `c`.
    pub fn cell_coords(&self, c: usize) -> Option<(f64, f64)> {
        match self {
            Grid::None => None,
            Grid::Spatial { lat, lon } => {
                let nlon = lon.len();
                if nlon == 0 {
                    return None;
                }
                Some((*lat.get(c / nlon)?, *lon.get(c % nlon)?))
            }
            Grid::Sites { lat, lon } => Some((*lat.get(c)?, *lon.get(c)?)),
        }
    }
}

/// A masked array over `time × cells`, stored time-major. Masked entries are
/// `None`. Times are days since 1850-01-01.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Vec<f64>>,
    #[serde(default)]
    pub grid: Grid,
    pub data: Vec<Option<f64>>,
    /// Land-area fraction per cell, spatial grids only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<Vec<f64>>,
}

impl Variable {
    pub fn new(
        name: impl Into<String>,
        unit: impl Into<String>,
        time: Option<Vec<f64>>,
        grid: Grid,
        data: Vec<Option<f64>>,
    ) -> Result<Self> {
        let var = Self {
            name: name.into(),
            unit: unit.into(),
            time,
            grid,
            data,
            area: None,
        };
        var.validate()?;
        Ok(var)
    }

    pub fn scalar(name: impl Into<String>, unit: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            time: None,
            grid: Grid::None,
            data: vec![Some(value)],
            area: None,
        }
    }

    pub fn with_area(mut self, area: Vec<f64>) -> Result<Self> {
        self.area = Some(area);
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| ConfrontError::InvalidVariable {
            name: self.name.clone(),
            reason,
        };
        if let Grid::Sites { lat, lon } = &self.grid {
            if lat.len() != lon.len() {
                return Err(invalid(format!(
                    "site coordinates differ in length ({} lat, {} lon)",
                    lat.len(),
                    lon.len()
                )));
            }
        }
        let expected = self.ntime() * self.ncell();
        if self.data.len() != expected {
            return Err(invalid(format!(
                "data length {} does not match {} times x {} cells",
                self.data.len(),
                self.ntime(),
                self.ncell()
            )));
        }
        if let Some(time) = &self.time {
            if time.windows(2).any(|w| w[1] < w[0]) {
                return Err(invalid("time axis is not sorted".to_string()));
            }
        }
        if let Some(area) = &self.area {
            if !self.is_spatial() || area.len() != self.ncell() {
                return Err(invalid(format!(
                    "land fraction needs one value per grid cell, got {}",
                    area.len()
                )));
            }
        }
        Ok(())
    }

    pub fn ntime(&self) -> usize {
        self.time.as_ref().map_or(1, Vec::len)
    }

    pub fn ncell(&self) -> usize {
        self.grid.ncell()
    }

    /// Number of sites, for site-based variables.
    pub fn ndata(&self) -> Option<usize> {
        match &self.grid {
            Grid::Sites { lat, .. } => Some(lat.len()),
            _ => None,
        }
    }

    pub fn is_spatial(&self) -> bool {
        matches!(self.grid, Grid::Spatial { .. })
    }

    pub fn is_temporal(&self) -> bool {
        self.time.is_some()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn first_time(&self) -> Option<f64> {
        self.time.as_ref().and_then(|t| t.first().copied())
    }

    pub fn last_time(&self) -> Option<f64> {
        self.time.as_ref().and_then(|t| t.last().copied())
    }

    pub fn get(&self, t: usize, c: usize) -> Option<f64> {
        self.data.get(t * self.ncell() + c).copied().flatten()
    }

    /// Min and max over unmasked, finite values.
    pub fn value_range(&self) -> Option<(f64, f64)> {
        self.data
            .iter()
            .flatten()
            .filter(|v| v.is_finite())
            .fold(None, |acc, &v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }

    /// Keeps time samples `begin..end`.
    pub fn trim_time(&mut self, begin: usize, end: usize) -> Result<()> {
        let ncell = self.ncell();
        let name = self.name.clone();
        let time = self.time.as_mut().ok_or_else(|| ConfrontError::InvalidVariable {
            name: name.clone(),
            reason: "cannot trim a variable without a time axis".to_string(),
        })?;
        if begin > end || end > time.len() {
            return Err(ConfrontError::InvalidVariable {
                name,
                reason: format!("trim range {}..{} outside {} samples", begin, end, time.len()),
            });
        }
        time.truncate(end);
        time.drain(..begin);
        self.data.truncate(end * ncell);
        self.data.drain(..begin * ncell);
        Ok(())
    }

    /// Masks every cell whose land fraction is below `threshold`, across all
    /// time samples. Returns false when the variable has no land fraction.
    pub fn mask_low_land_fraction(&mut self, threshold: f64) -> bool {
        let Some(area) = self.area.as_ref() else {
            return false;
        };
        let ncell = area.len();
        let drop: Vec<bool> = area.iter().map(|a| *a < threshold).collect();
        for (i, value) in self.data.iter_mut().enumerate() {
            if drop[i % ncell] {
                *value = None;
            }
        }
        true
    }

    /// Samples a spatial variable at the cells of `target` by nearest grid
    /// point. The result keeps this variable's time axis and unit. `target`
    /// must be a grid or a set of sites.
    pub fn sample_onto(&self, target: &Grid) -> Result<Variable> {
        let Grid::Spatial { lat, lon } = &self.grid else {
            return Err(ConfrontError::InvalidVariable {
                name: self.name.clone(),
                reason: "nearest-cell sampling needs a spatial grid".to_string(),
            });
        };
        if lat.is_empty() || lon.is_empty() {
            return Err(ConfrontError::InvalidVariable {
                name: self.name.clone(),
                reason: "grid has no cells".to_string(),
            });
        }
        if matches!(target, Grid::None) {
            return Err(ConfrontError::InvalidVariable {
                name: self.name.clone(),
                reason: "a gridless target has no cells to sample at".to_string(),
            });
        }
        let ncell = target.ncell();
        let source_cells = (0..ncell)
            .map(|c| {
                let (y, x) = target.cell_coords(c).ok_or_else(|| ConfrontError::InvalidVariable {
                    name: self.name.clone(),
                    reason: format!("target cell {} has no coordinates", c),
                })?;
                Ok(nearest_index(lat, y) * lon.len() + nearest_index(lon, x))
            })
            .collect::<Result<Vec<usize>>>()?;
        let mut data = Vec::with_capacity(self.ntime() * ncell);
        for t in 0..self.ntime() {
            data.extend(source_cells.iter().map(|&c| self.get(t, c)));
        }
        let area = match (&self.area, target) {
            (Some(area), Grid::Spatial { .. }) => {
                Some(source_cells.iter().map(|&c| area[c]).collect())
            }
            _ => None,
        };
        Ok(Variable {
            name: self.name.clone(),
            unit: self.unit.clone(),
            time: self.time.clone(),
            grid: target.clone(),
            data,
            area,
        })
    }

    /// Rescales the data into `target` in place.
    pub fn convert(&mut self, target: &str) -> Result<()> {
        let conv = conversion(&self.unit, target)?;
        if !conv.is_identity() {
            for value in self.data.iter_mut().flatten() {
                *value = conv.apply(*value);
            }
        }
        self.unit = target.to_string();
        Ok(())
    }
}

/// Index of the entry in `axis` closest to `value`, first one on ties.
pub fn nearest_index(axis: &[f64], value: f64) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (i, a) in axis.iter().enumerate() {
        let dist = (a - value).abs();
        if dist < best_dist {
            best = i;
            best_dist = dist;
        }
    }
    best
}

/// On-disk container for one or more variables.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VariableFile {
    pub variables: Vec<Variable>,
}

impl VariableFile {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| ConfrontError::io(path, e))?;
        let file: VariableFile =
            serde_json::from_slice(&bytes).map_err(|e| ConfrontError::json(path, e))?;
        for var in &file.variables {
            var.validate()?;
        }
        Ok(file)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| ConfrontError::json(path, e))?;
        atomic_write_bytes(path, &bytes)
    }

    /// Finds `name`, falling back to the alternate names in order.
    pub fn find(&self, name: &str, alternates: &[String]) -> Option<&Variable> {
        std::iter::once(name)
            .chain(alternates.iter().map(String::as_str))
            .find_map(|n| self.variables.iter().find(|v| v.name == n))
    }
}
