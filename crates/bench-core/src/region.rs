use serde::{Deserialize, Serialize};

/// A named latitude/longitude box scores are reported over.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    /// `[south, north]` in degrees.
    pub lat: [f64; 2],
    /// `[west, east]` in degrees, -180..180.
    pub lon: [f64; 2],
}

impl Region {
    pub const GLOBAL: &'static str = "global";

    pub fn global() -> Self {
        Self {
            name: Self::GLOBAL.to_string(),
            lat: [-90.0, 90.0],
            lon: [-180.0, 180.0],
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        let lon = if lon > 180.0 { lon - 360.0 } else { lon };
        lat >= self.lat[0] && lat <= self.lat[1] && lon >= self.lon[0] && lon <= self.lon[1]
    }

    /// Suffix carried by every per-region variable, e.g. `_over_global`.
    pub fn tag(&self) -> String {
        format!("_over_{}", self.name)
    }
}
