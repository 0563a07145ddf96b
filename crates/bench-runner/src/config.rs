use anyhow::{anyhow, Context, Result};
use bench_core::Region;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::confrontation::Confrontation;

/// Metric kind (`bias_score`, ...) to its weight in the overall score.
pub type Weights = BTreeMap<String, f64>;

pub fn default_weights() -> Weights {
    [
        ("bias_score", 1.0),
        ("rmse_score", 2.0),
        ("shift_score", 1.0),
        ("iav_score", 1.0),
        ("sd_score", 1.0),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_build_dir() -> PathBuf {
    PathBuf::from("_build")
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("MODELS")
}

fn default_colormap() -> String {
    "jet".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BenchmarkConfig {
    #[serde(default = "default_build_dir")]
    pub build_dir: PathBuf,
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    #[serde(default)]
    pub regions: Vec<Region>,
    #[serde(default)]
    pub weights: Weights,
    pub confrontations: Vec<ConfrontationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfrontationConfig {
    pub name: String,
    pub source: PathBuf,
    pub variable: String,
    #[serde(default)]
    pub alternate_vars: Vec<String>,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default = "default_colormap")]
    pub colormap: String,
    #[serde(default)]
    pub land: bool,
    #[serde(default)]
    pub weights: Weights,
}

/// Which part of the configured benchmark a run covers.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub models: Option<Vec<String>>,
    pub confrontations: Option<Vec<String>>,
    pub regions: Vec<String>,
}

pub fn load_config(path: &Path) -> Result<BenchmarkConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading benchmark config {}", path.display()))?;
    let config: BenchmarkConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing benchmark config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn check_weights(owner: &str, weights: &Weights) -> Result<()> {
    for (kind, w) in weights {
        if !(w.is_finite() && *w > 0.0) {
            return Err(anyhow!("{}: weight for {} must be positive, got {}", owner, kind, w));
        }
    }
    Ok(())
}

impl BenchmarkConfig {
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        let mut names = BTreeSet::new();
        for c in &self.confrontations {
            if c.name.is_empty() || c.name.contains('/') {
                errors.push(format!("invalid confrontation name '{}'", c.name));
            }
            if !names.insert(c.name.as_str()) {
                errors.push(format!("duplicate confrontation name '{}'", c.name));
            }
            if let Err(e) = check_weights(&c.name, &c.weights) {
                errors.push(e.to_string());
            }
        }
        if let Err(e) = check_weights("weights", &self.weights) {
            errors.push(e.to_string());
        }
        let mut regions = BTreeSet::new();
        for r in &self.regions {
            if r.name == Region::GLOBAL {
                errors.push("region 'global' is built in and cannot be redefined".to_string());
            }
            if !regions.insert(r.name.as_str()) {
                errors.push(format!("duplicate region '{}'", r.name));
            }
            if r.lat[0] > r.lat[1] || r.lon[0] > r.lon[1] {
                errors.push(format!("region '{}' has inverted bounds", r.name));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("invalid benchmark config: {}", errors.join("; ")))
        }
    }

    /// Looks up region names; `global` is always available.
    pub fn resolve_regions(&self, names: &[String]) -> Result<Vec<Region>> {
        if names.is_empty() {
            return Ok(vec![Region::global()]);
        }
        names
            .iter()
            .map(|name| {
                if name == Region::GLOBAL {
                    return Ok(Region::global());
                }
                self.regions
                    .iter()
                    .find(|r| &r.name == name)
                    .cloned()
                    .ok_or_else(|| anyhow!("unknown region '{}'", name))
            })
            .collect()
    }

    pub fn build_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.build_dir)
    }

    pub fn models_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.models_dir)
    }

    /// Builds the selected confrontations in configuration order. Fails if a
    /// selected confrontation's source data is missing.
    pub fn build_confrontations(
        &self,
        root: &Path,
        selection: &Selection,
    ) -> Result<Vec<Confrontation>> {
        if let Some(wanted) = &selection.confrontations {
            for name in wanted {
                if !self.confrontations.iter().any(|c| &c.name == name) {
                    return Err(anyhow!("unknown confrontation '{}'", name));
                }
            }
        }
        let regions = self.resolve_regions(&selection.regions)?;
        let mut out = Vec::new();
        for c in &self.confrontations {
            if let Some(wanted) = &selection.confrontations {
                if !wanted.contains(&c.name) {
                    continue;
                }
            }
            let mut weights = default_weights();
            weights.extend(self.weights.clone());
            weights.extend(c.weights.clone());
            let output_rel = c
                .output_path
                .clone()
                .unwrap_or_else(|| self.build_dir.join(&c.name));
            let confrontation = Confrontation::new(
                &c.name,
                &root.join(&c.source),
                &c.variable,
                &root.join(&output_rel),
            )?
            .with_longname(derive_longname(&output_rel, &c.name))
            .with_alternate_vars(c.alternate_vars.clone())
            .with_regions(regions.clone())
            .with_weights(weights)
            .with_colormap(&c.colormap)
            .with_land(c.land);
            out.push(confrontation);
        }
        Ok(out)
    }
}

/// Display path of a confrontation: the output path below the build
/// directory without its first (category) component, e.g.
/// `_build/Carbon/GPP/Fluxnet/` → `GPP/Fluxnet`.
pub fn derive_longname(output_path: &Path, name: &str) -> String {
    let raw = output_path.to_string_lossy().replace("//", "/");
    let below = match raw.rfind("_build/") {
        Some(i) => &raw[i + "_build/".len()..],
        None => raw.as_str(),
    };
    let parts: Vec<&str> = below
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    let longname = parts.iter().skip(1).copied().collect::<Vec<_>>().join("/");
    if longname.is_empty() {
        name.to_string()
    } else {
        longname
    }
}
