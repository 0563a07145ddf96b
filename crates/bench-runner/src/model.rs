use anyhow::{anyhow, Result};
use bench_core::{
    distinct_colors, ConfrontError, Grid, Variable, VariableFile, TIME_TOLERANCE_DAYS,
};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Mean sampling step, in days, accepted as monthly.
const MONTHLY_STEP_DAYS: (f64, f64) = (27.0, 32.0);

/// What to pull out of a model's output.
#[derive(Clone, Copy, Debug)]
pub struct ExtractRequest<'a> {
    pub variable: &'a str,
    pub alternates: &'a [String],
    /// Observation sites to sample at, for site-based benchmarks.
    pub sites: Option<&'a Grid>,
    pub initial_time: f64,
    pub final_time: f64,
}

/// Read access to one model's output.
pub trait ModelSource: Send + Sync {
    fn extract_time_series(
        &self,
        model: &str,
        request: &ExtractRequest<'_>,
    ) -> Result<Variable, ConfrontError>;
}

pub struct ModelResult {
    pub name: String,
    pub color: [f64; 3],
    source: Box<dyn ModelSource>,
}

impl ModelResult {
    pub fn new(name: impl Into<String>, source: Box<dyn ModelSource>) -> Self {
        Self {
            name: name.into(),
            color: [0.0, 0.0, 0.0],
            source,
        }
    }

    pub fn with_color(mut self, color: [f64; 3]) -> Self {
        self.color = color;
        self
    }

    pub fn extract_time_series(
        &self,
        request: &ExtractRequest<'_>,
    ) -> Result<Variable, ConfrontError> {
        self.source.extract_time_series(&self.name, request)
    }
}

impl std::fmt::Debug for ModelResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelResult")
            .field("name", &self.name)
            .field("color", &self.color)
            .finish()
    }
}

/// A model directory holding variable files (`*.json`).
#[derive(Clone, Debug)]
pub struct JsonModelSource {
    dir: PathBuf,
}

impl JsonModelSource {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn find(
        &self,
        variable: &str,
        alternates: &[String],
    ) -> Result<Option<Variable>, ConfrontError> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
            .collect();
        files.sort();
        for path in files {
            let file = VariableFile::load(&path)?;
            if let Some(var) = file.find(variable, alternates) {
                return Ok(Some(var.clone()));
            }
        }
        Ok(None)
    }
}

impl ModelSource for JsonModelSource {
    fn extract_time_series(
        &self,
        model: &str,
        request: &ExtractRequest<'_>,
    ) -> Result<Variable, ConfrontError> {
        let not_found = || ConfrontError::VarNotInModel {
            model: model.to_string(),
            variable: request.variable.to_string(),
        };
        let mut var = self
            .find(request.variable, request.alternates)?
            .ok_or_else(not_found)?;
        let off_scale = || ConfrontError::VarNotOnTimeScale {
            model: model.to_string(),
            variable: request.variable.to_string(),
            t0: request.initial_time,
            tf: request.final_time,
        };
        let time = var.time.clone().ok_or_else(off_scale)?;
        if time.len() >= 2 {
            let step = (time[time.len() - 1] - time[0]) / (time.len() - 1) as f64;
            if step < MONTHLY_STEP_DAYS.0 || step > MONTHLY_STEP_DAYS.1 {
                return Err(ConfrontError::VarNotMonthly {
                    model: model.to_string(),
                    variable: request.variable.to_string(),
                    step_days: step,
                });
            }
        }
        let lo = request.initial_time - TIME_TOLERANCE_DAYS;
        let hi = request.final_time + TIME_TOLERANCE_DAYS;
        let begin = time.iter().position(|t| *t >= lo).ok_or_else(off_scale)?;
        let end = time.iter().rposition(|t| *t <= hi).map(|i| i + 1).unwrap_or(0);
        if end <= begin {
            return Err(off_scale());
        }
        var.trim_time(begin, end)?;

        if let Some(sites) = request.sites {
            if var.is_spatial() {
                var = var.sample_onto(sites)?;
            } else if &var.grid != sites {
                return Err(ConfrontError::AreasNotInModel {
                    model: model.to_string(),
                    variable: request.variable.to_string(),
                });
            }
        }
        Ok(var)
    }
}

/// Lists model directories directly under `models_dir`, keeps the ones named
/// in `only` (all when `None`), sorts them case-insensitively and assigns
/// each a distinct color.
pub fn discover_models(models_dir: &Path, only: Option<&[String]>) -> Result<Vec<ModelResult>> {
    if !models_dir.is_dir() {
        return Err(anyhow!("models directory not found: {}", models_dir.display()));
    }
    let mut found: Vec<(String, PathBuf)> = Vec::new();
    for entry in WalkDir::new(models_dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(only) = only {
            if !only.iter().any(|m| m == &name) {
                continue;
            }
        }
        found.push((name, entry.into_path()));
    }
    found.sort_by_key(|(name, _)| name.to_uppercase());
    let colors = distinct_colors(found.len());
    Ok(found
        .into_iter()
        .zip(colors)
        .map(|((name, dir), color)| {
            ModelResult::new(name, Box::new(JsonModelSource::new(&dir))).with_color(color)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{monthly_times, temp_dir};
    use bench_core::ensure_dir;
    use std::fs;

    fn write_model(dir: &Path, var: Variable) {
        ensure_dir(dir).expect("model dir");
        VariableFile {
            variables: vec![var],
        }
        .write(&dir.join(format!("{}.json", "output")))
        .expect("write");
    }

    fn spatial_gpp(times: Vec<f64>) -> Variable {
        let n = times.len() * 4;
        Variable::new(
            "gpp",
            "kg m-2 s-1",
            Some(times),
            Grid::Spatial {
                lat: vec![-45.0, 45.0],
                lon: vec![-90.0, 90.0],
            },
            (0..n).map(|i| Some(i as f64)).collect(),
        )
        .expect("valid")
    }

    #[test]
    fn discovery_sorts_case_insensitively_and_filters() {
        let root = temp_dir("discover");
        for name in ["inmcm4", "CanESM2", "bcc-csm1-1"] {
            ensure_dir(&root.join(name)).expect("dir");
        }
        fs::write(root.join("README"), "not a model").expect("file");
        let models = discover_models(&root, None).expect("discover");
        let names: Vec<_> = models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["bcc-csm1-1", "CanESM2", "inmcm4"]);
        assert_ne!(models[0].color, models[1].color);

        let only = vec!["inmcm4".to_string()];
        let models = discover_models(&root, Some(&only)).expect("discover");
        assert_eq!(models.len(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn extraction_windows_time_and_samples_sites() {
        let root = temp_dir("extract");
        write_model(&root, spatial_gpp(monthly_times(0.0, 24)));
        let source = JsonModelSource::new(&root);
        let sites = Grid::Sites {
            lat: vec![40.0],
            lon: vec![80.0],
        };
        let request = ExtractRequest {
            variable: "gpp",
            alternates: &[],
            sites: Some(&sites),
            initial_time: 365.0,
            final_time: 700.0,
        };
        let var = source.extract_time_series("m", &request).expect("extract");
        assert_eq!(var.ndata(), Some(1));
        let time = var.time.as_ref().expect("time");
        assert!(time.first().copied().expect("first") >= 365.0 - TIME_TOLERANCE_DAYS);
        assert!(time.last().copied().expect("last") <= 700.0 + TIME_TOLERANCE_DAYS);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn extraction_classifies_failures() {
        let root = temp_dir("extract_fail");
        write_model(&root, spatial_gpp(vec![0.0, 1.0, 2.0]));
        let source = JsonModelSource::new(&root);
        let mut request = ExtractRequest {
            variable: "gpp",
            alternates: &[],
            sites: None,
            initial_time: 0.0,
            final_time: 2.0,
        };
        let err = source.extract_time_series("m", &request).expect_err("daily data");
        assert!(matches!(err, ConfrontError::VarNotMonthly { .. }));

        request.variable = "nee";
        let err = source.extract_time_series("m", &request).expect_err("absent");
        assert!(matches!(err, ConfrontError::VarNotInModel { .. }));

        write_model(&root, spatial_gpp(monthly_times(0.0, 12)));
        request.variable = "gpp";
        request.initial_time = 5000.0;
        request.final_time = 6000.0;
        let err = source.extract_time_series("m", &request).expect_err("out of range");
        assert!(matches!(err, ConfrontError::VarNotOnTimeScale { .. }));
        let _ = fs::remove_dir_all(root);
    }
}
