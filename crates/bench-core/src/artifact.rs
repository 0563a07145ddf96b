use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{atomic_write_bytes, canonical_json_digest, ConfrontError, Result, Variable};

pub const ARTIFACT_EXT: &str = "json";
pub const BENCHMARK_NAME: &str = "Benchmark";
pub const BENCHMARK_COLOR: [f64; 3] = [0.5, 0.5, 0.5];

const SCHEMA_VERSION: &str = "confront_artifact_v1";

/// A metric variable plus the range of its unmasked values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredVariable {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub variable: Variable,
}

impl StoredVariable {
    pub fn new(variable: Variable) -> Self {
        let range = variable.value_range();
        Self {
            min: range.map(|r| r.0),
            max: range.map(|r| r.1),
            variable,
        }
    }

    pub fn unit(&self) -> &str {
        &self.variable.unit
    }
}

/// The persisted results of confronting one model (or the benchmark itself)
/// with one observational dataset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub schema_version: String,
    pub name: String,
    pub color: [f64; 3],
    pub created_at: String,
    #[serde(default)]
    pub digest: String,
    pub variables: BTreeMap<String, StoredVariable>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, color: [f64; 3]) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            name: name.into(),
            color,
            created_at: Utc::now().to_rfc3339(),
            digest: String::new(),
            variables: BTreeMap::new(),
        }
    }

    pub fn benchmark() -> Self {
        Self::new(BENCHMARK_NAME, BENCHMARK_COLOR)
    }

    /// `<output_dir>/<confrontation>_<model>.json`
    pub fn path_for(output_dir: &Path, confrontation: &str, model: &str) -> PathBuf {
        output_dir.join(format!("{}_{}.{}", confrontation, model, ARTIFACT_EXT))
    }

    /// Inserts or replaces a variable, keyed by its name.
    pub fn insert(&mut self, variable: Variable) {
        self.variables
            .insert(variable.name.clone(), StoredVariable::new(variable));
    }

    pub fn get(&self, name: &str) -> Option<&StoredVariable> {
        self.variables.get(name)
    }

    /// The value of a single-valued variable.
    pub fn scalar(&self, name: &str) -> Option<f64> {
        let stored = self.variables.get(name)?;
        if stored.variable.size() != 1 {
            return None;
        }
        stored.variable.data[0]
    }

    fn content_digest(&self) -> String {
        canonical_json_digest(&json!({
            "name": self.name,
            "color": self.color,
            "variables": self.variables,
        }))
    }

    /// Stamps the digest and replaces `path` atomically.
    pub fn write(&mut self, path: &Path) -> Result<()> {
        self.digest = self.content_digest();
        let bytes =
            serde_json::to_vec_pretty(self).map_err(|e| ConfrontError::json(path, e))?;
        atomic_write_bytes(path, &bytes)
    }

    /// Reads an artifact and checks its digest.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| ConfrontError::io(path, e))?;
        let artifact: Artifact =
            serde_json::from_slice(&bytes).map_err(|e| ConfrontError::json(path, e))?;
        if artifact.schema_version != SCHEMA_VERSION {
            return Err(ConfrontError::CorruptArtifact {
                path: path.to_path_buf(),
                reason: format!("unknown schema_version {}", artifact.schema_version),
            });
        }
        let expected = artifact.content_digest();
        if artifact.digest != expected {
            return Err(ConfrontError::CorruptArtifact {
                path: path.to_path_buf(),
                reason: "digest mismatch".to_string(),
            });
        }
        Ok(artifact)
    }

    /// True when `path` holds a complete, verifiable artifact.
    pub fn is_valid(path: &Path) -> bool {
        path.is_file() && Self::load(path).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{temp_dir, Grid};

    fn sample() -> Artifact {
        let mut artifact = Artifact::new("CLM4", [0.1, 0.2, 0.3]);
        artifact.insert(Variable::scalar("bias_score_over_global", "1", 0.8));
        artifact.insert(
            Variable::new(
                "bias_of_gpp",
                "g m-2 d-1",
                None,
                Grid::Sites {
                    lat: vec![0.0, 1.0, 2.0],
                    lon: vec![0.0, 1.0, 2.0],
                },
                vec![Some(-2.0), None, Some(3.5)],
            )
            .expect("valid"),
        );
        artifact
    }

    #[test]
    fn stored_range_ignores_masked_values() {
        let artifact = sample();
        let bias = artifact.get("bias_of_gpp").expect("bias");
        assert_eq!(bias.min, Some(-2.0));
        assert_eq!(bias.max, Some(3.5));
        assert_eq!(artifact.scalar("bias_score_over_global"), Some(0.8));
        assert_eq!(artifact.scalar("bias_of_gpp"), None);
    }

    #[test]
    fn write_then_load_verifies_digest() {
        let dir = temp_dir("artifact");
        let path = Artifact::path_for(&dir, "GPPFluxnet", "CLM4");
        assert!(path.ends_with("GPPFluxnet_CLM4.json"));
        let mut artifact = sample();
        artifact.write(&path).expect("write");
        let loaded = Artifact::load(&path).expect("load");
        assert_eq!(loaded, artifact);
        assert!(Artifact::is_valid(&path));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn tampered_or_truncated_files_are_not_valid() {
        let dir = temp_dir("artifact_bad");
        let path = dir.join("GPP_CLM4.json");
        let mut artifact = sample();
        artifact.write(&path).expect("write");
        let text = fs::read_to_string(&path).expect("read");
        fs::write(&path, text.replace("0.8", "0.9")).expect("tamper");
        let err = Artifact::load(&path).expect_err("digest must fail");
        assert!(matches!(err, ConfrontError::CorruptArtifact { .. }));
        fs::write(&path, &text[..text.len() / 2]).expect("truncate");
        assert!(!Artifact::is_valid(&path));
        assert!(!Artifact::is_valid(&dir.join("missing.json")));
        let _ = fs::remove_dir_all(dir);
    }
}
