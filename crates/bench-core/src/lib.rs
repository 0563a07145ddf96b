//! Shared primitives for the confrontation benchmark: masked variables,
//! unit conversion, regions, result artifacts and the error taxonomy.

pub mod artifact;
pub mod color;
pub mod error;
pub mod region;
pub mod units;
pub mod variable;

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub use artifact::{Artifact, StoredVariable, ARTIFACT_EXT, BENCHMARK_NAME};
pub use color::distinct_colors;
pub use error::{ConfrontError, FailureKind};
pub use region::Region;
pub use variable::{Grid, Variable, VariableFile};

pub type Result<T> = std::result::Result<T, ConfrontError>;

/// Maximum spacing, in days, between paired time samples after staging.
pub const TIME_TOLERANCE_DAYS: f64 = 14.0;

/// Land-area fraction below which a grid cell is excluded from land-only
/// scoring.
pub const LAND_FRACTION_THRESHOLD: f64 = 1e-2;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| ConfrontError::io(path, e))
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Digest of a JSON value with object keys in sorted order.
pub fn canonical_json_digest(value: &Value) -> String {
    // serde_json's default map is ordered, so re-serializing is canonical.
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    sha256_bytes(&bytes)
}

/// Writes `bytes` to a sibling temp file, syncs it, then renames it over
/// `path`, so readers never observe a half-written file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&tmp);
        return Err(ConfrontError::io(path, e));
    }
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn temp_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "bench_core_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    ensure_dir(&dir).expect("temp dir");
    dir
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_digest_ignores_insertion_order() {
        let a = json!({"b": 1, "a": [1, 2]});
        let b = json!({"a": [1, 2], "b": 1});
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&b));
        assert!(canonical_json_digest(&a).starts_with("sha256:"));
    }

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp_files() {
        let dir = temp_dir("atomic");
        let path = dir.join("out.json");
        atomic_write_bytes(&path, b"first").expect("first write");
        atomic_write_bytes(&path, b"second").expect("second write");
        assert_eq!(fs::read(&path).expect("read"), b"second");
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
        let _ = fs::remove_dir_all(dir);
    }
}
