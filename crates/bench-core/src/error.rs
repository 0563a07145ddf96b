use std::path::PathBuf;

use serde::Serialize;

/// Errors raised while loading, staging, and scoring a model against a
/// benchmark.
#[derive(Debug, thiserror::Error)]
pub enum ConfrontError {
    #[error(
        "cannot find source data for confrontation {confrontation} at {}; \
         was the data downloaded and is the benchmark root set?",
        path.display()
    )]
    MisplacedData {
        confrontation: String,
        path: PathBuf,
    },
    #[error("variable {variable} not found in model {model}")]
    VarNotInModel { model: String, variable: String },
    #[error("model {model} has no land areas or grid for {variable}")]
    AreasNotInModel { model: String, variable: String },
    #[error("variable {variable} in model {model} is not monthly (mean step {step_days:.1} d)")]
    VarNotMonthly {
        model: String,
        variable: String,
        step_days: f64,
    },
    #[error("variable {variable} in model {model} has no samples in [{t0}, {tf}]")]
    VarNotOnTimeScale {
        model: String,
        variable: String,
        t0: f64,
        tf: f64,
    },
    #[error("time axes do not align: {0}")]
    TimeMismatch(String),
    #[error("site counts differ: observation has {obs}, model has {model}")]
    SiteMismatch { obs: usize, model: usize },
    #[error("cannot convert unit '{from}' to '{to}'")]
    UnitMismatch { from: String, to: String },
    #[error("invalid variable {name}: {reason}")]
    InvalidVariable { name: String, reason: String },
    #[error("corrupt artifact {}: {reason}", path.display())]
    CorruptArtifact { path: PathBuf, reason: String },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Per-pair failures the run loop records and steps over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    VarNotInModel,
    AreasNotInModel,
    VarNotMonthly,
    VarNotOnTimeScale,
    TimeMismatch,
    SiteMismatch,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::VarNotInModel => "VarNotInModel",
            FailureKind::AreasNotInModel => "AreasNotInModel",
            FailureKind::VarNotMonthly => "VarNotMonthly",
            FailureKind::VarNotOnTimeScale => "VarNotOnTimeScale",
            FailureKind::TimeMismatch => "TimeMismatch",
            FailureKind::SiteMismatch => "SiteMismatch",
        }
    }
}

impl ConfrontError {
    /// Returns the recoverable kind, or `None` when the error must abort the
    /// worker.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ConfrontError::VarNotInModel { .. } => Some(FailureKind::VarNotInModel),
            ConfrontError::AreasNotInModel { .. } => Some(FailureKind::AreasNotInModel),
            ConfrontError::VarNotMonthly { .. } => Some(FailureKind::VarNotMonthly),
            ConfrontError::VarNotOnTimeScale { .. } => Some(FailureKind::VarNotOnTimeScale),
            ConfrontError::TimeMismatch(_) => Some(FailureKind::TimeMismatch),
            ConfrontError::SiteMismatch { .. } => Some(FailureKind::SiteMismatch),
            ConfrontError::MisplacedData { .. }
            | ConfrontError::UnitMismatch { .. }
            | ConfrontError::InvalidVariable { .. }
            | ConfrontError::CorruptArtifact { .. }
            | ConfrontError::Io { .. }
            | ConfrontError::Json { .. } => None,
        }
    }

    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        ConfrontError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn json(path: &std::path::Path, source: serde_json::Error) -> Self {
        ConfrontError::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}
