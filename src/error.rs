use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FwError {
    #[error("feature schema mismatch: model expects {expected:?}, extractor produces {found:?}")]
    SchemaMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("dataset integrity error at row {row}: {reason}")]
    DatasetIntegrity { row: usize, reason: String },

    #[error("dataset not found: {}", .0.display())]
    DatasetNotFound(PathBuf),

    #[error("model not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("strict mode: {count} sample(s) had every probe fail (first: {target})")]
    UnsignaledSample { target: String, count: usize },

    #[error("required probe tools unavailable: {}", .0.join(", "))]
    ToolsUnavailable(Vec<String>),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl FwError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            FwError::ToolsUnavailable(_) => 2,
            FwError::ModelNotFound(_) | FwError::DatasetNotFound(_) => 3,
            FwError::SchemaMismatch { .. } | FwError::DatasetIntegrity { .. } => 4,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, FwError>;
