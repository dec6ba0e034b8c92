use thiserror::Error;

/// Errors raised while building or running a capsule network.
#[derive(Debug, Error)]
pub enum CapsError {
    #[error("{layer}: shape mismatch, expected {expected}, found {found}")]
    ShapeMismatch {
        layer: String,
        expected: String,
        found: String,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unknown preset `{0}`")]
    UnknownPreset(String),
    #[error("{layer}: numerical instability after routing ({detail})")]
    NumericalInstability { layer: String, detail: String },
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
}

impl CapsError {
    pub fn shape(layer: impl Into<String>, expected: impl ToString, found: impl ToString) -> Self {
        CapsError::ShapeMismatch {
            layer: layer.into(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CapsError>;
