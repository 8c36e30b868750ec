//! Plan and configuration errors.

use thiserror::Error;

pub type PlanResult<T> = Result<T, PlanError>;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid duration `{0}` (expected e.g. 500ms, 30s, 2m, 1h)")]
    InvalidDuration(String),

    #[error("invalid plan: {0}")]
    Invalid(String),
}
