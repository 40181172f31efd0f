//! Error types shared across ClimaStation crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, ClimaError>;

/// Main error type for the shared library
#[derive(Error, Debug)]
pub enum ClimaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A manifest broke one of the record or ordering rules
    #[error("Manifest integrity error: {0}")]
    ManifestIntegrity(String),
}

impl ClimaError {
    pub fn manifest_integrity(msg: impl Into<String>) -> Self {
        Self::ManifestIntegrity(msg.into())
    }
}
