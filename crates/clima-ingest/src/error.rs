//! Error types for the ingest pipeline
//!
//! The variants mirror how each failure is handled: transient network
//! errors are retried, per-file structural and processing errors are
//! recorded against the job, configuration errors stop the process before
//! any work starts, and job state errors mean two components disagree about
//! who owns a file.

use thiserror::Error;

use crate::jobs::JobStatus;

/// Result type alias for ingest operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Request failed after all retries
    #[error("Network error for {url}: {message}")]
    TransientNetwork { url: String, message: String },

    /// The file's internal layout is not what the processor expects
    #[error("Structural validation failed for '{file}': {message}")]
    StructuralValidation { file: String, message: String },

    #[error("Processing failed for '{file}': {message}")]
    Processing { file: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A transition was attempted on a job that is not in the source state
    #[error("Job state error for {dataset}/{file}: expected {expected}, found {found}")]
    JobState {
        dataset: String,
        file: String,
        expected: JobStatus,
        found: String,
    },

    #[error("Manifest integrity error: {0}")]
    ManifestIntegrity(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// A worker process or task did not return a report
    #[error("Worker {worker_id} failed: {message}")]
    Worker { worker_id: String, message: String },

    #[error(transparent)]
    Common(clima_common::ClimaError),
}

impl From<clima_common::ClimaError> for IngestError {
    fn from(err: clima_common::ClimaError) -> Self {
        match err {
            clima_common::ClimaError::ManifestIntegrity(msg) => Self::ManifestIntegrity(msg),
            other => Self::Common(other),
        }
    }
}

impl IngestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transient(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn structural(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StructuralValidation {
            file: file.into(),
            message: message.into(),
        }
    }

    pub fn processing(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Processing {
            file: file.into(),
            message: message.into(),
        }
    }

    pub fn worker(worker_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Worker {
            worker_id: worker_id.into(),
            message: message.into(),
        }
    }

    /// Process exit code of a command that failed with this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 2,
            Self::ManifestIntegrity(_) => 4,
            _ => 1,
        }
    }
}
