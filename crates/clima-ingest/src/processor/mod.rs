//! Dataset processor capability and registry
//!
//! Implement [`DatasetProcessor`] for each dataset layout. The orchestrator's
//! worker loop is the only caller; it validates a file's structure, then
//! processes it and records the outcome in the job store.

mod archive;

pub use archive::StationArchiveProcessor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{IngestError, Result};

/// Outcome of processing one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub success: bool,
    pub records_processed: i64,
    pub error_message: Option<String>,
}

impl ProcessOutcome {
    pub fn success(records_processed: i64) -> Self {
        Self {
            success: true,
            records_processed,
            error_message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            records_processed: 0,
            error_message: Some(message.into()),
        }
    }
}

/// Per-dataset file handling
#[async_trait]
pub trait DatasetProcessor: Send + Sync {
    /// Cheap check that the file has the layout this processor expects
    ///
    /// `Ok(false)` fails the current attempt with a structural validation
    /// error; `Err` is treated the same way with the error as the message.
    async fn validate_file_structure(&self, path: &Path) -> Result<bool>;

    /// Process one file
    async fn process_file(&self, path: &Path) -> Result<ProcessOutcome>;

    /// Descriptive metadata about a file, for diagnostics
    async fn extract_metadata(&self, path: &Path) -> Result<serde_json::Value>;

    /// Glob patterns, relative to the dataset root, of files this processor handles
    fn expected_file_patterns(&self) -> Vec<String>;
}

/// Built-in processor implementations, selectable from configuration
///
/// Worker processes rebuild their processor from this value, since live
/// processor objects cannot cross the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    #[default]
    StationArchive,
}

impl ProcessorKind {
    pub fn build(self) -> Arc<dyn DatasetProcessor> {
        match self {
            ProcessorKind::StationArchive => Arc::new(StationArchiveProcessor::new()),
        }
    }
}

impl std::fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessorKind::StationArchive => f.write_str("station_archive"),
        }
    }
}

/// Processors keyed by dataset name
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn DatasetProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the configured built-in processor for each dataset
    pub fn from_kinds<'a, I>(datasets: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, ProcessorKind)>,
    {
        let mut registry = Self::new();
        for (name, kind) in datasets {
            registry.register(name, kind.build());
        }
        registry
    }

    pub fn register(&mut self, dataset: impl Into<String>, processor: Arc<dyn DatasetProcessor>) {
        self.processors.insert(dataset.into(), processor);
    }

    pub fn get(&self, dataset: &str) -> Result<Arc<dyn DatasetProcessor>> {
        self.processors.get(dataset).cloned().ok_or_else(|| {
            IngestError::config(format!("no processor registered for dataset '{}'", dataset))
        })
    }

    pub fn contains(&self, dataset: &str) -> bool {
        self.processors.contains_key(dataset)
    }

    /// Registered dataset names, sorted
    pub fn datasets(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.processors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("datasets", &self.datasets())
            .finish()
    }
}
