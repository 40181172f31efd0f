//! Bulk ingestion across datasets
//!
//! Datasets run strictly one after another. The first dataset that does not
//! finish clean stops the run, so partial failures never pile up across a
//! long list of datasets unnoticed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::jobs::JobStore;
use crate::orchestrator::{
    DatasetOrchestrator, OrchestrationResult, OrchestrationStatus, ProcessingMode, WorkerLauncher,
};
use crate::processor::ProcessorKind;

/// Overall verdict of a bulk run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingResult {
    /// Every requested dataset ran and is clean
    Success,
    /// Some dataset is clean, but not all ran or some failed
    PartialSuccess,
    /// No dataset is clean
    Failure,
    /// Interrupted before all datasets ran, with nothing failed
    Cancelled,
}

impl std::fmt::Display for ProcessingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessingResult::Success => "SUCCESS",
            ProcessingResult::PartialSuccess => "PARTIAL_SUCCESS",
            ProcessingResult::Failure => "FAILURE",
            ProcessingResult::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetResult {
    pub dataset: String,
    pub processor: ProcessorKind,
    pub orchestration: OrchestrationResult,
}

impl DatasetResult {
    pub fn is_clean(&self) -> bool {
        self.orchestration.is_clean()
    }

    fn has_failures(&self) -> bool {
        self.orchestration.status == OrchestrationStatus::Failed
            || self.orchestration.failed_files > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkIngestResult {
    pub overall: ProcessingResult,
    /// Datasets asked for, in run order
    pub requested: Vec<String>,
    /// Datasets that ran, in run order
    pub datasets: Vec<DatasetResult>,
    pub total_processing_time: Duration,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Totals over every dataset that ran
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkSummary {
    pub datasets_requested: usize,
    pub datasets_attempted: usize,
    pub datasets_clean: usize,
    pub total_files: usize,
    pub successful_files: u64,
    pub failed_files: u64,
    pub skipped_files: u64,
    pub total_records: i64,
    /// Successful files as a percentage of discovered files
    pub success_rate: f64,
}

impl BulkIngestResult {
    pub fn summary(&self) -> BulkSummary {
        let mut summary = BulkSummary {
            datasets_requested: self.requested.len(),
            datasets_attempted: self.datasets.len(),
            ..BulkSummary::default()
        };
        for d in &self.datasets {
            let o = &d.orchestration;
            if d.is_clean() {
                summary.datasets_clean += 1;
            }
            summary.total_files += o.total_files;
            summary.successful_files += o.successful_files;
            summary.failed_files += o.failed_files;
            summary.skipped_files += o.skipped_files;
            summary.total_records += o.total_records;
        }
        if summary.total_files > 0 {
            summary.success_rate =
                summary.successful_files as f64 / summary.total_files as f64 * 100.0;
        }
        summary
    }

    /// Datasets that were requested but never started
    pub fn not_started(&self) -> Vec<&str> {
        self.requested
            .iter()
            .skip(self.datasets.len())
            .map(String::as_str)
            .collect()
    }
}

/// Verdict for `results` out of `requested` datasets
pub fn verdict(requested: usize, results: &[DatasetResult], cancelled: bool) -> ProcessingResult {
    let clean = results.iter().filter(|r| r.is_clean()).count();
    if clean == requested && results.len() == requested {
        ProcessingResult::Success
    } else if cancelled && !results.iter().any(DatasetResult::has_failures) {
        ProcessingResult::Cancelled
    } else if clean > 0 {
        ProcessingResult::PartialSuccess
    } else {
        ProcessingResult::Failure
    }
}

pub struct BulkIngestController {
    config: IngestConfig,
    store: JobStore,
    launcher: Arc<dyn WorkerLauncher>,
    cancel: CancellationToken,
}

impl BulkIngestController {
    pub fn new(
        config: IngestConfig,
        store: JobStore,
        launcher: Arc<dyn WorkerLauncher>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            launcher,
            cancel,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Reject unknown datasets, missing source directories and missing processors
    pub fn preflight(&self, datasets: &[String]) -> Result<()> {
        for name in datasets {
            let dataset = self.config.dataset(name)?;
            if !dataset.source_dir.is_dir() {
                return Err(IngestError::config(format!(
                    "dataset {}: source_dir {} is not a directory",
                    name,
                    dataset.source_dir.display()
                )));
            }
            self.launcher.check_dataset(name)?;
        }
        Ok(())
    }

    /// Run `datasets` in order, or every enabled dataset when empty
    ///
    /// Returns an error only for configuration problems found before any
    /// dataset starts.
    pub async fn run(&self, datasets: &[String], mode: ProcessingMode) -> Result<BulkIngestResult> {
        let requested: Vec<String> = if datasets.is_empty() {
            self.config.enabled_datasets()
        } else {
            datasets.to_vec()
        };
        self.preflight(&requested)?;

        let start_time = Utc::now();
        let started = Instant::now();
        info!(datasets = ?requested, mode = %mode, "Starting bulk ingestion");

        let mut results = Vec::with_capacity(requested.len());
        for name in &requested {
            if self.cancel.is_cancelled() {
                warn!(dataset = %name, "Interrupted, not starting dataset");
                break;
            }
            let dataset = self.config.dataset(name)?;

            let orchestrator = DatasetOrchestrator::new(
                self.store.clone(),
                name.clone(),
                dataset.clone(),
                self.config.processing.clone(),
                Arc::clone(&self.launcher),
                self.cancel.clone(),
            );
            let orchestration = orchestrator.process_dataset(mode).await;
            let result = DatasetResult {
                dataset: name.clone(),
                processor: dataset.processor,
                orchestration,
            };
            let clean = result.is_clean();
            let status = result.orchestration.status;
            results.push(result);

            if !clean {
                if status == OrchestrationStatus::Interrupted {
                    warn!(dataset = %name, "Dataset interrupted, stopping");
                } else {
                    error!(dataset = %name, status = ?status, "Dataset did not finish clean, stopping");
                }
                break;
            }
        }

        let overall = verdict(requested.len(), &results, self.cancel.is_cancelled());
        let result = BulkIngestResult {
            overall,
            requested,
            datasets: results,
            total_processing_time: started.elapsed(),
            start_time,
            end_time: Utc::now(),
        };

        let summary = result.summary();
        info!(
            overall = %result.overall,
            attempted = summary.datasets_attempted,
            requested = summary.datasets_requested,
            clean = summary.datasets_clean,
            files = summary.total_files,
            successful = summary.successful_files,
            failed = summary.failed_files,
            success_rate = summary.success_rate,
            elapsed_secs = result.total_processing_time.as_secs_f64(),
            "Bulk ingestion finished"
        );
        if !result.not_started().is_empty() {
            warn!(not_started = ?result.not_started(), "Datasets not started");
        }
        Ok(result)
    }

    pub async fn reset_failed_files(&self, dataset: &str, error_pattern: Option<&str>) -> Result<u64> {
        let reset = self.store.reset_failed_files(dataset, error_pattern).await?;
        info!(dataset = %dataset, pattern = ?error_pattern, reset, "Reset failed files");
        Ok(reset)
    }

    pub async fn reset_stuck_files(&self, dataset: &str, timeout: Duration) -> Result<u64> {
        let reset = self.store.reset_stuck_files(dataset, timeout).await?;
        info!(dataset = %dataset, timeout_secs = timeout.as_secs(), reset, "Reset stuck files");
        Ok(reset)
    }

    pub async fn cleanup_old_records(&self, days: u32) -> Result<u64> {
        let deleted = self.store.cleanup_old_records(days).await?;
        info!(days, deleted, "Cleaned up old records");
        Ok(deleted)
    }
}
