//! Dataset orchestration
//!
//! [`DatasetOrchestrator`] turns the local files of one dataset into jobs,
//! launches workers against the job store, and folds their reports into an
//! [`OrchestrationResult`].
//!
//! ```text
//! discover_files ──► register_files ──► launch N workers ──► collect reports
//!                                          │                     │
//!                                          ▼                     ▼
//!                             claim / process / mark       get_stats
//! ```
//!
//! Ownership of files is decided by the job store alone. With the default
//! [`DispatchStrategy::Claim`] every worker pulls pending files until the
//! queue is empty; [`DispatchStrategy::Partitioned`] hands each worker a
//! contiguous chunk up front but still claims each file before touching it.

mod launcher;
mod partition;
mod worker;

pub use launcher::{worker_main, InProcessLauncher, ProcessLauncher, WorkerLauncher};
pub use partition::partition_files;
pub use worker::{run_worker, WorkerAssignment, WorkerDispatch, WorkerReport, HEARTBEAT_INTERVAL};

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::{DatasetConfig, ProcessingConfig};
use crate::error::{IngestError, Result};
use crate::jobs::{JobStatus, JobStore};

/// How files are handed to workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategy {
    /// Workers pull the oldest pending file until none remain
    #[default]
    Claim,
    /// Static contiguous chunks, one per worker
    Partitioned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Register everything discovered and process whatever is pending
    Bulk,
    /// Skip completed files and give failed ones a fresh retry budget
    Incremental,
}

impl std::fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingMode::Bulk => f.write_str("bulk"),
            ProcessingMode::Incremental => f.write_str("incremental"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Initializing,
    Processing,
    Completed,
    Failed,
    Interrupted,
}

/// Outcome of one `process_dataset` run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub dataset: String,
    pub status: OrchestrationStatus,
    /// Files discovered for this run
    pub total_files: usize,
    pub successful_files: u64,
    /// Jobs of the dataset in terminal `failed` state after the run
    pub failed_files: u64,
    /// Failed attempts during this run, retried ones included
    pub failed_attempts: u64,
    pub skipped_files: u64,
    pub total_records: i64,
    pub processing_time: Duration,
    pub worker_count: usize,
    pub error_message: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl OrchestrationResult {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            status: OrchestrationStatus::Initializing,
            total_files: 0,
            successful_files: 0,
            failed_files: 0,
            failed_attempts: 0,
            skipped_files: 0,
            total_records: 0,
            processing_time: Duration::ZERO,
            worker_count: 0,
            error_message: None,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    /// Completed with no file left in terminal `failed` state
    pub fn is_clean(&self) -> bool {
        self.status == OrchestrationStatus::Completed && self.failed_files == 0
    }

    fn add_report(&mut self, report: &WorkerReport) {
        self.successful_files += report.successful;
        self.failed_attempts += report.failed;
        self.skipped_files += report.skipped;
        self.total_records += report.records;
    }
}

/// Processes one dataset against the shared job store
pub struct DatasetOrchestrator {
    store: JobStore,
    dataset: String,
    config: DatasetConfig,
    processing: ProcessingConfig,
    launcher: Arc<dyn WorkerLauncher>,
    cancel: CancellationToken,
}

impl DatasetOrchestrator {
    pub fn new(
        store: JobStore,
        dataset: impl Into<String>,
        config: DatasetConfig,
        processing: ProcessingConfig,
        launcher: Arc<dyn WorkerLauncher>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            dataset: dataset.into(),
            config,
            processing,
            launcher,
            cancel,
        }
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Local files of the dataset, keyed by their `/`-separated path below `source_dir`
    ///
    /// Incremental mode drops files the store already has as completed.
    pub async fn discover_files(&self, mode: ProcessingMode) -> Result<Vec<String>> {
        let source_dir = &self.config.source_dir;
        if !source_dir.is_dir() {
            return Err(IngestError::config(format!(
                "dataset {}: source_dir {} is not a directory",
                self.dataset,
                source_dir.display()
            )));
        }

        let mut files = match &self.config.manifest {
            Some(manifest) => self.files_from_manifest(manifest)?,
            None => self.files_from_patterns()?,
        };
        files.sort();
        files.dedup();

        if mode == ProcessingMode::Incremental {
            let statuses = self.store.get_file_statuses(&self.dataset).await?;
            let before = files.len();
            files.retain(|f| statuses.get(f) != Some(&JobStatus::Completed));
            debug!(
                dataset = %self.dataset,
                completed = before - files.len(),
                "Skipping completed files"
            );
        }

        info!(
            dataset = %self.dataset,
            mode = %mode,
            files = files.len(),
            "Discovered files"
        );
        Ok(files)
    }

    fn files_from_patterns(&self) -> Result<Vec<String>> {
        let patterns = self
            .config
            .file_patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| {
                    IngestError::config(format!("invalid file pattern '{}': {}", p, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.config.source_dir).follow_links(true) {
            let entry = entry.map_err(|e| {
                IngestError::Io(std::io::Error::other(format!("walking source_dir: {}", e)))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(key) = relative_key(&self.config.source_dir, entry.path()) else {
                continue;
            };
            if patterns.iter().any(|p| p.matches(&key)) {
                files.push(key);
            }
        }
        Ok(files)
    }

    fn files_from_manifest(&self, manifest: &Path) -> Result<Vec<String>> {
        let records = clima_common::manifest::read_manifest(manifest)?;
        let mut missing = 0usize;
        let mut files = Vec::with_capacity(records.len());

        for record in &records {
            let key = record.relative_file_path();
            if self.config.source_dir.join(&key).is_file() {
                files.push(key);
            } else {
                missing += 1;
            }
        }

        if missing > 0 {
            warn!(
                dataset = %self.dataset,
                manifest = %manifest.display(),
                missing,
                "Manifest entries not present locally"
            );
        }
        Ok(files)
    }

    /// Run the dataset to completion, or until cancelled
    ///
    /// Never returns an error: failures are logged and reported through
    /// [`OrchestrationResult::status`] and `error_message`.
    pub async fn process_dataset(&self, mode: ProcessingMode) -> OrchestrationResult {
        let started = Instant::now();
        let mut result = OrchestrationResult::new(&self.dataset);

        if let Err(e) = self.run(mode, &mut result).await {
            error!(dataset = %self.dataset, error = %e, "Dataset processing failed");
            result.status = OrchestrationStatus::Failed;
            result.error_message = Some(e.to_string());
        }

        result.end_time = Some(Utc::now());
        result.processing_time = started.elapsed();

        info!(
            dataset = %result.dataset,
            status = ?result.status,
            total = result.total_files,
            successful = result.successful_files,
            failed = result.failed_files,
            failed_attempts = result.failed_attempts,
            skipped = result.skipped_files,
            records = result.total_records,
            workers = result.worker_count,
            elapsed_secs = result.processing_time.as_secs_f64(),
            "Dataset run finished"
        );
        result
    }

    async fn run(&self, mode: ProcessingMode, result: &mut OrchestrationResult) -> Result<()> {
        let files = self.discover_files(mode).await?;
        result.total_files = files.len();

        if files.is_empty() {
            info!(dataset = %self.dataset, "Nothing to process");
            result.failed_files = self.store.get_stats(&self.dataset).await?.failed as u64;
            result.status = OrchestrationStatus::Completed;
            return Ok(());
        }

        self.store.register_files(&self.dataset, &files).await?;
        if mode == ProcessingMode::Incremental {
            let requeued = self.store.requeue_failed(&self.dataset, &files).await?;
            if requeued > 0 {
                info!(dataset = %self.dataset, requeued, "Requeued failed files");
            }
        }

        let worker_count = self.worker_count(files.len());
        let dispatches: Vec<WorkerDispatch> = match self.processing.dispatch {
            DispatchStrategy::Claim => vec![WorkerDispatch::Claim; worker_count],
            DispatchStrategy::Partitioned => partition_files(&files, worker_count)
                .into_iter()
                .map(WorkerDispatch::Files)
                .collect(),
        };

        result.status = OrchestrationStatus::Processing;
        info!(
            dataset = %self.dataset,
            workers = dispatches.len(),
            launcher = self.launcher.name(),
            dispatch = ?self.processing.dispatch,
            "Launching workers"
        );

        let mut running = FuturesUnordered::new();
        for (index, dispatch) in dispatches.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(dataset = %self.dataset, launched = index, "Interrupted, not launching more workers");
                break;
            }
            let assignment = WorkerAssignment {
                store: self.store.config().clone(),
                dataset: self.dataset.clone(),
                processor: self.config.processor,
                source_dir: self.config.source_dir.clone(),
                worker_id: format!("worker_{}", index),
                dispatch,
            };
            let launcher = Arc::clone(&self.launcher);
            let cancel = self.cancel.clone();
            running.push(async move {
                let worker_id = assignment.worker_id.clone();
                match launcher.launch(assignment, cancel).await {
                    Ok(report) => report,
                    Err(e) => WorkerReport::lost(worker_id, e.to_string()),
                }
            });
        }
        result.worker_count = running.len();

        let mut worker_errors = Vec::new();
        while let Some(report) = running.next().await {
            debug!(
                worker_id = %report.worker_id,
                successful = report.successful,
                failed = report.failed,
                "Worker reported"
            );
            result.add_report(&report);
            if let Some(e) = &report.error {
                worker_errors.push(format!("{}: {}", report.worker_id, e));
            }
        }

        let stats = self.store.get_stats(&self.dataset).await?;
        result.failed_files = stats.failed as u64;
        info!(
            dataset = %self.dataset,
            completed = stats.completed,
            failed = stats.failed,
            pending = stats.pending,
            success_rate = stats.success_rate,
            "Job store totals"
        );

        let unfinished = self.unfinished_files(&files).await?;

        result.status = if self.cancel.is_cancelled() {
            OrchestrationStatus::Interrupted
        } else if !worker_errors.is_empty() {
            result.error_message = Some(worker_errors.join("; "));
            OrchestrationStatus::Failed
        } else if unfinished > 0 {
            warn!(dataset = %self.dataset, unfinished, "Workers finished with files still open");
            result.error_message = Some(format!(
                "{} discovered files still pending or processing after all workers finished",
                unfinished
            ));
            OrchestrationStatus::Failed
        } else {
            OrchestrationStatus::Completed
        };
        Ok(())
    }

    /// Discovered files not yet in a terminal state
    async fn unfinished_files(&self, files: &[String]) -> Result<usize> {
        let statuses = self.store.get_file_statuses(&self.dataset).await?;
        Ok(files
            .iter()
            .filter(|f| statuses.get(*f).is_some_and(|s| !s.is_terminal()))
            .count())
    }

    fn worker_count(&self, files: usize) -> usize {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.processing
            .max_workers
            .min(files)
            .min(parallelism)
            .max(1)
    }
}

/// `/`-separated path of `path` below `root`
fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
