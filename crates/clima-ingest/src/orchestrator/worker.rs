//! Worker entry point
//!
//! A worker receives a [`WorkerAssignment`] made only of plain data, opens
//! its own handle on the job store, and processes files until nothing is
//! left for it. The same function runs inside a child process (see
//! `clima-ingest worker`) or on a tokio task.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{IngestError, Result};
use crate::jobs::{JobStatus, JobStore, JobStoreConfig};
use crate::processor::{DatasetProcessor, ProcessorKind};

/// Interval of session heartbeats while a file is being processed
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// How a worker obtains files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "files")]
pub enum WorkerDispatch {
    /// Pull pending files from the store until none remain
    Claim,
    /// Claim exactly these files, skipping those already owned elsewhere and
    /// going back over any that a failed attempt returned to pending
    Files(Vec<String>),
}

/// Everything a worker needs, serializable across the process boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub store: JobStoreConfig,
    pub dataset: String,
    pub processor: ProcessorKind,
    pub source_dir: PathBuf,
    pub worker_id: String,
    pub dispatch: WorkerDispatch,
}

/// Per-worker totals returned to the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub worker_id: String,
    pub successful: u64,
    /// Failed attempts; a file retried in the same run counts once per attempt
    pub failed: u64,
    pub skipped: u64,
    pub records: i64,
    /// Set when the worker stopped early on an infrastructure or job state error
    pub error: Option<String>,
}

impl WorkerReport {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Self::default()
        }
    }

    /// Report for a worker that never produced one of its own
    pub fn lost(worker_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(worker_id)
        }
    }
}

/// Run one worker to completion
///
/// Per-file failures are recorded in the store and never end the loop, and
/// a claim lost to a stale reclaim counts the file as skipped. Other store
/// errors stop the worker and are returned in [`WorkerReport::error`].
pub async fn run_worker(
    assignment: &WorkerAssignment,
    processor: Arc<dyn DatasetProcessor>,
    cancel: CancellationToken,
) -> WorkerReport {
    let mut report = WorkerReport::new(&assignment.worker_id);

    info!(
        worker_id = %assignment.worker_id,
        dataset = %assignment.dataset,
        processor = %assignment.processor,
        "Worker starting"
    );

    let store = match JobStore::connect(assignment.store.clone()).await {
        Ok(store) => store,
        Err(e) => {
            error!(worker_id = %assignment.worker_id, error = %e, "Worker could not open job store");
            report.error = Some(e.to_string());
            return report;
        },
    };

    let worker = Worker {
        store: &store,
        assignment,
        processor: processor.as_ref(),
        cancel: &cancel,
    };

    if let Err(e) = worker.run(&mut report).await {
        error!(
            worker_id = %assignment.worker_id,
            dataset = %assignment.dataset,
            error = %e,
            "Worker stopped on error"
        );
        report.error = Some(e.to_string());
    }

    if let Err(e) = store.finish_session(&assignment.dataset, &assignment.worker_id).await {
        warn!(worker_id = %assignment.worker_id, error = %e, "Could not close worker session");
    }
    store.close().await;

    info!(
        worker_id = %report.worker_id,
        successful = report.successful,
        failed = report.failed,
        skipped = report.skipped,
        records = report.records,
        "Worker finished"
    );
    report
}

struct Worker<'a> {
    store: &'a JobStore,
    assignment: &'a WorkerAssignment,
    processor: &'a dyn DatasetProcessor,
    cancel: &'a CancellationToken,
}

impl Worker<'_> {
    async fn run(&self, report: &mut WorkerReport) -> Result<()> {
        let dataset = &self.assignment.dataset;
        let worker_id = &self.assignment.worker_id;

        match &self.assignment.dispatch {
            WorkerDispatch::Claim => loop {
                if self.cancel.is_cancelled() {
                    info!(worker_id = %worker_id, "Cancelled, no further claims");
                    break;
                }
                let Some(file) = self.store.claim_next_file(dataset, worker_id).await? else {
                    break;
                };
                self.handle_file(&file, report).await?;
            },
            WorkerDispatch::Files(files) => {
                // Files sent back to pending by a failed attempt get another
                // pass until each is completed, failed or owned elsewhere
                let mut remaining: Vec<&String> = files.iter().collect();
                let mut pass = 0;
                while !remaining.is_empty() {
                    let mut retry = Vec::new();
                    for file in remaining {
                        if self.cancel.is_cancelled() {
                            info!(worker_id = %worker_id, "Cancelled, leaving rest of chunk");
                            return Ok(());
                        }
                        if !self.store.claim_file(dataset, file, worker_id).await? {
                            debug!(worker_id = %worker_id, file = %file, pass, "File not pending, skipping");
                            report.skipped += 1;
                            continue;
                        }
                        if self.handle_file(file, report).await? == Some(JobStatus::Pending) {
                            retry.push(file);
                        }
                    }
                    remaining = retry;
                    pass += 1;
                }
            },
        }
        Ok(())
    }

    /// Process one claimed file and record the outcome
    ///
    /// Returns the job's new status, or `None` when the claim was lost to a
    /// stale reclaim while the file was being processed.
    async fn handle_file(&self, file: &str, report: &mut WorkerReport) -> Result<Option<JobStatus>> {
        let dataset = &self.assignment.dataset;
        let worker_id = &self.assignment.worker_id;
        let path = self.assignment.source_dir.join(file);

        let heartbeat = spawn_heartbeat(
            self.store.clone(),
            dataset.clone(),
            self.assignment.worker_id.clone(),
        );
        let outcome = process_one(self.processor, &path, file).await;
        heartbeat.abort();

        let marked = match &outcome {
            Ok(records) => self
                .store
                .mark_completed(dataset, file, worker_id, *records)
                .await
                .map(|()| JobStatus::Completed),
            Err(e) => self.store.mark_failed(dataset, file, worker_id, &e.to_string()).await,
        };

        let status = match marked {
            Ok(status) => status,
            Err(IngestError::JobState { found, .. }) => {
                warn!(
                    worker_id = %worker_id,
                    file = %file,
                    found = %found,
                    "Claim lost before the outcome was recorded, discarding it"
                );
                report.skipped += 1;
                return Ok(None);
            },
            Err(e) => return Err(e),
        };

        match outcome {
            Ok(records) => {
                report.successful += 1;
                report.records += records;
                debug!(file = %file, records, "File completed");
            },
            Err(_) => {
                report.failed += 1;
                debug!(file = %file, status = %status, "Recorded failed attempt");
            },
        }
        Ok(Some(status))
    }
}

/// Validate then process one file, returning its record count
async fn process_one(processor: &dyn DatasetProcessor, path: &Path, file: &str) -> Result<i64> {
    match processor.validate_file_structure(path).await {
        Ok(true) => {},
        Ok(false) => {
            return Err(IngestError::structural(file, "unexpected file structure"));
        },
        Err(e @ IngestError::StructuralValidation { .. }) => return Err(e),
        Err(e) => return Err(IngestError::structural(file, e.to_string())),
    }

    match processor.process_file(path).await {
        Ok(outcome) if outcome.success => Ok(outcome.records_processed),
        Ok(outcome) => Err(IngestError::processing(
            file,
            outcome
                .error_message
                .unwrap_or_else(|| "processor reported failure".to_string()),
        )),
        Err(e @ IngestError::Processing { .. }) => Err(e),
        Err(e) => Err(IngestError::processing(file, e.to_string())),
    }
}

fn spawn_heartbeat(store: JobStore, dataset: String, worker_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        // First tick fires immediately; the claim already recorded one
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = store.heartbeat(&dataset, &worker_id).await {
                warn!(worker_id = %worker_id, error = %e, "Heartbeat failed");
            }
        }
    })
}
