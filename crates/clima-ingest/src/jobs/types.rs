//! Job store records and derived aggregates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row};
use std::path::PathBuf;
use std::time::Duration;

/// Processing state of one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Completed and failed jobs only change through administrative resets
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Settings shared by every handle on one store file
///
/// Serializable so a coordinator can hand it to worker processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStoreConfig {
    pub path: PathBuf,
    pub max_retry_attempts: u32,
    /// A `processing` job older than this is presumed abandoned
    pub claim_timeout: Duration,
    pub busy_timeout: Duration,
    /// Heartbeat rows older than this are pruned by the stale sweep
    pub session_retention: Duration,
    /// Heartbeats newer than this count as active workers
    pub heartbeat_window: Duration,
}

impl JobStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/progress.db"),
            max_retry_attempts: 3,
            claim_timeout: Duration::from_secs(3600),
            busy_timeout: Duration::from_secs(30),
            session_retention: Duration::from_secs(24 * 3600),
            heartbeat_window: Duration::from_secs(300),
        }
    }
}

/// One row of `file_processing_log`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub dataset: String,
    pub file_path: String,
    pub status: JobStatus,
    pub worker_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds
    pub duration: Option<f64>,
    pub records_processed: Option<i64>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub(crate) fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let status: String = row.try_get("status")?;
        let status = status.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: e.into(),
        })?;
        let retry_count: i64 = row.try_get("retry_count")?;

        Ok(Self {
            dataset: row.try_get("dataset")?,
            file_path: row.try_get("file_path")?,
            status,
            worker_id: row.try_get("worker_id")?,
            start_time: from_millis(row.try_get("start_time")?),
            end_time: from_millis(row.try_get("end_time")?),
            duration: row.try_get("duration")?,
            records_processed: row.try_get("records_processed")?,
            error_message: row.try_get("error_message")?,
            retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
            created_at: from_millis(row.try_get("created_at")?),
            updated_at: from_millis(row.try_get("updated_at")?),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub dataset: String,
    pub total_files: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSession {
    pub worker_id: String,
    pub dataset: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub status: String,
}

/// Aggregate view of one dataset's jobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub dataset: String,
    /// Denormalized count from `dataset_metadata`
    pub total_files: i64,
    pub total_jobs: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub records_processed: i64,
    /// Percentage over finished jobs, 0 when nothing has finished
    pub success_rate: f64,
    /// Mean seconds per completed job
    pub avg_duration: Option<f64>,
    pub active_workers: i64,
    pub eta_seconds: Option<f64>,
}

impl ProcessingStats {
    pub fn remaining(&self) -> i64 {
        self.pending + self.processing
    }

    /// Share of jobs in a terminal state
    pub fn completion_percentage(&self) -> f64 {
        if self.total_jobs == 0 {
            return 0.0;
        }
        (self.completed + self.failed) as f64 / self.total_jobs as f64 * 100.0
    }

    pub(crate) fn finish(&mut self) {
        let finished = self.completed + self.failed;
        self.success_rate = if finished > 0 {
            self.completed as f64 / finished as f64 * 100.0
        } else {
            0.0
        };
        self.eta_seconds = match self.avg_duration {
            Some(avg) if avg > 0.0 && self.active_workers > 0 && self.remaining() > 0 => {
                Some(self.remaining() as f64 * avg / self.active_workers as f64)
            },
            _ => None,
        };
    }
}

/// Outcomes recorded by one worker, from the last attempt at each file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub files_processed: i64,
    pub successful: i64,
    /// Files whose last attempt by this worker failed, retried or not
    pub failed: i64,
    pub records_processed: i64,
    /// Mean seconds per attempt
    pub avg_duration: Option<f64>,
}

/// Dataset totals plus the per-worker breakdown
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingSummary {
    #[serde(flatten)]
    pub stats: ProcessingStats,
    pub workers: Vec<WorkerStats>,
}

/// Counts across every dataset in the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub datasets: i64,
    pub total_jobs: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub worker_sessions: i64,
    /// Size of the main database file, without the WAL
    pub size_bytes: u64,
}

/// Result of a stale sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Jobs moved from `processing` back to `pending`
    pub reclaimed: u64,
    pub sessions_pruned: u64,
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_millis(value: Option<i64>) -> Option<DateTime<Utc>> {
    value.and_then(DateTime::from_timestamp_millis)
}

pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
