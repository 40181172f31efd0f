//! SQLite-backed job store
//!
//! Each mutating method runs in one `BEGIN IMMEDIATE` transaction on a
//! single-connection write pool, and reads use a separate pool. WAL mode
//! lets readers proceed while a writer holds the lock, and `busy_timeout`
//! makes concurrent writers from other processes wait rather than fail.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::tx::begin_immediate;
use super::types::{
    duration_millis, from_millis, now_millis, DatabaseStats, DatasetMetadata, JobRecord,
    JobStatus, JobStoreConfig, ProcessingStats, ProcessingSummary, SweepReport, WorkerSession,
    WorkerStats,
};
use crate::error::{IngestError, Result};

/// Stored error messages are cut to this many characters
pub const MAX_ERROR_MESSAGE_CHARS: usize = 1000;

const JOB_COLUMNS: &str = "dataset, file_path, status, worker_id, start_time, end_time, \
     duration, records_processed, error_message, retry_count, created_at, updated_at";

/// Handle on the shared job database
///
/// Cheap to clone; clones share the underlying pools.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
    write_pool: SqlitePool,
    config: JobStoreConfig,
}

impl JobStore {
    /// Open the store, creating the file and applying migrations if needed
    ///
    /// Coordinators call this once before launching workers.
    pub async fn open(config: JobStoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self::build(config, true).await?;
        sqlx::migrate!("./migrations").run(&store.write_pool).await?;

        info!(path = %store.config.path.display(), "Job store ready");
        Ok(store)
    }

    /// Attach to an existing, already migrated store
    ///
    /// Used by worker processes so they never race a coordinator's migration.
    pub async fn connect(config: JobStoreConfig) -> Result<Self> {
        if !config.path.exists() {
            return Err(IngestError::config(format!(
                "job store {} does not exist",
                config.path.display()
            )));
        }
        Self::build(config, false).await
    }

    async fn build(config: JobStoreConfig, create: bool) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout)
            .foreign_keys(true)
            .create_if_missing(create);

        let write_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(config.busy_timeout + Duration::from_secs(30))
            .connect_with(options.clone())
            .await?;

        let pool = SqlitePoolOptions::new()
            .max_connections(default_read_pool_size())
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            write_pool,
            config,
        })
    }

    pub fn config(&self) -> &JobStoreConfig {
        &self.config
    }

    pub async fn close(&self) {
        self.pool.close().await;
        self.write_pool.close().await;
    }

    /// Insert a pending job for each file not yet known for `dataset`
    ///
    /// Returns how many jobs were new. Existing jobs keep their state.
    pub async fn register_files(&self, dataset: &str, files: &[String]) -> Result<u64> {
        let now = now_millis();
        let mut tx = begin_immediate(&self.write_pool).await?;

        let mut inserted = 0;
        for file in files {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO file_processing_log
                    (dataset, file_path, status, retry_count, created_at, updated_at)
                VALUES (?1, ?2, 'pending', 0, ?3, ?3)
                "#,
            )
            .bind(dataset)
            .bind(file)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        sqlx::query(
            r#"
            INSERT INTO dataset_metadata (dataset, total_files, updated_at)
            VALUES (?1, (SELECT COUNT(*) FROM file_processing_log WHERE dataset = ?1), ?2)
            ON CONFLICT(dataset) DO UPDATE SET
                total_files = excluded.total_files,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(dataset)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            dataset = %dataset,
            discovered = files.len(),
            inserted,
            "Registered files"
        );
        Ok(inserted)
    }

    /// Claim the oldest pending job of `dataset` for `worker_id`
    ///
    /// Runs the stale sweep first, so abandoned claims become claimable in
    /// the same transaction. Returns `None` when nothing is pending or when
    /// another claimant won the row.
    pub async fn claim_next_file(&self, dataset: &str, worker_id: &str) -> Result<Option<String>> {
        let now = now_millis();
        let mut tx = begin_immediate(&self.write_pool).await?;

        let reclaimed = sweep_stale(&mut tx, now, duration_millis(self.config.claim_timeout)).await?;

        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE file_processing_log
            SET status = 'processing', worker_id = ?1, start_time = ?2,
                end_time = NULL, duration = NULL, updated_at = ?2
            WHERE id = (
                SELECT id FROM file_processing_log
                WHERE dataset = ?3 AND status = 'pending'
                ORDER BY created_at, id
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING file_path
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(dataset)
        .fetch_optional(&mut *tx)
        .await?;

        upsert_heartbeat(&mut tx, dataset, worker_id, now).await?;
        tx.commit().await?;

        if reclaimed > 0 {
            warn!(reclaimed, "Reclaimed stale jobs during claim");
        }
        match &claimed {
            Some(file) => debug!(dataset = %dataset, worker_id = %worker_id, file = %file, "Claimed file"),
            None => debug!(dataset = %dataset, worker_id = %worker_id, "No pending file to claim"),
        }
        Ok(claimed)
    }

    /// Claim one named file if it is still pending
    ///
    /// Same transaction shape as [`claim_next_file`](Self::claim_next_file);
    /// used when files are assigned to workers up front.
    pub async fn claim_file(&self, dataset: &str, file: &str, worker_id: &str) -> Result<bool> {
        let now = now_millis();
        let mut tx = begin_immediate(&self.write_pool).await?;

        let reclaimed = sweep_stale(&mut tx, now, duration_millis(self.config.claim_timeout)).await?;

        let result = sqlx::query(
            r#"
            UPDATE file_processing_log
            SET status = 'processing', worker_id = ?1, start_time = ?2,
                end_time = NULL, duration = NULL, updated_at = ?2
            WHERE dataset = ?3 AND file_path = ?4 AND status = 'pending'
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(dataset)
        .bind(file)
        .execute(&mut *tx)
        .await?;

        upsert_heartbeat(&mut tx, dataset, worker_id, now).await?;
        tx.commit().await?;

        if reclaimed > 0 {
            warn!(reclaimed, "Reclaimed stale jobs during claim");
        }
        Ok(result.rows_affected() == 1)
    }

    /// Record a successful run of a job claimed by `worker_id`
    ///
    /// Fails with [`IngestError::JobState`] when the job is no longer
    /// `processing` under that worker, e.g. after a stale reclaim.
    pub async fn mark_completed(
        &self,
        dataset: &str,
        file: &str,
        worker_id: &str,
        records_processed: i64,
    ) -> Result<()> {
        let now = now_millis();
        let mut tx = begin_immediate(&self.write_pool).await?;

        let start_time = require_owned(&mut tx, dataset, file, worker_id).await?.0;

        sqlx::query(
            r#"
            UPDATE file_processing_log
            SET status = 'completed', end_time = ?1, duration = ?2,
                records_processed = ?3, worker_id = NULL, processed_by = ?6,
                error_message = NULL, updated_at = ?1
            WHERE dataset = ?4 AND file_path = ?5 AND status = 'processing' AND worker_id = ?6
            "#,
        )
        .bind(now)
        .bind(elapsed_secs(start_time, now))
        .bind(records_processed)
        .bind(dataset)
        .bind(file)
        .bind(worker_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(dataset = %dataset, file = %file, records_processed, "Marked completed");
        Ok(())
    }

    /// Record a failed attempt of a job claimed by `worker_id`
    ///
    /// The job returns to `pending` while its retry budget lasts and becomes
    /// `failed` once it is spent. Returns the job's new status.
    pub async fn mark_failed(
        &self,
        dataset: &str,
        file: &str,
        worker_id: &str,
        error_message: &str,
    ) -> Result<JobStatus> {
        let now = now_millis();
        let mut tx = begin_immediate(&self.write_pool).await?;

        let (start_time, retry_count) = require_owned(&mut tx, dataset, file, worker_id).await?;

        let max = self.config.max_retry_attempts;
        let next = retry_count.saturating_add(1);
        let (status, retry_count) = if next <= max {
            (JobStatus::Pending, next)
        } else {
            (JobStatus::Failed, max)
        };
        let message: String = error_message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect();

        sqlx::query(
            r#"
            UPDATE file_processing_log
            SET status = ?1, retry_count = ?2, end_time = ?3, duration = ?4,
                error_message = ?5, worker_id = NULL, processed_by = ?8, updated_at = ?3
            WHERE dataset = ?6 AND file_path = ?7 AND status = 'processing' AND worker_id = ?8
            "#,
        )
        .bind(status.as_str())
        .bind(i64::from(retry_count))
        .bind(now)
        .bind(elapsed_secs(start_time, now))
        .bind(&message)
        .bind(dataset)
        .bind(file)
        .bind(worker_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        match status {
            JobStatus::Failed => warn!(
                dataset = %dataset,
                file = %file,
                attempts = retry_count + 1,
                error = %message,
                "File failed permanently"
            ),
            _ => info!(
                dataset = %dataset,
                file = %file,
                retry = retry_count,
                max_retries = max,
                error = %message,
                "File failed, queued for retry"
            ),
        }
        Ok(status)
    }

    /// Refresh a worker's liveness row
    pub async fn heartbeat(&self, dataset: &str, worker_id: &str) -> Result<()> {
        let mut tx = begin_immediate(&self.write_pool).await?;
        upsert_heartbeat(&mut tx, dataset, worker_id, now_millis()).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Mark a worker as done so it stops counting towards active workers
    pub async fn finish_session(&self, dataset: &str, worker_id: &str) -> Result<()> {
        let mut tx = begin_immediate(&self.write_pool).await?;
        sqlx::query(
            r#"
            UPDATE worker_sessions SET status = 'finished', last_heartbeat = ?1
            WHERE worker_id = ?2 AND dataset = ?3
            "#,
        )
        .bind(now_millis())
        .bind(worker_id)
        .bind(dataset)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_stats(&self, dataset: &str) -> Result<ProcessingStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0) AS processing,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN records_processed ELSE 0 END), 0) AS records,
                AVG(CASE WHEN status = 'completed' THEN duration END) AS avg_duration
            FROM file_processing_log
            WHERE dataset = ?1
            "#,
        )
        .bind(dataset)
        .fetch_one(&self.pool)
        .await?;

        let total_files: Option<i64> =
            sqlx::query_scalar("SELECT total_files FROM dataset_metadata WHERE dataset = ?1")
                .bind(dataset)
                .fetch_optional(&self.pool)
                .await?;

        let cutoff = now_millis() - duration_millis(self.config.heartbeat_window);
        let active_workers: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(DISTINCT worker_id) FROM worker_sessions
            WHERE dataset = ?1 AND status = 'active' AND last_heartbeat >= ?2
            "#,
        )
        .bind(dataset)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        let mut stats = ProcessingStats {
            dataset: dataset.to_string(),
            total_files: total_files.unwrap_or(0),
            total_jobs: row.try_get("total")?,
            pending: row.try_get("pending")?,
            processing: row.try_get("processing")?,
            completed: row.try_get("completed")?,
            failed: row.try_get("failed")?,
            records_processed: row.try_get("records")?,
            avg_duration: row.try_get("avg_duration")?,
            active_workers,
            ..Default::default()
        };
        stats.finish();
        Ok(stats)
    }

    /// Per-worker outcomes of `dataset`, busiest worker first
    ///
    /// Built from the last recorded attempt at each file, so a file retried
    /// by another worker counts for that worker only. Files currently being
    /// processed are left out.
    pub async fn get_worker_stats(&self, dataset: &str) -> Result<Vec<WorkerStats>> {
        let rows = sqlx::query(
            r#"
            SELECT
                processed_by,
                COUNT(*) AS files,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS successful,
                COALESCE(SUM(CASE WHEN status != 'completed' THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN records_processed ELSE 0 END), 0) AS records,
                AVG(duration) AS avg_duration
            FROM file_processing_log
            WHERE dataset = ?1 AND processed_by IS NOT NULL AND status != 'processing'
            GROUP BY processed_by
            ORDER BY files DESC, processed_by
            "#,
        )
        .bind(dataset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<WorkerStats> {
                Ok(WorkerStats {
                    worker_id: row.try_get("processed_by")?,
                    files_processed: row.try_get("files")?,
                    successful: row.try_get("successful")?,
                    failed: row.try_get("failed")?,
                    records_processed: row.try_get("records")?,
                    avg_duration: row.try_get("avg_duration")?,
                })
            })
            .collect()
    }

    /// [`get_stats`](Self::get_stats) together with the per-worker breakdown
    pub async fn get_processing_summary(&self, dataset: &str) -> Result<ProcessingSummary> {
        Ok(ProcessingSummary {
            stats: self.get_stats(dataset).await?,
            workers: self.get_worker_stats(dataset).await?,
        })
    }

    /// Jobs of `dataset` that have been `processing` for longer than `timeout`,
    /// oldest claim first
    pub async fn get_stuck_files(&self, dataset: &str, timeout: Duration) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM file_processing_log \
             WHERE dataset = ?1 AND status = 'processing' AND start_time < ?2 \
             ORDER BY start_time, id",
            JOB_COLUMNS
        ))
        .bind(dataset)
        .bind(now_millis() - duration_millis(timeout))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(JobRecord::from_row).collect::<sqlx::Result<_>>()?)
    }

    /// Job and session counts over the whole store
    pub async fn get_database_stats(&self) -> Result<DatabaseStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(DISTINCT dataset) AS datasets,
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0) AS processing,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed
            FROM file_processing_log
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let worker_sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM worker_sessions")
            .fetch_one(&self.pool)
            .await?;
        let size_bytes = std::fs::metadata(&self.config.path).map(|m| m.len()).unwrap_or(0);

        Ok(DatabaseStats {
            datasets: row.try_get("datasets")?,
            total_jobs: row.try_get("total")?,
            pending: row.try_get("pending")?,
            processing: row.try_get("processing")?,
            completed: row.try_get("completed")?,
            failed: row.try_get("failed")?,
            worker_sessions,
            size_bytes,
        })
    }

    /// Standalone stale sweep for periodic maintenance
    pub async fn cleanup_stale_sessions(&self) -> Result<SweepReport> {
        let now = now_millis();
        let mut tx = begin_immediate(&self.write_pool).await?;

        let reclaimed = sweep_stale(&mut tx, now, duration_millis(self.config.claim_timeout)).await?;
        let sessions_pruned = sqlx::query("DELETE FROM worker_sessions WHERE last_heartbeat < ?1")
            .bind(now - duration_millis(self.config.session_retention))
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        let report = SweepReport {
            reclaimed,
            sessions_pruned,
        };
        info!(reclaimed, sessions_pruned, "Stale sweep finished");
        Ok(report)
    }

    /// Put every non-pending job of `dataset` back to a fresh pending state
    pub async fn reset_dataset(&self, dataset: &str) -> Result<u64> {
        let mut tx = begin_immediate(&self.write_pool).await?;
        let affected = sqlx::query(&reset_sql("dataset = ?2 AND status != 'pending'"))
            .bind(now_millis())
            .bind(dataset)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        info!(dataset = %dataset, reset = affected, "Reset dataset for reprocessing");
        Ok(affected)
    }

    /// Requeue failed jobs, optionally only those whose error matches a
    /// SQL `LIKE` pattern. Retry budgets start over.
    pub async fn reset_failed_files(&self, dataset: &str, error_pattern: Option<&str>) -> Result<u64> {
        let mut tx = begin_immediate(&self.write_pool).await?;
        let affected = sqlx::query(&reset_sql(
            "dataset = ?2 AND status = 'failed' AND (?3 IS NULL OR error_message LIKE ?3)",
        ))
        .bind(now_millis())
        .bind(dataset)
        .bind(error_pattern)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        info!(dataset = %dataset, reset = affected, pattern = ?error_pattern, "Reset failed files");
        Ok(affected)
    }

    /// Requeue the given files of `dataset` that ended in `failed`
    pub async fn requeue_failed(&self, dataset: &str, files: &[String]) -> Result<u64> {
        let now = now_millis();
        let mut tx = begin_immediate(&self.write_pool).await?;
        let mut affected = 0;
        for file in files {
            affected += sqlx::query(&reset_sql("dataset = ?2 AND file_path = ?3 AND status = 'failed'"))
                .bind(now)
                .bind(dataset)
                .bind(file)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        if affected > 0 {
            info!(dataset = %dataset, requeued = affected, "Requeued failed files");
        }
        Ok(affected)
    }

    /// Move `processing` jobs older than `timeout` back to pending
    pub async fn reset_stuck_files(&self, dataset: &str, timeout: Duration) -> Result<u64> {
        let now = now_millis();
        let mut tx = begin_immediate(&self.write_pool).await?;
        let affected = sqlx::query(
            r#"
            UPDATE file_processing_log
            SET status = 'pending', worker_id = NULL, start_time = NULL, updated_at = ?1
            WHERE dataset = ?2 AND status = 'processing' AND start_time < ?3
            "#,
        )
        .bind(now)
        .bind(dataset)
        .bind(now - duration_millis(timeout))
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        info!(dataset = %dataset, reset = affected, timeout_secs = timeout.as_secs(), "Reset stuck files");
        Ok(affected)
    }

    /// Delete completed and failed jobs that finished more than `days` ago
    pub async fn cleanup_old_records(&self, days: u32) -> Result<u64> {
        let cutoff = now_millis() - i64::from(days) * 24 * 3600 * 1000;
        let mut tx = begin_immediate(&self.write_pool).await?;
        let deleted = sqlx::query(
            r#"
            DELETE FROM file_processing_log
            WHERE status IN ('completed', 'failed') AND end_time < ?1
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        info!(days, deleted, "Pruned old job records");
        Ok(deleted)
    }

    pub async fn get_job(&self, dataset: &str, file: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM file_processing_log WHERE dataset = ?1 AND file_path = ?2",
            JOB_COLUMNS
        ))
        .bind(dataset)
        .bind(file)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(JobRecord::from_row).transpose()?)
    }

    /// Failed jobs, most recently finished first
    pub async fn get_failed_files(&self, dataset: &str, limit: u32) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM file_processing_log WHERE dataset = ?1 AND status = 'failed' \
             ORDER BY end_time DESC LIMIT ?2",
            JOB_COLUMNS
        ))
        .bind(dataset)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(JobRecord::from_row).collect::<sqlx::Result<_>>()?)
    }

    /// Pending files in claim order
    pub async fn get_pending_files(&self, dataset: &str) -> Result<Vec<String>> {
        let files = sqlx::query_scalar(
            r#"
            SELECT file_path FROM file_processing_log
            WHERE dataset = ?1 AND status = 'pending'
            ORDER BY created_at, id
            "#,
        )
        .bind(dataset)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    /// Last known status of every registered file of `dataset`
    pub async fn get_file_statuses(&self, dataset: &str) -> Result<HashMap<String, JobStatus>> {
        let rows = sqlx::query("SELECT file_path, status FROM file_processing_log WHERE dataset = ?1")
            .bind(dataset)
            .fetch_all(&self.pool)
            .await?;

        let mut statuses = HashMap::with_capacity(rows.len());
        for row in rows {
            let file: String = row.try_get("file_path")?;
            let status: String = row.try_get("status")?;
            let status = status
                .parse()
                .map_err(|e: String| IngestError::config(format!("corrupt job row for {}: {}", file, e)))?;
            statuses.insert(file, status);
        }
        Ok(statuses)
    }

    pub async fn get_dataset_metadata(&self, dataset: &str) -> Result<Option<DatasetMetadata>> {
        let row = sqlx::query(
            "SELECT dataset, total_files, updated_at FROM dataset_metadata WHERE dataset = ?1",
        )
        .bind(dataset)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<DatasetMetadata> {
            Ok(DatasetMetadata {
                dataset: row.try_get("dataset")?,
                total_files: row.try_get("total_files")?,
                updated_at: from_millis(row.try_get("updated_at")?),
            })
        })
        .transpose()
    }

    /// Heartbeat rows of `dataset`, freshest first
    pub async fn list_worker_sessions(&self, dataset: &str) -> Result<Vec<WorkerSession>> {
        let rows = sqlx::query(
            r#"
            SELECT worker_id, dataset, last_heartbeat, status FROM worker_sessions
            WHERE dataset = ?1
            ORDER BY last_heartbeat DESC, worker_id
            "#,
        )
        .bind(dataset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<WorkerSession> {
                Ok(WorkerSession {
                    worker_id: row.try_get("worker_id")?,
                    dataset: row.try_get("dataset")?,
                    last_heartbeat: from_millis(row.try_get("last_heartbeat")?),
                    status: row.try_get("status")?,
                })
            })
            .collect()
    }
}

fn reset_sql(condition: &str) -> String {
    format!(
        "UPDATE file_processing_log \
         SET status = 'pending', worker_id = NULL, processed_by = NULL, start_time = NULL, \
             end_time = NULL, duration = NULL, records_processed = NULL, error_message = NULL, \
             retry_count = 0, updated_at = ?1 \
         WHERE {}",
        condition
    )
}

/// Return abandoned `processing` jobs of every dataset to `pending`
async fn sweep_stale(conn: &mut SqliteConnection, now: i64, timeout_ms: i64) -> sqlx::Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE file_processing_log
        SET status = 'pending', worker_id = NULL, start_time = NULL, updated_at = ?1
        WHERE status = 'processing' AND start_time < ?2
        "#,
    )
    .bind(now)
    .bind(now - timeout_ms)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

async fn upsert_heartbeat(
    conn: &mut SqliteConnection,
    dataset: &str,
    worker_id: &str,
    now: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO worker_sessions (worker_id, dataset, last_heartbeat, status)
        VALUES (?1, ?2, ?3, 'active')
        ON CONFLICT(worker_id, dataset) DO UPDATE SET
            last_heartbeat = excluded.last_heartbeat,
            status = 'active'
        "#,
    )
    .bind(worker_id)
    .bind(dataset)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Read `(start_time, retry_count)` of a job that must be `processing`
/// under `worker_id`
async fn require_owned(
    conn: &mut SqliteConnection,
    dataset: &str,
    file: &str,
    worker_id: &str,
) -> Result<(Option<i64>, u32)> {
    let row = sqlx::query(
        "SELECT status, worker_id, start_time, retry_count FROM file_processing_log \
         WHERE dataset = ?1 AND file_path = ?2",
    )
    .bind(dataset)
    .bind(file)
    .fetch_optional(&mut *conn)
    .await?;

    let state_error = |found: String| IngestError::JobState {
        dataset: dataset.to_string(),
        file: file.to_string(),
        expected: JobStatus::Processing,
        found,
    };

    let row = row.ok_or_else(|| state_error("unregistered".to_string()))?;
    let status: String = row.try_get("status")?;
    if status != JobStatus::Processing.as_str() {
        return Err(state_error(status));
    }
    let owner: Option<String> = row.try_get("worker_id")?;
    if owner.as_deref() != Some(worker_id) {
        return Err(state_error(format!(
            "processing by {}",
            owner.as_deref().unwrap_or("no worker")
        )));
    }

    let retry_count: i64 = row.try_get("retry_count")?;
    Ok((
        row.try_get("start_time")?,
        u32::try_from(retry_count).unwrap_or(u32::MAX),
    ))
}

fn elapsed_secs(start_time: Option<i64>, now: i64) -> Option<f64> {
    start_time.map(|start| (now - start).max(0) as f64 / 1000.0)
}

fn default_read_pool_size() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4)
        .clamp(2, 8)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn open_store(dir: &tempfile::TempDir) -> JobStore {
        JobStore::open(JobStoreConfig::new(dir.path().join("progress.db")).with_max_retry_attempts(2))
            .await
            .unwrap()
    }

    fn files(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let first = store
            .register_files("x", &files(&["historical/a.zip", "historical/b.zip"]))
            .await
            .unwrap();
        let second = store
            .register_files("x", &files(&["historical/b.zip", "historical/c.zip"]))
            .await
            .unwrap();

        assert_eq!(first, 2);
        assert_eq!(second, 1);
        let meta = store.get_dataset_metadata("x").await.unwrap().unwrap();
        assert_eq!(meta.total_files, 3);
    }

    #[tokio::test]
    async fn test_claims_follow_registration_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store
            .register_files("x", &files(&["historical/a.zip", "historical/b.zip"]))
            .await
            .unwrap();

        let first = store.claim_next_file("x", "worker_0").await.unwrap();
        let second = store.claim_next_file("x", "worker_1").await.unwrap();
        let third = store.claim_next_file("x", "worker_0").await.unwrap();

        assert_eq!(first.as_deref(), Some("historical/a.zip"));
        assert_eq!(second.as_deref(), Some("historical/b.zip"));
        assert_eq!(third, None);

        let job = store.get_job("x", "historical/a.zip").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.worker_id.as_deref(), Some("worker_0"));
        assert!(job.start_time.is_some());
    }

    #[tokio::test]
    async fn test_claims_are_scoped_to_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store.register_files("x", &files(&["a.zip"])).await.unwrap();

        assert_eq!(store.claim_next_file("y", "worker_0").await.unwrap(), None);
        assert!(!store.claim_file("y", "a.zip", "worker_0").await.unwrap());
        assert!(store.claim_file("x", "a.zip", "worker_0").await.unwrap());
        assert!(!store.claim_file("x", "a.zip", "worker_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_completed_records_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store.register_files("x", &files(&["a.zip"])).await.unwrap();
        store.claim_next_file("x", "worker_0").await.unwrap();

        store.mark_completed("x", "a.zip", "worker_0", 42).await.unwrap();

        let job = store.get_job("x", "a.zip").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.records_processed, Some(42));
        assert_eq!(job.worker_id, None);
        assert!(job.end_time.is_some());
        assert!(job.duration.unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_transitions_from_wrong_state_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store.register_files("x", &files(&["a.zip"])).await.unwrap();

        let err = store.mark_completed("x", "a.zip", "worker_0", 1).await.unwrap_err();
        assert!(matches!(err, IngestError::JobState { ref found, .. } if found == "pending"));

        let err = store.mark_failed("x", "missing.zip", "worker_0", "boom").await.unwrap_err();
        assert!(matches!(err, IngestError::JobState { ref found, .. } if found == "unregistered"));

        store.claim_next_file("x", "worker_0").await.unwrap();
        store.mark_completed("x", "a.zip", "worker_0", 1).await.unwrap();
        let err = store.mark_failed("x", "a.zip", "worker_0", "late").await.unwrap_err();
        assert!(matches!(err, IngestError::JobState { ref found, .. } if found == "completed"));

        store.register_files("x", &files(&["b.zip"])).await.unwrap();
        assert!(store.claim_file("x", "b.zip", "worker_0").await.unwrap());
        let err = store.mark_completed("x", "b.zip", "worker_1", 1).await.unwrap_err();
        assert!(
            matches!(err, IngestError::JobState { ref found, .. } if found == "processing by worker_0")
        );

        // The store stays usable after a rejected transition
        assert_eq!(store.get_stats("x").await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_error_message_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store.register_files("x", &files(&["a.zip"])).await.unwrap();
        store.claim_next_file("x", "worker_0").await.unwrap();

        store.mark_failed("x", "a.zip", "worker_0", &"e".repeat(5000)).await.unwrap();

        let job = store.get_job("x", "a.zip").await.unwrap().unwrap();
        assert_eq!(job.error_message.unwrap().len(), MAX_ERROR_MESSAGE_CHARS);
    }

    #[tokio::test]
    async fn test_admin_resets() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(
            JobStoreConfig::new(dir.path().join("progress.db")).with_max_retry_attempts(0),
        )
        .await
        .unwrap();
        store
            .register_files("x", &files(&["a.zip", "b.zip", "c.zip"]))
            .await
            .unwrap();

        for (file, error) in [("a.zip", "timeout reading member"), ("b.zip", "bad header")] {
            assert!(store.claim_file("x", file, "worker_0").await.unwrap());
            assert_eq!(
                store.mark_failed("x", file, "worker_0", error).await.unwrap(),
                JobStatus::Failed
            );
        }
        assert!(store.claim_file("x", "c.zip", "worker_0").await.unwrap());

        let failed = store.get_failed_files("x", 10).await.unwrap();
        assert_eq!(failed.len(), 2);

        assert_eq!(store.reset_failed_files("x", Some("timeout%")).await.unwrap(), 1);
        assert_eq!(store.get_pending_files("x").await.unwrap(), files(&["a.zip"]));

        assert_eq!(store.reset_stuck_files("x", Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.reset_stuck_files("x", Duration::ZERO).await.unwrap(), 1);

        assert_eq!(store.reset_dataset("x").await.unwrap(), 1);
        let stats = store.get_stats("x").await.unwrap();
        assert_eq!(stats.pending, 3);
        let job = store.get_job("x", "b.zip").await.unwrap().unwrap();
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.error_message, None);
    }

    #[tokio::test]
    async fn test_cleanup_old_records_keeps_recent_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store.register_files("x", &files(&["a.zip"])).await.unwrap();
        store.claim_next_file("x", "worker_0").await.unwrap();
        store.mark_completed("x", "a.zip", "worker_0", 3).await.unwrap();

        assert_eq!(store.cleanup_old_records(30).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.cleanup_old_records(0).await.unwrap(), 1);
        assert!(store.get_job("x", "a.zip").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finished_sessions_do_not_count_as_active() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store.heartbeat("x", "worker_0").await.unwrap();
        store.heartbeat("x", "worker_1").await.unwrap();
        assert_eq!(store.get_stats("x").await.unwrap().active_workers, 2);

        store.finish_session("x", "worker_1").await.unwrap();
        assert_eq!(store.get_stats("x").await.unwrap().active_workers, 1);
        assert_eq!(store.list_worker_sessions("x").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_worker_stats_follow_last_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(
            JobStoreConfig::new(dir.path().join("progress.db")).with_max_retry_attempts(1),
        )
        .await
        .unwrap();
        store
            .register_files("x", &files(&["a.zip", "b.zip", "c.zip", "d.zip"]))
            .await
            .unwrap();

        assert!(store.claim_file("x", "a.zip", "worker_0").await.unwrap());
        store.mark_completed("x", "a.zip", "worker_0", 10).await.unwrap();
        assert!(store.claim_file("x", "b.zip", "worker_0").await.unwrap());
        store.mark_completed("x", "b.zip", "worker_0", 5).await.unwrap();

        // c.zip fails under worker_0 and is finished by worker_1
        assert!(store.claim_file("x", "c.zip", "worker_0").await.unwrap());
        store.mark_failed("x", "c.zip", "worker_0", "bad").await.unwrap();
        assert!(store.claim_file("x", "c.zip", "worker_1").await.unwrap());
        store.mark_completed("x", "c.zip", "worker_1", 1).await.unwrap();

        // In flight, not counted for anyone
        assert!(store.claim_file("x", "d.zip", "worker_1").await.unwrap());

        let workers = store.get_worker_stats("x").await.unwrap();
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].worker_id, "worker_0");
        assert_eq!(workers[0].files_processed, 2);
        assert_eq!(workers[0].successful, 2);
        assert_eq!(workers[0].records_processed, 15);
        assert_eq!(workers[1].worker_id, "worker_1");
        assert_eq!(workers[1].files_processed, 1);
        assert_eq!(workers[1].failed, 0);
        assert!(workers[1].avg_duration.is_some());

        let summary = store.get_processing_summary("x").await.unwrap();
        assert_eq!(summary.stats.completed, 3);
        assert_eq!(summary.workers, workers);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["completed"], 3);
        assert_eq!(json["workers"][0]["worker_id"], "worker_0");

        // A reset forgets who processed the file
        store.reset_dataset("x").await.unwrap();
        assert!(store.get_worker_stats("x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stuck_files_are_listed_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store
            .register_files("x", &files(&["a.zip", "b.zip", "c.zip"]))
            .await
            .unwrap();
        assert!(store.claim_file("x", "b.zip", "worker_0").await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.claim_file("x", "a.zip", "worker_1").await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(store
            .get_stuck_files("x", Duration::from_secs(3600))
            .await
            .unwrap()
            .is_empty());

        let stuck = store.get_stuck_files("x", Duration::ZERO).await.unwrap();
        let names: Vec<&str> = stuck.iter().map(|j| j.file_path.as_str()).collect();
        assert_eq!(names, vec!["b.zip", "a.zip"]);
        assert_eq!(stuck[0].worker_id.as_deref(), Some("worker_0"));
        // Listing does not change anything
        assert_eq!(store.get_stats("x").await.unwrap().processing, 2);
    }

    #[tokio::test]
    async fn test_database_stats_span_datasets() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store.register_files("x", &files(&["a.zip", "b.zip"])).await.unwrap();
        store.register_files("y", &files(&["a.zip"])).await.unwrap();
        assert!(store.claim_file("y", "a.zip", "worker_0").await.unwrap());
        store.mark_completed("y", "a.zip", "worker_0", 1).await.unwrap();

        let stats = store.get_database_stats().await.unwrap();
        assert_eq!(stats.datasets, 2);
        assert_eq!(stats.total_jobs, 3);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.processing + stats.failed, 0);
        assert_eq!(stats.worker_sessions, 1);
    }

    #[tokio::test]
    async fn test_connect_requires_existing_store() {
        let dir = tempfile::tempdir().unwrap();
        let result = JobStore::connect(JobStoreConfig::new(dir.path().join("missing.db"))).await;
        assert!(matches!(result, Err(IngestError::Configuration(_))));
    }
}
