//! How worker assignments are executed

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::worker::{run_worker, WorkerAssignment, WorkerReport};
use crate::error::{IngestError, Result};
use crate::processor::ProcessorRegistry;

/// Runs one worker assignment and waits for its report
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, assignment: WorkerAssignment, cancel: CancellationToken) -> Result<WorkerReport>;

    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Fail with a configuration error if workers for `dataset` cannot run
    fn check_dataset(&self, _dataset: &str) -> Result<()> {
        Ok(())
    }
}

/// Re-executes the current binary as `<exe> worker`, one OS process per worker
///
/// The assignment is written to the child's stdin as JSON and the child
/// prints its [`WorkerReport`] as a single JSON document on stdout. The
/// child's stderr is inherited so its logs reach the terminal. Children are
/// never killed: when the launch is cancelled they receive SIGTERM and stop
/// after their current file.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn current_exe() -> Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
        })
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, assignment: WorkerAssignment, cancel: CancellationToken) -> Result<WorkerReport> {
        let worker_id = assignment.worker_id.clone();
        let payload = serde_json::to_vec(&assignment)?;

        let mut child = Command::new(&self.program)
            .arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| IngestError::worker(&worker_id, format!("spawn failed: {}", e)))?;
        debug!(worker_id = %worker_id, pid = ?child.id(), "Spawned worker process");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| IngestError::worker(&worker_id, "stdin not captured"))?;
        stdin.write_all(&payload).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let pid = child.id();
        let wait = child.wait_with_output();
        tokio::pin!(wait);
        let output = tokio::select! {
            output = &mut wait => output?,
            _ = cancel.cancelled() => {
                if let Some(pid) = pid {
                    info!(worker_id = %worker_id, pid, "Asking worker process to stop");
                    if !terminate_process(pid) {
                        warn!(worker_id = %worker_id, pid, "Could not signal worker process");
                    }
                }
                wait.await?
            }
        };
        if !output.status.success() {
            return Err(IngestError::worker(
                &worker_id,
                format!("process exited with {}", output.status),
            ));
        }

        let report: WorkerReport = serde_json::from_slice(&output.stdout).map_err(|e| {
            IngestError::worker(&worker_id, format!("unreadable report: {}", e))
        })?;
        Ok(report)
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

/// Send SIGTERM to a worker process
#[cfg(unix)]
fn terminate_process(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn terminate_process(_pid: u32) -> bool {
    false
}

/// Runs workers on tokio tasks in the current process
#[derive(Debug, Clone)]
pub struct InProcessLauncher {
    registry: ProcessorRegistry,
}

impl InProcessLauncher {
    pub fn new(registry: ProcessorRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, assignment: WorkerAssignment, cancel: CancellationToken) -> Result<WorkerReport> {
        let processor = self.registry.get(&assignment.dataset)?;
        let worker_id = assignment.worker_id.clone();

        let handle = tokio::spawn(async move { run_worker(&assignment, processor, cancel).await });
        handle
            .await
            .map_err(|e| IngestError::worker(&worker_id, format!("task failed: {}", e)))
    }

    fn name(&self) -> &'static str {
        "in_process"
    }

    fn check_dataset(&self, dataset: &str) -> Result<()> {
        self.registry.get(dataset).map(|_| ())
    }
}

/// Body of the hidden `worker` subcommand
///
/// Reads the assignment from stdin, runs it, and prints the report on stdout.
pub async fn worker_main(cancel: CancellationToken) -> Result<()> {
    use tokio::io::AsyncReadExt;

    let mut input = Vec::new();
    tokio::io::stdin().read_to_end(&mut input).await?;
    let assignment: WorkerAssignment = serde_json::from_slice(&input)?;
    info!(worker_id = %assignment.worker_id, pid = std::process::id(), "Worker process started");

    let processor = assignment.processor.build();
    let report = run_worker(&assignment, processor, cancel).await;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&serde_json::to_vec(&report)?).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}
