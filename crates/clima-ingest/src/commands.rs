//! Subcommand handlers
//!
//! Each handler returns the process exit code on completion; errors are
//! mapped to exit codes by [`IngestError::exit_code`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use clima_common::manifest::validate_manifest;

use crate::config::IngestConfig;
use crate::controller::{BulkIngestController, ProcessingResult};
use crate::crawler::{sample_path, Crawler};
use crate::error::{IngestError, Result};
use crate::jobs::JobStore;
use crate::orchestrator::{
    worker_main, DatasetOrchestrator, InProcessLauncher, ProcessLauncher, ProcessingMode,
    WorkerLauncher,
};
use crate::processor::ProcessorRegistry;
use crate::{Cli, Commands};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;

pub async fn execute(cli: &Cli, cancel: CancellationToken) -> Result<i32> {
    if cli.command.is_worker() {
        worker_main(cancel).await?;
        return Ok(EXIT_OK);
    }

    let config = IngestConfig::load(cli.config.as_deref())?;

    match &cli.command {
        Commands::Crawl {
            datasets,
            output,
            limit,
            validate,
        } => crawl(&config, datasets, output.as_deref(), *limit, *validate).await,
        Commands::ValidateManifest { path, report } => {
            validate_manifest_file(path, report.as_deref())
        },
        Commands::Process {
            dataset,
            incremental,
        } => {
            let dataset_config = config.dataset(dataset)?;
            if !dataset_config.source_dir.is_dir() {
                return Err(IngestError::config(format!(
                    "dataset {}: source_dir {} is not a directory",
                    dataset,
                    dataset_config.source_dir.display()
                )));
            }
            let launcher = launcher(&config, cli.in_process)?;
            launcher.check_dataset(dataset)?;

            let store = JobStore::open(config.job_store_config()).await?;
            let orchestrator = DatasetOrchestrator::new(
                store.clone(),
                dataset.clone(),
                dataset_config.clone(),
                config.processing.clone(),
                launcher,
                cancel,
            );
            let result = orchestrator.process_dataset(mode(*incremental)).await;
            store.close().await;

            println!(
                "{}: {:?}, {} files, {} successful, {} failed ({} failed attempts), {} skipped, {} records in {:.1}s",
                result.dataset,
                result.status,
                result.total_files,
                result.successful_files,
                result.failed_files,
                result.failed_attempts,
                result.skipped_files,
                result.total_records,
                result.processing_time.as_secs_f64()
            );
            if let Some(e) = &result.error_message {
                println!("  error: {}", e);
            }
            Ok(if result.is_clean() { EXIT_OK } else { EXIT_FAILURE })
        },
        Commands::Ingest {
            datasets,
            incremental,
        } => {
            let store = JobStore::open(config.job_store_config()).await?;
            let launcher = launcher(&config, cli.in_process)?;
            let controller = BulkIngestController::new(config.clone(), store.clone(), launcher, cancel);
            let result = controller.run(datasets, mode(*incremental)).await?;
            store.close().await;

            let summary = result.summary();
            println!("Overall: {}", result.overall);
            for d in &result.datasets {
                let o = &d.orchestration;
                println!(
                    "  {:<40} {:?}: {} ok, {} failed, {} records",
                    d.dataset, o.status, o.successful_files, o.failed_files, o.total_records
                );
            }
            for name in result.not_started() {
                println!("  {:<40} not started", name);
            }
            println!(
                "Datasets: {}/{} attempted, {} clean; files: {} of {} successful ({:.1}%)",
                summary.datasets_attempted,
                summary.datasets_requested,
                summary.datasets_clean,
                summary.successful_files,
                summary.total_files,
                summary.success_rate
            );
            Ok(if result.overall == ProcessingResult::Success {
                EXIT_OK
            } else {
                EXIT_FAILURE
            })
        },
        Commands::Stats { dataset, json } => {
            let store = JobStore::open(config.job_store_config()).await?;
            let summary = store.get_processing_summary(dataset).await?;
            store.close().await;

            if *json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                let stats = &summary.stats;
                println!("Dataset:         {}", stats.dataset);
                println!("Jobs:            {}", stats.total_jobs);
                println!("  pending:       {}", stats.pending);
                println!("  processing:    {}", stats.processing);
                println!("  completed:     {}", stats.completed);
                println!("  failed:        {}", stats.failed);
                println!("Records:         {}", stats.records_processed);
                println!("Success rate:    {:.1}%", stats.success_rate);
                println!("Complete:        {:.1}%", stats.completion_percentage());
                println!("Active workers:  {}", stats.active_workers);
                if let Some(avg) = stats.avg_duration {
                    println!("Avg duration:    {:.2}s", avg);
                }
                if let Some(eta) = stats.eta_seconds {
                    println!("ETA:             {:.0}s", eta);
                }
                if !summary.workers.is_empty() {
                    println!("Workers:");
                    for w in &summary.workers {
                        println!(
                            "  {:<12} {} files, {} ok, {} failed, {} records, avg {:.2}s",
                            w.worker_id,
                            w.files_processed,
                            w.successful,
                            w.failed,
                            w.records_processed,
                            w.avg_duration.unwrap_or(0.0)
                        );
                    }
                }
            }
            Ok(EXIT_OK)
        },
        Commands::DbStats { json } => {
            let store = JobStore::open(config.job_store_config()).await?;
            let stats = store.get_database_stats().await?;
            store.close().await;

            if *json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Datasets:        {}", stats.datasets);
                println!("Jobs:            {}", stats.total_jobs);
                println!("  pending:       {}", stats.pending);
                println!("  processing:    {}", stats.processing);
                println!("  completed:     {}", stats.completed);
                println!("  failed:        {}", stats.failed);
                println!("Worker sessions: {}", stats.worker_sessions);
                println!("Size:            {} bytes", stats.size_bytes);
            }
            Ok(EXIT_OK)
        },
        Commands::Stuck {
            dataset,
            timeout_hours,
        } => {
            let store = JobStore::open(config.job_store_config()).await?;
            let timeout = Duration::from_secs(timeout_hours * 3600);
            let stuck = store.get_stuck_files(dataset, timeout).await?;
            store.close().await;

            if stuck.is_empty() {
                println!("No files of {} processing for over {}h", dataset, timeout_hours);
            }
            for job in stuck {
                let since = job
                    .start_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{} (worker: {}, since {})",
                    job.file_path,
                    job.worker_id.as_deref().unwrap_or("-"),
                    since
                );
            }
            Ok(EXIT_OK)
        },
        Commands::ResetDataset { dataset } => {
            let store = JobStore::open(config.job_store_config()).await?;
            let reset = store.reset_dataset(dataset).await?;
            store.close().await;
            println!("Reset {} jobs of {} to pending", reset, dataset);
            Ok(EXIT_OK)
        },
        Commands::ResetFailed { dataset, pattern } => {
            let controller = admin_controller(&config).await?;
            let reset = controller
                .reset_failed_files(dataset, pattern.as_deref())
                .await?;
            controller.store().close().await;
            println!("Reset {} failed jobs of {}", reset, dataset);
            Ok(EXIT_OK)
        },
        Commands::ResetStuck {
            dataset,
            timeout_hours,
        } => {
            let controller = admin_controller(&config).await?;
            let timeout = Duration::from_secs(timeout_hours * 3600);
            let reset = controller.reset_stuck_files(dataset, timeout).await?;
            controller.store().close().await;
            println!("Reset {} stuck jobs of {}", reset, dataset);
            Ok(EXIT_OK)
        },
        Commands::Cleanup { days } => {
            let controller = admin_controller(&config).await?;
            let deleted = controller.cleanup_old_records(*days).await?;
            controller.store().close().await;
            println!("Deleted {} records older than {} days", deleted, days);
            Ok(EXIT_OK)
        },
        Commands::Sweep => {
            let store = JobStore::open(config.job_store_config()).await?;
            let report = store.cleanup_stale_sessions().await?;
            store.close().await;
            println!(
                "Reclaimed {} stale jobs, pruned {} worker sessions",
                report.reclaimed, report.sessions_pruned
            );
            Ok(EXIT_OK)
        },
        Commands::Failed { dataset, limit } => {
            let store = JobStore::open(config.job_store_config()).await?;
            let failed = store.get_failed_files(dataset, *limit).await?;
            store.close().await;

            if failed.is_empty() {
                println!("No failed files in {}", dataset);
            }
            for job in failed {
                println!(
                    "{} (retries: {}): {}",
                    job.file_path,
                    job.retry_count,
                    job.error_message.as_deref().unwrap_or("-")
                );
            }
            Ok(EXIT_OK)
        },
        Commands::Worker => Ok(EXIT_OK),
    }
}

fn mode(incremental: bool) -> ProcessingMode {
    if incremental {
        ProcessingMode::Incremental
    } else {
        ProcessingMode::Bulk
    }
}

fn launcher(config: &IngestConfig, in_process: bool) -> Result<Arc<dyn WorkerLauncher>> {
    if in_process {
        let registry = ProcessorRegistry::from_kinds(
            config
                .datasets
                .iter()
                .map(|(name, dataset)| (name.as_str(), dataset.processor)),
        );
        Ok(Arc::new(InProcessLauncher::new(registry)))
    } else {
        Ok(Arc::new(ProcessLauncher::current_exe()?))
    }
}

/// Controller for the store administration commands, which launch no workers
async fn admin_controller(config: &IngestConfig) -> Result<BulkIngestController> {
    let store = JobStore::open(config.job_store_config()).await?;
    Ok(BulkIngestController::new(
        config.clone(),
        store,
        Arc::new(InProcessLauncher::new(ProcessorRegistry::new())),
        CancellationToken::new(),
    ))
}

async fn crawl(
    config: &IngestConfig,
    datasets: &[String],
    output: Option<&Path>,
    limit: Option<usize>,
    validate: bool,
) -> Result<i32> {
    let names: Vec<String> = if datasets.is_empty() {
        config.enabled_datasets()
    } else {
        datasets.to_vec()
    };
    if output.is_some() && names.len() != 1 {
        return Err(IngestError::config("--output needs exactly one dataset"));
    }

    for name in &names {
        let mut crawler_config = config.crawler_config(name)?;
        if limit.is_some() {
            crawler_config.limit = limit;
        }
        let sample_size = crawler_config.sample_size;
        let crawler = Crawler::new(crawler_config)?;

        info!(dataset = %name, "Crawling");
        let result = crawler.crawl().await;

        let manifest: PathBuf = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config.manifest_path(name));
        result.write_manifest(&manifest)?;
        result.write_sample(sample_path(&manifest, sample_size), sample_size)?;

        println!(
            "{}: {} files found, {} written, {} duplicates skipped, {} errors in {:.1}s -> {}",
            name,
            result.files_found,
            result.files_written,
            result.files_skipped,
            result.errors.len(),
            result.elapsed.as_secs_f64(),
            manifest.display()
        );
        for e in &result.errors {
            warn!(dataset = %name, error = %e, "Crawl error");
        }

        if validate {
            validate_manifest(&manifest)?.into_result()?;
        }
    }
    Ok(EXIT_OK)
}

fn validate_manifest_file(path: &Path, report_path: Option<&Path>) -> Result<i32> {
    let report = validate_manifest(path)?;
    if let Some(out) = report_path {
        report.write_json(out)?;
    }

    println!(
        "{}: {} records, {} valid, {} issues",
        path.display(),
        report.total_records,
        report.valid_records,
        report.issues.len()
    );
    for issue in report.issues.iter().take(50) {
        println!("  line {}: {:?}: {}", issue.line, issue.kind, issue.message);
    }
    if report.issues.len() > 50 {
        println!("  ... {} more", report.issues.len() - 50);
    }

    report.into_result()?;
    Ok(EXIT_OK)
}
