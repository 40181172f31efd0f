//! Bulk controller sequencing

use async_trait::async_trait;
use clima_ingest::config::{DatasetConfig, IngestConfig, PathsConfig, ProcessingConfig};
use clima_ingest::controller::{BulkIngestController, ProcessingResult};
use clima_ingest::jobs::{JobStatus, JobStore};
use clima_ingest::orchestrator::{InProcessLauncher, ProcessingMode};
use clima_ingest::processor::{DatasetProcessor, ProcessOutcome, ProcessorRegistry};
use clima_ingest::{IngestError, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Counting {
    calls: AtomicUsize,
}

#[async_trait]
impl DatasetProcessor for Counting {
    async fn validate_file_structure(&self, _path: &Path) -> Result<bool> {
        Ok(true)
    }

    async fn process_file(&self, path: &Path) -> Result<ProcessOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if path.ends_with("broken.zip") {
            Err(IngestError::processing("broken.zip", "unexpected end of archive"))
        } else {
            Ok(ProcessOutcome::success(3))
        }
    }

    async fn extract_metadata(&self, _path: &Path) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    fn expected_file_patterns(&self) -> Vec<String> {
        vec!["*.zip".to_string()]
    }
}

struct Setup {
    _dir: TempDir,
    config: IngestConfig,
    processors: BTreeMap<&'static str, Arc<Counting>>,
}

/// Datasets `a` and `c` are clean, `b` has one file that always fails
fn setup() -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let mut datasets = BTreeMap::new();
    let mut processors = BTreeMap::new();

    for (name, files) in [
        ("a", vec!["one.zip", "two.zip"]),
        ("b", vec!["one.zip", "broken.zip"]),
        ("c", vec!["one.zip"]),
    ] {
        let source = dir.path().join(name);
        std::fs::create_dir_all(&source).unwrap();
        for file in files {
            std::fs::write(source.join(file), b"PK").unwrap();
        }
        datasets.insert(
            name.to_string(),
            DatasetConfig {
                source_dir: source,
                ..DatasetConfig::default()
            },
        );
        processors.insert(name, Arc::new(Counting::default()));
    }

    let config = IngestConfig {
        paths: PathsConfig {
            progress_db: dir.path().join("progress.db"),
            ..PathsConfig::default()
        },
        processing: ProcessingConfig {
            max_workers: 2,
            max_retry_attempts: 0,
            ..ProcessingConfig::default()
        },
        datasets,
        ..IngestConfig::default()
    };

    Setup {
        _dir: dir,
        config,
        processors,
    }
}

async fn controller(setup: &Setup) -> BulkIngestController {
    let mut registry = ProcessorRegistry::new();
    for (name, processor) in &setup.processors {
        registry.register(*name, processor.clone());
    }
    let store = JobStore::open(setup.config.job_store_config()).await.unwrap();
    BulkIngestController::new(
        setup.config.clone(),
        store,
        Arc::new(InProcessLauncher::new(registry)),
        CancellationToken::new(),
    )
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_fail_fast_stops_before_next_dataset() {
    let setup = setup();
    let controller = controller(&setup).await;

    let result = controller
        .run(&names(&["a", "b", "c"]), ProcessingMode::Bulk)
        .await
        .unwrap();

    assert_eq!(result.overall, ProcessingResult::PartialSuccess);
    let ran: Vec<&str> = result.datasets.iter().map(|d| d.dataset.as_str()).collect();
    assert_eq!(ran, vec!["a", "b"]);
    assert_eq!(result.not_started(), vec!["c"]);

    assert!(result.datasets[0].is_clean());
    assert_eq!(result.datasets[1].orchestration.failed_files, 1);
    assert_eq!(setup.processors["c"].calls.load(Ordering::SeqCst), 0);
    assert_eq!(controller.store().get_stats("c").await.unwrap().total_jobs, 0);

    let summary = result.summary();
    assert_eq!(summary.datasets_attempted, 2);
    assert_eq!(summary.datasets_clean, 1);
    assert_eq!(summary.successful_files, 3);
    assert_eq!(summary.failed_files, 1);
}

#[tokio::test]
async fn test_all_clean_is_success() {
    let setup = setup();
    let controller = controller(&setup).await;

    let result = controller
        .run(&names(&["c", "a"]), ProcessingMode::Bulk)
        .await
        .unwrap();

    assert_eq!(result.overall, ProcessingResult::Success);
    assert_eq!(result.datasets.len(), 2);
    assert_eq!(result.datasets[0].dataset, "c");
}

#[tokio::test]
async fn test_first_dataset_failing_is_failure() {
    let setup = setup();
    let controller = controller(&setup).await;

    let result = controller
        .run(&names(&["b", "a"]), ProcessingMode::Bulk)
        .await
        .unwrap();

    assert_eq!(result.overall, ProcessingResult::Failure);
    assert_eq!(result.datasets.len(), 1);
    assert_eq!(setup.processors["a"].calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_configuration_errors_stop_before_any_work() {
    let setup = setup();
    let controller = controller(&setup).await;

    let err = controller
        .run(&names(&["a", "missing"]), ProcessingMode::Bulk)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Configuration(_)));
    assert_eq!(setup.processors["a"].calls.load(Ordering::SeqCst), 0);

    // Configured, but no processor registered for it
    let mut config = setup.config.clone();
    config.datasets.insert(
        "d".to_string(),
        DatasetConfig {
            source_dir: setup.config.datasets["a"].source_dir.clone(),
            ..DatasetConfig::default()
        },
    );
    let store = JobStore::open(config.job_store_config()).await.unwrap();
    let controller = BulkIngestController::new(
        config,
        store,
        Arc::new(InProcessLauncher::new(ProcessorRegistry::new())),
        CancellationToken::new(),
    );
    let err = controller
        .run(&names(&["d"]), ProcessingMode::Bulk)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Configuration(_)));
}

#[tokio::test]
async fn test_admin_pass_throughs() {
    let setup = setup();
    let controller = controller(&setup).await;
    controller
        .run(&names(&["b"]), ProcessingMode::Bulk)
        .await
        .unwrap();

    assert_eq!(
        controller
            .reset_failed_files("b", Some("%end of archive%"))
            .await
            .unwrap(),
        1
    );
    let job = controller
        .store()
        .get_job("b", "broken.zip")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);

    assert_eq!(
        controller
            .reset_stuck_files("b", Duration::from_secs(3600))
            .await
            .unwrap(),
        0
    );
    assert_eq!(controller.cleanup_old_records(30).await.unwrap(), 0);
}
