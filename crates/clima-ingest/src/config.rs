//! Ingest configuration
//!
//! Loaded once at startup from a TOML file, then overridden by `CLIMA_*`
//! environment variables (a `.env` file is honoured), and validated before
//! any work begins. Components receive the parts they need explicitly.
//!
//! ```toml
//! [paths]
//! progress_db = "data/progress.db"
//!
//! [processing]
//! max_workers = 4
//! max_retry_attempts = 3
//!
//! [crawler]
//! base_url = "https://opendata.dwd.de/climate_environment/CDC/observations_germany/climate/"
//!
//! [datasets.10_minutes_air_temperature]
//! source_dir = "data/dwd/10_minutes_air_temperature"
//! remote_path = "10_minutes/air_temperature/"
//! subpaths = ["historical/", "recent/", "now/"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::crawler::CrawlerConfig;
use crate::error::{IngestError, Result};
use crate::jobs::JobStoreConfig;
use crate::orchestrator::DispatchStrategy;
use crate::processor::ProcessorKind;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub paths: PathsConfig,
    pub processing: ProcessingConfig,
    pub crawler: CrawlerSection,
    /// Datasets by name, in name order
    pub datasets: BTreeMap<String, DatasetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// SQLite job store shared by all workers
    pub progress_db: PathBuf,
    /// Where crawl manifests are written
    pub manifest_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            progress_db: PathBuf::from("data/progress.db"),
            manifest_dir: PathBuf::from("data/manifests"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub max_workers: usize,
    /// Retries after the first failed attempt before a file is terminally failed
    pub max_retry_attempts: u32,
    pub claim_timeout_secs: u64,
    pub busy_timeout_secs: u64,
    pub session_retention_secs: u64,
    pub dispatch: DispatchStrategy,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_retry_attempts: 3,
            claim_timeout_secs: 3600,
            busy_timeout_secs: 30,
            session_retention_secs: 24 * 3600,
            dispatch: DispatchStrategy::default(),
        }
    }
}

/// Crawl settings shared by all datasets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerSection {
    /// Where listings are fetched from; may be a mirror or a local fixture
    pub base_url: String,
    /// Published location emitted in manifests; defaults to `base_url`
    pub canonical_base_url: Option<String>,
    pub include_extensions: Vec<String>,
    pub max_depth: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub throttle_ms: u64,
    pub sample_size: usize,
    pub limit: Option<usize>,
    pub user_agent: String,
}

impl Default for CrawlerSection {
    fn default() -> Self {
        Self {
            base_url: "https://opendata.dwd.de/climate_environment/CDC/observations_germany/climate/"
                .to_string(),
            canonical_base_url: None,
            include_extensions: vec![".zip".to_string()],
            max_depth: 8,
            max_retries: 2,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 4000,
            request_timeout_secs: 30,
            throttle_ms: 250,
            sample_size: 100,
            limit: None,
            user_agent: format!("clima-ingest/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Local root the downloader mirrors remote files into
    pub source_dir: PathBuf,
    /// Globs relative to `source_dir`
    pub file_patterns: Vec<String>,
    pub processor: ProcessorKind,
    /// Restrict discovery to files listed in this manifest
    pub manifest: Option<PathBuf>,
    /// Dataset root below `crawler.base_url`
    pub remote_path: String,
    /// Crawl roots below `remote_path`; empty crawls the whole root
    pub subpaths: Vec<String>,
    pub enabled: bool,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::new(),
            file_patterns: vec!["**/*.zip".to_string()],
            processor: ProcessorKind::default(),
            manifest: None,
            remote_path: String::new(),
            subpaths: Vec::new(),
            enabled: true,
        }
    }
}

impl IngestConfig {
    /// Load from an optional TOML file plus environment, then validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // Missing .env is fine
        dotenvy::dotenv().ok();

        let config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        let config = config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            IngestError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
            .map_err(|e| IngestError::config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| IngestError::config(e.to_string()))
    }

    /// Apply `CLIMA_*` overrides
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(db) = std::env::var("CLIMA_PROGRESS_DB") {
            self.paths.progress_db = PathBuf::from(db);
        }
        if let Some(workers) = env_parse("CLIMA_MAX_WORKERS")? {
            self.processing.max_workers = workers;
        }
        if let Some(retries) = env_parse("CLIMA_MAX_RETRY_ATTEMPTS")? {
            self.processing.max_retry_attempts = retries;
        }
        if let Some(secs) = env_parse("CLIMA_CLAIM_TIMEOUT_SECS")? {
            self.processing.claim_timeout_secs = secs;
        }
        if let Ok(url) = std::env::var("CLIMA_BASE_URL") {
            self.crawler.base_url = url;
        }
        if let Ok(url) = std::env::var("CLIMA_CANONICAL_BASE_URL") {
            self.crawler.canonical_base_url = Some(url);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.paths.progress_db.as_os_str().is_empty() {
            return Err(IngestError::config("paths.progress_db must be set"));
        }
        if self.processing.max_workers == 0 {
            return Err(IngestError::config("processing.max_workers must be at least 1"));
        }
        if self.processing.claim_timeout_secs == 0 {
            return Err(IngestError::config(
                "processing.claim_timeout_secs must be greater than 0",
            ));
        }
        if self.processing.busy_timeout_secs == 0 {
            return Err(IngestError::config(
                "processing.busy_timeout_secs must be greater than 0",
            ));
        }
        if self.crawler.sample_size == 0 {
            return Err(IngestError::config("crawler.sample_size must be at least 1"));
        }

        for (name, dataset) in &self.datasets {
            if dataset.source_dir.as_os_str().is_empty() {
                return Err(IngestError::config(format!(
                    "datasets.{}.source_dir must be set",
                    name
                )));
            }
            if dataset.file_patterns.is_empty() {
                return Err(IngestError::config(format!(
                    "datasets.{}.file_patterns must not be empty",
                    name
                )));
            }
            for pattern in &dataset.file_patterns {
                glob::Pattern::new(pattern).map_err(|e| {
                    IngestError::config(format!(
                        "datasets.{}: invalid file pattern '{}': {}",
                        name, pattern, e
                    ))
                })?;
            }
        }

        Ok(())
    }

    pub fn dataset(&self, name: &str) -> Result<&DatasetConfig> {
        self.datasets
            .get(name)
            .ok_or_else(|| IngestError::config(format!("unknown dataset '{}'", name)))
    }

    /// Names of enabled datasets, in name order
    pub fn enabled_datasets(&self) -> Vec<String> {
        self.datasets
            .iter()
            .filter(|(_, d)| d.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn job_store_config(&self) -> JobStoreConfig {
        JobStoreConfig {
            path: self.paths.progress_db.clone(),
            max_retry_attempts: self.processing.max_retry_attempts,
            claim_timeout: Duration::from_secs(self.processing.claim_timeout_secs),
            busy_timeout: Duration::from_secs(self.processing.busy_timeout_secs),
            session_retention: Duration::from_secs(self.processing.session_retention_secs),
            ..JobStoreConfig::default()
        }
    }

    /// Resolve the crawl settings of one dataset
    pub fn crawler_config(&self, name: &str) -> Result<CrawlerConfig> {
        let dataset = self.dataset(name)?;
        let crawler = &self.crawler;

        let base = parse_dir_url("crawler.base_url", &crawler.base_url)?;
        let canonical = match &crawler.canonical_base_url {
            Some(url) => parse_dir_url("crawler.canonical_base_url", url)?,
            None => base.clone(),
        };
        let remote = as_dir(&dataset.remote_path);
        let join = |root: &Url| {
            root.join(&remote).map_err(|e| {
                IngestError::config(format!(
                    "datasets.{}.remote_path '{}': {}",
                    name, dataset.remote_path, e
                ))
            })
        };

        Ok(CrawlerConfig {
            base_url: join(&base)?,
            canonical_base_url: join(&canonical)?,
            subpaths: dataset.subpaths.iter().map(|s| as_dir(s)).collect(),
            include_extensions: crawler
                .include_extensions
                .iter()
                .map(|e| e.to_lowercase())
                .collect(),
            max_depth: crawler.max_depth,
            max_retries: crawler.max_retries,
            retry_base_delay: Duration::from_millis(crawler.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(crawler.retry_max_delay_ms),
            request_timeout: Duration::from_secs(crawler.request_timeout_secs),
            throttle: Duration::from_millis(crawler.throttle_ms),
            sample_size: crawler.sample_size,
            limit: crawler.limit,
            user_agent: crawler.user_agent.clone(),
            dataset_key: Some(name.to_string()),
        })
    }

    /// Default manifest location for a dataset, `dwd_<name>_urls.jsonl`
    pub fn manifest_path(&self, name: &str) -> PathBuf {
        self.paths.manifest_dir.join(format!("dwd_{}_urls.jsonl", name))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| IngestError::config(format!("{}={}: {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}

fn parse_dir_url(key: &str, raw: &str) -> Result<Url> {
    let url = Url::parse(&as_dir(raw))
        .map_err(|e| IngestError::config(format!("{} '{}': {}", key, raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(IngestError::config(format!(
            "{} must be an http(s) URL, got '{}'",
            key, raw
        )));
    }
    Ok(url)
}

/// Directory-style path: no leading slash, trailing slash unless empty
fn as_dir(path: &str) -> String {
    let trimmed = path.trim().trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    }
}
