//! Recursive repository crawler
//!
//! Walks the HTML directory listings below a dataset root and produces a
//! sorted, deduplicated manifest of the files found. The crawl source and
//! the published location are separate URLs: listings are fetched from
//! `base_url` (production, a mirror, or a local fixture) while every emitted
//! record points at `canonical_base_url`, so fixture crawls still produce
//! production URLs.
//!
//! # Example
//!
//! ```no_run
//! use clima_ingest::crawler::{Crawler, CrawlerConfig};
//! use url::Url;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let root = Url::parse("https://opendata.dwd.de/climate_environment/CDC/observations_germany/climate/10_minutes/air_temperature/")?;
//! let config = CrawlerConfig::new(root.clone(), root).with_subpaths(["historical/"]);
//! let result = Crawler::new(config)?.crawl().await;
//! result.write_manifest("data/manifests/dwd_10_minutes_air_temperature_urls.jsonl")?;
//! # Ok(())
//! # }
//! ```

mod listing;

pub use listing::{parse_listing, Listing};

use clima_common::manifest::{write_manifest, ManifestRecord};
use reqwest::{Client, StatusCode};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{IngestError, Result};

/// Resolved crawl settings for one dataset
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Dataset root listings are fetched from; must end with `/`
    pub base_url: Url,
    /// Published dataset root; must end with `/`
    pub canonical_base_url: Url,
    /// Roots below `base_url`; empty means `base_url` itself
    pub subpaths: Vec<String>,
    /// Lowercase suffixes such as `.zip`; empty accepts every file
    pub include_extensions: Vec<String>,
    /// Directory levels below each root, the root being level 0
    pub max_depth: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub request_timeout: Duration,
    /// Pause before every request after the first
    pub throttle: Duration,
    pub sample_size: usize,
    /// Stop once this many records are collected
    pub limit: Option<usize>,
    pub user_agent: String,
    pub dataset_key: Option<String>,
}

impl CrawlerConfig {
    pub fn new(base_url: Url, canonical_base_url: Url) -> Self {
        Self {
            base_url,
            canonical_base_url,
            subpaths: Vec::new(),
            include_extensions: vec![".zip".to_string()],
            max_depth: 8,
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(4),
            request_timeout: Duration::from_secs(30),
            throttle: Duration::from_millis(250),
            sample_size: 100,
            limit: None,
            user_agent: format!("clima-ingest/{}", env!("CARGO_PKG_VERSION")),
            dataset_key: None,
        }
    }

    pub fn with_subpaths<I, S>(mut self, subpaths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subpaths = subpaths.into_iter().map(Into::into).collect();
        self
    }

    /// Delay before retry number `attempt` (0-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

/// Outcome of one crawl
#[derive(Debug, Clone, Default)]
pub struct CrawlResult {
    /// Sorted by `(relative_path, filename)`, unique by that pair
    pub records: Vec<ManifestRecord>,
    /// File links that passed the extension filter
    pub files_found: usize,
    pub files_written: usize,
    /// Duplicate links dropped
    pub files_skipped: usize,
    /// Directories that could not be listed
    pub errors: Vec<String>,
    pub elapsed: Duration,
}

impl CrawlResult {
    /// Atomically write the full manifest
    pub fn write_manifest(&self, path: impl AsRef<Path>) -> Result<()> {
        write_manifest(path.as_ref(), &self.records)?;
        info!(
            path = %path.as_ref().display(),
            records = self.records.len(),
            "Wrote manifest"
        );
        Ok(())
    }

    /// Atomically write the first `n` records next to the manifest
    pub fn write_sample(&self, path: impl AsRef<Path>, n: usize) -> Result<()> {
        let end = n.min(self.records.len());
        write_manifest(path.as_ref(), &self.records[..end])?;
        Ok(())
    }
}

/// `dwd_x_urls.jsonl` -> `dwd_x_urls_sample100.jsonl`
pub fn sample_path(manifest: &Path, n: usize) -> PathBuf {
    let stem = manifest
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "manifest".to_string());
    manifest.with_file_name(format!("{}_sample{}.jsonl", stem, n))
}

pub struct Crawler {
    config: CrawlerConfig,
    client: Client,
}

#[derive(Default)]
struct CrawlState {
    records: Vec<ManifestRecord>,
    seen_urls: HashSet<String>,
    visited_dirs: HashSet<Url>,
    files_found: usize,
    duplicates: usize,
    errors: Vec<String>,
    requests: usize,
}

impl Crawler {
    pub fn new(config: CrawlerConfig) -> Result<Self> {
        for (key, url) in [
            ("base_url", &config.base_url),
            ("canonical_base_url", &config.canonical_base_url),
        ] {
            if !url.path().ends_with('/') {
                return Err(IngestError::config(format!(
                    "{} must end with '/': {}",
                    key, url
                )));
            }
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    /// Crawl every configured root
    ///
    /// Directory failures are recorded in [`CrawlResult::errors`] and never
    /// abort the crawl.
    pub async fn crawl(&self) -> CrawlResult {
        let started = Instant::now();
        let mut state = CrawlState::default();

        let roots: Vec<Url> = if self.config.subpaths.is_empty() {
            vec![self.config.base_url.clone()]
        } else {
            let mut roots = Vec::new();
            for sub in &self.config.subpaths {
                match self.config.base_url.join(sub) {
                    Ok(url) => roots.push(url),
                    Err(e) => {
                        warn!(subpath = %sub, error = %e, "Skipping invalid crawl root");
                        state.errors.push(format!("{}: {}", sub, e));
                    },
                }
            }
            roots
        };

        info!(
            base_url = %self.config.base_url,
            canonical_base_url = %self.config.canonical_base_url,
            roots = roots.len(),
            "Starting crawl"
        );

        for root in roots {
            if self.limit_reached(&state) {
                break;
            }
            self.crawl_root(root, &mut state).await;
        }

        let mut records = state.records;
        records.sort_by(|a, b| a.key().cmp(&b.key()));
        let before = records.len();
        records.dedup_by(|a, b| a.key() == b.key());
        let duplicates = state.duplicates + (before - records.len());

        let result = CrawlResult {
            files_found: state.files_found,
            files_written: records.len(),
            files_skipped: duplicates,
            errors: state.errors,
            elapsed: started.elapsed(),
            records,
        };

        info!(
            found = result.files_found,
            written = result.files_written,
            skipped = result.files_skipped,
            errors = result.errors.len(),
            requests = state.requests,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Crawl finished"
        );
        result
    }

    async fn crawl_root(&self, root: Url, state: &mut CrawlState) {
        // Depth-first; children are pushed in reverse so they pop in order
        let mut stack = vec![(root, 0usize)];

        while let Some((dir, depth)) = stack.pop() {
            if self.limit_reached(state) {
                debug!(limit = ?self.config.limit, "Item limit reached, stopping traversal");
                return;
            }
            if !state.visited_dirs.insert(dir.clone()) {
                continue;
            }

            if state.requests > 0 && !self.config.throttle.is_zero() {
                tokio::time::sleep(self.config.throttle).await;
            }
            state.requests += 1;

            let body = match self.fetch_with_retry(&dir).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(url = %dir, error = %e, "Skipping directory after retries");
                    state.errors.push(format!("{}: {}", dir, e));
                    continue;
                },
            };

            let listing = match parse_listing(&body, &dir, &self.config.base_url) {
                Ok(listing) => listing,
                Err(e) => {
                    warn!(url = %dir, error = %e, "Could not parse listing");
                    state.errors.push(format!("{}: {}", dir, e));
                    continue;
                },
            };
            debug!(
                url = %dir,
                depth,
                dirs = listing.dirs.len(),
                files = listing.files.len(),
                "Listed directory"
            );

            for file in &listing.files {
                if !self.extension_allowed(file) {
                    continue;
                }
                state.files_found += 1;

                let Some(record) = self.make_record(file) else {
                    continue;
                };
                if state.seen_urls.insert(record.url.clone()) {
                    state.records.push(record);
                    if self.limit_reached(state) {
                        return;
                    }
                } else {
                    state.duplicates += 1;
                }
            }

            for sub in listing.dirs.into_iter().rev() {
                if depth + 1 > self.config.max_depth {
                    warn!(
                        url = %sub,
                        max_depth = self.config.max_depth,
                        "Depth limit reached, not descending"
                    );
                    continue;
                }
                stack.push((sub, depth + 1));
            }
        }
    }

    /// GET a listing, retrying transient failures with capped backoff
    async fn fetch_with_retry(&self, url: &Url) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.fetch(url).await {
                Ok(body) => return Ok(body),
                Err((e, retryable)) if retryable && attempt < self.config.max_retries => {
                    let delay = self.config.backoff(attempt);
                    attempt += 1;
                    warn!(
                        url = %url,
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Listing request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                },
                Err((e, _)) => return Err(e),
            }
        }
    }

    async fn fetch(&self, url: &Url) -> std::result::Result<String, (IngestError, bool)> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| (IngestError::transient(url.as_str(), e.to_string()), true))?;

        let status = response.status();
        if !status.is_success() {
            let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
            return Err((
                IngestError::transient(url.as_str(), format!("HTTP {}", status)),
                retryable,
            ));
        }

        response
            .text()
            .await
            .map_err(|e| (IngestError::transient(url.as_str(), e.to_string()), true))
    }

    fn extension_allowed(&self, url: &Url) -> bool {
        if self.config.include_extensions.is_empty() {
            return true;
        }
        let path = url.path().to_lowercase();
        self.config
            .include_extensions
            .iter()
            .any(|ext| path.ends_with(ext.as_str()))
    }

    /// Map a discovered file URL to its canonical manifest record
    fn make_record(&self, file: &Url) -> Option<ManifestRecord> {
        let relative = file.path().strip_prefix(self.config.base_url.path())?;
        let (relative_path, filename) = match relative.rfind('/') {
            Some(idx) => (&relative[..=idx], &relative[idx + 1..]),
            None => ("", relative),
        };
        if filename.is_empty() {
            return None;
        }

        let url = match self.config.canonical_base_url.join(relative) {
            Ok(url) => url,
            Err(e) => {
                warn!(relative = %relative, error = %e, "Cannot build canonical URL");
                return None;
            },
        };

        Some(ManifestRecord {
            url: url.to_string(),
            relative_path: relative_path.to_string(),
            filename: filename.to_string(),
            dataset_key: self.config.dataset_key.clone(),
            size_bytes: None,
            last_modified: None,
            checksum: None,
        })
    }

    fn limit_reached(&self, state: &CrawlState) -> bool {
        self.config
            .limit
            .is_some_and(|limit| state.records.len() >= limit)
    }
}
