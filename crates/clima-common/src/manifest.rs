//! Crawl manifest records and the integrity validator
//!
//! A manifest is a JSON Lines file with one [`ManifestRecord`] per line,
//! unique by `(relative_path, filename)` and sorted by that pair. The
//! crawler is the only producer; [`validate_manifest`] is the independent
//! downstream check run before downloads start.

use crate::error::{ClimaError, Result};
use crate::fs::write_atomic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use url::Url;

/// One remote file discovered by a crawl
///
/// Field order is the on-disk key order, which keeps manifests
/// byte-for-byte reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub url: String,
    pub relative_path: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ManifestRecord {
    /// Sort and uniqueness key
    pub fn key(&self) -> (&str, &str) {
        (&self.relative_path, &self.filename)
    }

    /// Path of the file relative to the dataset root, e.g. `historical/a.zip`
    pub fn relative_file_path(&self) -> String {
        format!("{}{}", self.relative_path, self.filename)
    }
}

/// Read every record of a manifest, failing on the first malformed line
pub fn read_manifest(path: impl AsRef<Path>) -> Result<Vec<ManifestRecord>> {
    let path = path.as_ref();
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut records = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ManifestRecord = serde_json::from_str(&line).map_err(|e| {
            ClimaError::manifest_integrity(format!(
                "{}:{}: invalid record: {}",
                path.display(),
                idx + 1,
                e
            ))
        })?;
        records.push(record);
    }

    Ok(records)
}

/// Atomically replace `path` with the given records, one JSON object per line
pub fn write_manifest(path: impl AsRef<Path>, records: &[ManifestRecord]) -> Result<()> {
    write_atomic(path, |w| {
        for record in records {
            serde_json::to_writer(&mut *w, record)?;
            w.write_all(b"\n")?;
        }
        Ok(())
    })
}

/// Category of a validation finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Line is not a JSON object
    Parse,
    /// A field breaks the record contract
    Record,
    /// Same `(relative_path, filename)` pair seen before
    Duplicate,
    /// Pair sorts before its predecessor
    Unsorted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestIssue {
    /// 1-based line number
    pub line: usize,
    pub kind: IssueKind,
    pub message: String,
}

/// Outcome of [`validate_manifest`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub path: PathBuf,
    pub total_records: usize,
    pub valid_records: usize,
    pub issues: Vec<ManifestIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn count(&self, kind: IssueKind) -> usize {
        self.issues.iter().filter(|i| i.kind == kind).count()
    }

    /// Turn a failed report into [`ClimaError::ManifestIntegrity`]
    pub fn into_result(self) -> Result<Self> {
        if self.is_valid() {
            return Ok(self);
        }
        let first = &self.issues[0];
        Err(ClimaError::manifest_integrity(format!(
            "{}: {} issue(s) ({} record, {} duplicate, {} unsorted); first at line {}: {}",
            self.path.display(),
            self.issues.len(),
            self.count(IssueKind::Record) + self.count(IssueKind::Parse),
            self.count(IssueKind::Duplicate),
            self.count(IssueKind::Unsorted),
            first.line,
            first.message
        )))
    }

    /// Write the report as pretty JSON, atomically
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        write_atomic(path, |w| {
            serde_json::to_writer_pretty(&mut *w, self)?;
            w.write_all(b"\n")?;
            Ok(())
        })
    }
}

/// Check a manifest against the record contract, uniqueness and ordering
///
/// Only I/O failures are returned as errors; contract violations are
/// collected in the report so that one run lists every problem.
pub fn validate_manifest(path: impl AsRef<Path>) -> Result<ValidationReport> {
    let path = path.as_ref();
    let reader = BufReader::new(std::fs::File::open(path)?);

    let mut report = ValidationReport {
        path: path.to_path_buf(),
        total_records: 0,
        valid_records: 0,
        issues: Vec::new(),
    };
    let mut seen: HashMap<(String, String), usize> = HashMap::new();
    let mut previous: Option<(String, String)> = None;

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        report.total_records += 1;

        let value: Value = match serde_json::from_str(&line) {
            Ok(v @ Value::Object(_)) => v,
            Ok(_) => {
                report.push(line_no, IssueKind::Parse, "line is not a JSON object");
                continue;
            },
            Err(e) => {
                report.push(line_no, IssueKind::Parse, format!("invalid JSON: {}", e));
                continue;
            },
        };

        let errors = check_record(&value);
        if !errors.is_empty() {
            for message in errors {
                report.push(line_no, IssueKind::Record, message);
            }
            continue;
        }
        report.valid_records += 1;

        let pair = (
            value["relative_path"].as_str().unwrap_or_default().to_string(),
            value["filename"].as_str().unwrap_or_default().to_string(),
        );

        if let Some(first_line) = seen.get(&pair) {
            report.push(
                line_no,
                IssueKind::Duplicate,
                format!(
                    "duplicate ({:?}, {:?}), first seen on line {}",
                    pair.0, pair.1, first_line
                ),
            );
        } else {
            seen.insert(pair.clone(), line_no);
        }

        if let Some(prev) = &previous {
            if pair < *prev {
                report.push(
                    line_no,
                    IssueKind::Unsorted,
                    format!(
                        "({:?}, {:?}) sorts before previous ({:?}, {:?})",
                        pair.0, pair.1, prev.0, prev.1
                    ),
                );
            }
        }
        previous = Some(pair);
    }

    Ok(report)
}

impl ValidationReport {
    fn push(&mut self, line: usize, kind: IssueKind, message: impl Into<String>) {
        self.issues.push(ManifestIssue {
            line,
            kind,
            message: message.into(),
        });
    }
}

fn check_record(obj: &Value) -> Vec<String> {
    let mut errors = Vec::new();

    let url = match obj.get("url").and_then(Value::as_str) {
        Some(u) => Some(u),
        None => {
            errors.push("url must be a string".to_string());
            None
        },
    };
    let relative_path = match obj.get("relative_path").and_then(Value::as_str) {
        Some(r) => Some(r),
        None => {
            errors.push("relative_path must be a string".to_string());
            None
        },
    };
    let filename = match obj.get("filename").and_then(Value::as_str) {
        Some(f) => Some(f),
        None => {
            errors.push("filename must be a string".to_string());
            None
        },
    };

    if let Some(filename) = filename {
        if filename.is_empty() {
            errors.push("filename must be non-empty".to_string());
        }
        if filename.contains('/') {
            errors.push("filename must not contain '/'".to_string());
        }
    }

    if let Some(rel) = relative_path {
        if rel.starts_with('/') {
            errors.push("relative_path must not start with '/'".to_string());
        }
        if !rel.is_empty() && !rel.ends_with('/') {
            errors.push("relative_path must be empty or end with '/'".to_string());
        }
    }

    if let Some(url) = url {
        if !url.starts_with("https://") {
            errors.push("url must start with https://".to_string());
        }
        match Url::parse(url) {
            Ok(parsed) => {
                if parsed.host_str().map_or(true, str::is_empty) {
                    errors.push("url must have a host".to_string());
                }
                if parsed.path().ends_with('/') {
                    errors.push("url must reference a file, not a directory".to_string());
                }
                let basename = parsed.path().rsplit('/').next().unwrap_or_default();
                if let Some(filename) = filename {
                    if basename != filename {
                        errors.push(format!(
                            "url basename {:?} does not match filename {:?}",
                            basename, filename
                        ));
                    }
                }
            },
            Err(e) => errors.push(format!("url does not parse: {}", e)),
        }
    }

    match obj.get("dataset_key") {
        None | Some(Value::Null) => {},
        Some(Value::String(s)) if !s.is_empty() => {},
        Some(_) => errors.push("dataset_key must be a non-empty string".to_string()),
    }

    match obj.get("size_bytes") {
        None | Some(Value::Null) => {},
        Some(v) if v.as_u64().is_some() => {},
        Some(_) => errors.push("size_bytes must be a non-negative integer or null".to_string()),
    }

    for field in ["last_modified", "checksum"] {
        match obj.get(field) {
            None | Some(Value::Null) | Some(Value::String(_)) => {},
            Some(_) => errors.push(format!("{} must be a string or null", field)),
        }
    }

    errors
}
