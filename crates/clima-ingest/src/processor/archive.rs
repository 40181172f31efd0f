//! Processor for DWD station ZIP archives
//!
//! A station archive holds one or more `produkt_*.txt` members with a
//! `;`-separated header row followed by data rows, plus station metadata
//! members. Parsing the measurement values belongs to downstream stages;
//! this processor checks the archive layout and counts data rows.

use async_trait::async_trait;
use serde_json::json;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::debug;

use super::{DatasetProcessor, ProcessOutcome};
use crate::error::{IngestError, Result};

const PRODUCT_PREFIX: &str = "produkt_";
const FIELD_SEPARATOR: char = ';';

#[derive(Debug, Clone, Default)]
pub struct StationArchiveProcessor;

impl StationArchiveProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DatasetProcessor for StationArchiveProcessor {
    async fn validate_file_structure(&self, path: &Path) -> Result<bool> {
        let path = path.to_path_buf();
        run_blocking(label(&path), move || {
            let members = match open_archive(&path) {
                Ok(archive) => product_members(&archive),
                Err(e) => {
                    debug!(file = %path.display(), error = %e, "Not a readable ZIP archive");
                    return Ok(false);
                },
            };
            Ok(!members.is_empty())
        })
        .await
    }

    async fn process_file(&self, path: &Path) -> Result<ProcessOutcome> {
        let path = path.to_path_buf();
        run_blocking(label(&path), move || count_rows(&path)).await
    }

    async fn extract_metadata(&self, path: &Path) -> Result<serde_json::Value> {
        let path = path.to_path_buf();
        run_blocking(label(&path), move || {
            let size_bytes = std::fs::metadata(&path)?.len();
            let archive = open_archive(&path)?;
            let members: Vec<String> = archive.file_names().map(str::to_string).collect();
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            Ok(json!({
                "filename": filename,
                "station_id": station_id(&filename),
                "size_bytes": size_bytes,
                "product_members": product_members(&archive),
                "members": members,
            }))
        })
        .await
    }

    fn expected_file_patterns(&self) -> Vec<String> {
        vec!["**/*.zip".to_string()]
    }
}

/// Five-digit station id embedded in DWD archive names,
/// e.g. `10minutenwerte_TU_00003_19930428_19991231_hist.zip` -> `00003`
pub fn station_id(filename: &str) -> Option<String> {
    filename
        .split(['_', '.'])
        .find(|part| part.len() == 5 && part.bytes().all(|b| b.is_ascii_digit()))
        .map(str::to_string)
}

fn label(path: &Path) -> String {
    path.display().to_string()
}

/// Run ZIP work on the blocking pool
async fn run_blocking<T, F>(file: String, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| IngestError::processing(file, e.to_string()))?
}

fn open_archive(path: &Path) -> Result<zip::ZipArchive<File>> {
    let file = File::open(path)?;
    zip::ZipArchive::new(file)
        .map_err(|e| IngestError::structural(path.display().to_string(), e.to_string()))
}

fn product_members(archive: &zip::ZipArchive<File>) -> Vec<String> {
    let mut members: Vec<String> = archive
        .file_names()
        .filter(|name| {
            let base = name.rsplit('/').next().unwrap_or(name);
            base.starts_with(PRODUCT_PREFIX) && base.ends_with(".txt")
        })
        .map(str::to_string)
        .collect();
    members.sort();
    members
}

fn count_rows(path: &Path) -> Result<ProcessOutcome> {
    let file_label = label(path);
    let mut archive = open_archive(path)?;
    let members = product_members(&archive);
    if members.is_empty() {
        return Err(IngestError::structural(&file_label, "archive has no product member"));
    }

    let mut records = 0i64;
    for member in &members {
        let entry = archive
            .by_name(member)
            .map_err(|e| IngestError::structural(&file_label, format!("{}: {}", member, e)))?;
        let mut lines = BufReader::new(entry).lines();

        let header = match lines.next() {
            Some(line) => line?,
            None => return Ok(ProcessOutcome::failure(format!("{} is empty", member))),
        };
        let expected_fields = header.split(FIELD_SEPARATOR).count();

        for (idx, line) in lines.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let fields = line.split(FIELD_SEPARATOR).count();
            if fields != expected_fields {
                return Ok(ProcessOutcome::failure(format!(
                    "{} row {} has {} fields, header has {}",
                    member,
                    idx + 2,
                    fields,
                    expected_fields
                )));
            }
            records += 1;
        }
    }

    debug!(file = %file_label, members = members.len(), records, "Counted archive rows");
    Ok(ProcessOutcome::success(records))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn write_zip(dir: &Path, name: &str, members: &[(&str, &str)]) -> PathBuf {
        let path = dir.join(name);
        let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
        for (member, body) in members {
            zip.start_file(*member, zip::write::FileOptions::default())
                .unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
        path
    }

    const HEADER: &str = "STATIONS_ID;MESS_DATUM;QN;PP_10;TT_10;eor\n";

    #[tokio::test]
    async fn test_counts_data_rows_of_product_members() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!(
            "{}3;199304281230;1;987.3;24.9;eor\n3;199304281240;1;987.2;24.8;eor\n\n",
            HEADER
        );
        let path = write_zip(
            dir.path(),
            "10minutenwerte_TU_00003_19930428_19991231_hist.zip",
            &[
                ("produkt_zehn_min_tu_19930428_19991231_00003.txt", &body),
                ("Metadaten_Geographie_00003.txt", "ignored"),
            ],
        );
        let processor = StationArchiveProcessor::new();

        assert!(processor.validate_file_structure(&path).await.unwrap());
        let outcome = processor.process_file(&path).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::success(2));
    }

    #[tokio::test]
    async fn test_rejects_archive_without_product() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(dir.path(), "a.zip", &[("Metadaten_Geraete.txt", "x")]);
        let not_zip = dir.path().join("b.zip");
        std::fs::write(&not_zip, b"plain text").unwrap();
        let processor = StationArchiveProcessor::new();

        assert!(!processor.validate_file_structure(&path).await.unwrap());
        assert!(!processor.validate_file_structure(&not_zip).await.unwrap());
        assert!(matches!(
            processor.process_file(&path).await,
            Err(IngestError::StructuralValidation { .. })
        ));
    }

    #[tokio::test]
    async fn test_ragged_row_fails_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!("{}3;199304281230;1;eor\n", HEADER);
        let path = write_zip(dir.path(), "a.zip", &[("produkt_x.txt", &body)]);

        let outcome = StationArchiveProcessor::new()
            .process_file(&path)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error_message.unwrap().contains("row 2 has 4 fields"));
    }

    #[tokio::test]
    async fn test_metadata_includes_station_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(
            dir.path(),
            "10minutenwerte_TU_00044_now.zip",
            &[("produkt_zehn_now_tu_00044.txt", HEADER)],
        );

        let meta = StationArchiveProcessor::new()
            .extract_metadata(&path)
            .await
            .unwrap();
        assert_eq!(meta["station_id"], "00044");
        assert_eq!(meta["product_members"][0], "produkt_zehn_now_tu_00044.txt");
    }

    #[test]
    fn test_station_id_parsing() {
        assert_eq!(
            station_id("stundenwerte_RR_00102_akt.zip").as_deref(),
            Some("00102")
        );
        assert_eq!(station_id("DESCRIPTION_obsgermany.pdf"), None);
    }
}
