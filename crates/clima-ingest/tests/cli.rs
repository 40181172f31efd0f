//! End-to-end tests for the clima-ingest binary
//!
//! Covers:
//! - Manifest validation exit codes and JSON report
//! - Processing with child worker processes and in-process workers
//! - Configuration errors

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

const HEADER: &str = "STATIONS_ID;MESS_DATUM;QN;PP_10;TT_10;eor\n";

fn write_station_zip(path: &Path, rows: usize) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    zip.start_file("produkt_zehn_min_tu_00003.txt", zip::write::FileOptions::default())
        .unwrap();
    zip.write_all(HEADER.as_bytes()).unwrap();
    for i in 0..rows {
        writeln!(zip, "3;19930428{:04};1;987.3;24.9;eor", i).unwrap();
    }
    zip.finish().unwrap();
}

/// Config with dataset `x` holding two station archives
fn workspace() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("x");
    write_station_zip(&source.join("historical/10minutenwerte_TU_00003_hist.zip"), 4);
    write_station_zip(&source.join("recent/10minutenwerte_TU_00003_akt.zip"), 6);

    let config = format!(
        "[paths]\nprogress_db = '{}'\n\n[processing]\nmax_workers = 2\n\n[datasets.x]\nsource_dir = '{}'\n",
        dir.path().join("progress.db").display(),
        source.display()
    );
    std::fs::write(dir.path().join("clima.toml"), config).unwrap();
    dir
}

fn clima(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("clima-ingest").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("CLIMA_CONFIG")
        .env("LOG_LEVEL", "warn")
        .arg("--config")
        .arg(dir.path().join("clima.toml"));
    cmd
}

fn manifest_line(relative_path: &str, filename: &str) -> String {
    format!(
        "{{\"url\":\"https://opendata.dwd.de/climate/{}{}\",\"relative_path\":\"{}\",\"filename\":\"{}\"}}\n",
        relative_path, filename, relative_path, filename
    )
}

// ============================================================================
// Manifest validation
// ============================================================================

#[test]
fn test_validate_manifest_accepts_sorted() {
    let dir = workspace();
    let manifest = dir.path().join("ok.jsonl");
    std::fs::write(
        &manifest,
        manifest_line("historical/", "a.zip") + &manifest_line("recent/", "a.zip"),
    )
    .unwrap();

    clima(&dir)
        .arg("validate-manifest")
        .arg(&manifest)
        .assert()
        .success()
        .stdout(predicate::str::contains("2 records, 2 valid, 0 issues"));
}

#[test]
fn test_validate_manifest_rejects_unsorted_with_exit_4() {
    let dir = workspace();
    let manifest = dir.path().join("bad.jsonl");
    let report = dir.path().join("report.json");
    std::fs::write(
        &manifest,
        manifest_line("recent/", "a.zip") + &manifest_line("historical/", "a.zip"),
    )
    .unwrap();

    clima(&dir)
        .arg("validate-manifest")
        .arg(&manifest)
        .arg("--report")
        .arg(&report)
        .assert()
        .code(4)
        .stdout(predicate::str::contains("Unsorted"));

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();
    assert_eq!(report["total_records"], 2);
    assert_eq!(report["issues"][0]["kind"], "unsorted");
}

// ============================================================================
// Processing
// ============================================================================

#[test]
fn test_process_with_worker_processes() {
    let dir = workspace();

    clima(&dir)
        .arg("process")
        .arg("x")
        .assert()
        .success()
        .stdout(predicate::str::contains("2 files, 2 successful, 0 failed"))
        .stdout(predicate::str::contains("10 records"));

    let output = clima(&dir)
        .arg("stats")
        .arg("x")
        .arg("--json")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let stats: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(stats["completed"], 2);
    assert_eq!(stats["records_processed"], 10);
    assert_eq!(stats["success_rate"], 100.0);
    let workers = stats["workers"].as_array().unwrap();
    let per_worker: i64 = workers
        .iter()
        .map(|w| w["files_processed"].as_i64().unwrap())
        .sum();
    assert_eq!(per_worker, 2);

    let output = clima(&dir)
        .arg("db-stats")
        .arg("--json")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let db: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(db["datasets"], 1);
    assert_eq!(db["completed"], 2);

    clima(&dir)
        .arg("stuck")
        .arg("x")
        .assert()
        .success()
        .stdout(predicate::str::contains("No files of x processing"));
}

#[test]
fn test_ingest_in_process_then_incremental_noop() {
    let dir = workspace();

    clima(&dir)
        .arg("--in-process")
        .arg("ingest")
        .assert()
        .success()
        .stdout(predicate::str::contains("Overall: SUCCESS"));

    clima(&dir)
        .arg("--in-process")
        .arg("process")
        .arg("x")
        .arg("--incremental")
        .assert()
        .success()
        .stdout(predicate::str::contains("0 files"));
}

#[test]
fn test_corrupt_archive_fails_dataset() {
    let dir = workspace();
    std::fs::write(dir.path().join("x/recent/broken.zip"), b"not a zip").unwrap();

    clima(&dir)
        .arg("--in-process")
        .arg("process")
        .arg("x")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("1 failed"));

    clima(&dir)
        .arg("failed")
        .arg("x")
        .assert()
        .success()
        .stdout(predicate::str::contains("recent/broken.zip"));
}

// ============================================================================
// Configuration errors
// ============================================================================

#[test]
fn test_unknown_dataset_exits_2() {
    let dir = workspace();

    clima(&dir)
        .arg("process")
        .arg("nope")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown dataset"));
}
