//! Crawler tests against a wiremock directory tree

use clima_common::manifest::{read_manifest, validate_manifest};
use clima_ingest::crawler::{sample_path, Crawler, CrawlerConfig};
use std::time::Duration;
use url::Url;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

const ROOT: &str = "/climate/10_minutes/air_temperature/";
const CANONICAL: &str =
    "https://opendata.dwd.de/climate_environment/CDC/observations_germany/climate/10_minutes/air_temperature/";

fn index(links: &[&str]) -> String {
    let body: String = links
        .iter()
        .map(|l| format!("<a href=\"{}\">{}</a>\n", l, l))
        .collect();
    format!(
        "<html><head><title>Index</title></head><body><pre>\n<a href=\"?C=N;O=D\">Name</a>\n{}</pre></body></html>",
        body
    )
}

async fn mount_listing(server: &MockServer, dir: &str, links: &[&str]) {
    Mock::given(method("GET"))
        .and(path(format!("{}{}", ROOT, dir)))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string(index(links)),
        )
        .mount(server)
        .await;
}

/// Two station archives per tree level, a nested directory, and noise links
async fn fixture() -> MockServer {
    let server = MockServer::start().await;
    mount_listing(
        &server,
        "",
        &["../", "recent/", "historical/", "DESCRIPTION_obsgermany.pdf"],
    )
    .await;
    mount_listing(
        &server,
        "historical/",
        &[
            "../",
            "meta_data/",
            "10minutenwerte_TU_00003_19930428_19991231_hist.zip",
            "10minutenwerte_TU_00001_19930428_20091231_hist.zip",
        ],
    )
    .await;
    mount_listing(
        &server,
        "historical/meta_data/",
        &["../", "Meta_Daten_zehn_min_tu_00003.zip"],
    )
    .await;
    mount_listing(
        &server,
        "recent/",
        &[
            "../",
            "10minutenwerte_TU_00003_akt.zip",
            "10minutenwerte_TU_00003_akt.zip",
            "10minutenwerte_TU_00044_akt.ZIP",
        ],
    )
    .await;
    server
}

fn config(server: &MockServer) -> CrawlerConfig {
    let base = Url::parse(&format!("{}{}", server.uri(), ROOT)).unwrap();
    let mut config = CrawlerConfig::new(base, Url::parse(CANONICAL).unwrap());
    config.throttle = Duration::ZERO;
    config.retry_base_delay = Duration::from_millis(10);
    config.retry_max_delay = Duration::from_millis(20);
    config.dataset_key = Some("10_minutes_air_temperature".to_string());
    config
}

#[tokio::test]
async fn test_manifest_is_sorted_canonical_and_deterministic() {
    let server = fixture().await;
    let dir = tempfile::tempdir().unwrap();

    let first = Crawler::new(config(&server)).unwrap().crawl().await;
    let second = Crawler::new(config(&server)).unwrap().crawl().await;
    let a = dir.path().join("a.jsonl");
    let b = dir.path().join("b.jsonl");
    first.write_manifest(&a).unwrap();
    second.write_manifest(&b).unwrap();

    assert_eq!(std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap());
    assert!(first.errors.is_empty());

    let keys: Vec<(String, String)> = first
        .records
        .iter()
        .map(|r| (r.relative_path.clone(), r.filename.clone()))
        .collect();
    let expected = [
        ("historical/", "10minutenwerte_TU_00001_19930428_20091231_hist.zip"),
        ("historical/", "10minutenwerte_TU_00003_19930428_19991231_hist.zip"),
        ("historical/meta_data/", "Meta_Daten_zehn_min_tu_00003.zip"),
        ("recent/", "10minutenwerte_TU_00003_akt.zip"),
        ("recent/", "10minutenwerte_TU_00044_akt.ZIP"),
    ];
    let expected: Vec<(String, String)> = expected
        .iter()
        .map(|(p, f)| (p.to_string(), f.to_string()))
        .collect();
    assert_eq!(keys, expected);

    for record in &first.records {
        assert!(record.url.starts_with(CANONICAL), "{}", record.url);
        assert!(record.url.ends_with(&format!("/{}", record.filename)));
        assert_eq!(record.dataset_key.as_deref(), Some("10_minutes_air_temperature"));
    }

    let report = validate_manifest(&a).unwrap();
    assert!(report.is_valid(), "{:?}", report.issues);
    assert_eq!(report.total_records, 5);
    assert_eq!(read_manifest(&a).unwrap(), first.records);
}

#[tokio::test]
async fn test_subpaths_limit_the_crawl() {
    let server = fixture().await;
    let config = config(&server).with_subpaths(["recent/"]);

    let result = Crawler::new(config).unwrap().crawl().await;
    assert_eq!(result.files_written, 2);
    assert!(result.records.iter().all(|r| r.relative_path == "recent/"));
}

#[tokio::test]
async fn test_depth_and_item_limits() {
    let server = fixture().await;

    let mut shallow = config(&server);
    shallow.max_depth = 1;
    let result = Crawler::new(shallow).unwrap().crawl().await;
    assert!(result
        .records
        .iter()
        .all(|r| r.relative_path != "historical/meta_data/"));
    assert_eq!(result.files_written, 4);

    let mut limited = config(&server);
    limited.limit = Some(2);
    let result = Crawler::new(limited).unwrap().crawl().await;
    assert_eq!(result.records.len(), 2);
}

#[tokio::test]
async fn test_failing_directory_is_skipped_after_retries() {
    let server = MockServer::start().await;
    mount_listing(&server, "", &["broken/", "recent/"]).await;
    mount_listing(&server, "recent/", &["a.zip"]).await;
    Mock::given(method("GET"))
        .and(path(format!("{}broken/", ROOT)))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let result = Crawler::new(config(&server)).unwrap().crawl().await;

    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("broken/"));
    assert_eq!(result.files_written, 1);
    assert_eq!(result.records[0].filename, "a.zip");
}

#[tokio::test]
async fn test_transient_error_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ROOT))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_listing(&server, "", &["a.zip"]).await;

    let result = Crawler::new(config(&server)).unwrap().crawl().await;
    assert!(result.errors.is_empty());
    assert_eq!(result.files_written, 1);
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = MockServer::start().await;
    mount_listing(&server, "", &["gone/"]).await;
    Mock::given(method("GET"))
        .and(path(format!("{}gone/", ROOT)))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let result = Crawler::new(config(&server)).unwrap().crawl().await;
    assert_eq!(result.errors.len(), 1);
    assert!(result.records.is_empty());
}

#[tokio::test]
async fn test_sample_is_sorted_prefix_and_deterministic() {
    let server = fixture().await;
    let dir = tempfile::tempdir().unwrap();

    let mut samples = Vec::new();
    for run in ["a", "b"] {
        let result = Crawler::new(config(&server)).unwrap().crawl().await;
        let manifest = dir.path().join(run).join("dwd_x_urls.jsonl");
        result.write_manifest(&manifest).unwrap();
        let sample = sample_path(&manifest, 3);
        result.write_sample(&sample, 3).unwrap();

        assert!(sample.ends_with("dwd_x_urls_sample3.jsonl"));
        let full = read_manifest(&manifest).unwrap();
        assert_eq!(read_manifest(&sample).unwrap(), full[..3].to_vec());
        assert!(validate_manifest(&sample).unwrap().is_valid());
        samples.push(std::fs::read(&sample).unwrap());
    }
    assert_eq!(samples[0], samples[1]);
}
