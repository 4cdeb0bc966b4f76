//! Orchestrator subprocess-isolation contract: a worker that never returns (a handler that sleeps
//! past the configured hard timeout) is terminated by the parent, and the run as a whole still
//! exits non-zero with a `TimeoutError` recorded in the per-state status CSV.

use assert_cmd::Command;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::time::Duration;

fn write_catalog(dim_dir: &std::path::Path, state: &str, file_url: &str) {
    let urls_dir = dim_dir.join("urls");
    std::fs::create_dir_all(&urls_dir).unwrap();
    let body = serde_json::json!([{
        "ccn": "450001",
        "hospital_name": "Slow Hospital",
        "file_url": file_url,
    }]);
    std::fs::write(
        urls_dir.join(format!("{}.json", state.to_ascii_lowercase())),
        body.to_string(),
    )
    .unwrap();
}

fn write_empty_vocab(dim_dir: &std::path::Path) {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"concept_code\tvocabulary_id\n99213\tCPT4\n").unwrap();
    let gz = encoder.finish().unwrap();
    std::fs::write(dim_dir.join("CONCEPT.csv.gz"), gz).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn hung_worker_is_killed_and_reported_as_timeout() {
    let app = Router::new().route("/prices.csv", get(|| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        "unreachable"
    }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let workspace = tempfile::tempdir().unwrap();
    let dim_dir = workspace.path().join("dim");
    write_catalog(&dim_dir, "tx", &format!("http://{addr}/prices.csv"));
    write_empty_vocab(&dim_dir);

    let data_dir = workspace.path().join("data");
    let status_dir = workspace.path().join("status");

    let assert = tokio::task::spawn_blocking(move || {
        Command::cargo_bin("mrf-scraper")
            .unwrap()
            .arg("--state")
            .arg("tx")
            .arg("--dim-dir")
            .arg(&dim_dir)
            .arg("--data-dir")
            .arg(&data_dir)
            .arg("--status-dir")
            .arg(&status_dir)
            .arg("--parallel")
            .arg("1")
            .arg("--timeout")
            .arg("1")
            .timeout(Duration::from_secs(20))
            .output()
            .unwrap()
    })
    .await
    .unwrap();

    assert!(!assert.status.success(), "run with a hung worker must exit non-zero");

    let status_csv = std::fs::read_to_string(status_dir.join("TX.csv")).unwrap();
    assert!(status_csv.contains("TimeoutError"), "status csv: {status_csv}");
    assert!(status_csv.contains("FAILURE"), "status csv: {status_csv}");
}
