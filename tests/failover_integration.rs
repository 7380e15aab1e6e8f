//! End-to-end failover across several candidate sources.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bookdl_core::failover::{AttemptStage, FailoverProtocol, NO_REACHABLE_SOURCE};
use bookdl_core::resolver::{HttpPageFetcher, build_default_resolver_registry};
use bookdl_core::transfer::NoProgress;
use bookdl_core::{
    ArtifactStore, BookRecord, HttpClient, Job, JobOutcome, JobQueue, RetryPolicy, TransferEngine,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;

macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        mock_server
    }};
}

const EPUB_BYTES: &[u8] = b"PK\x03\x04epub-content-for-testing";

// ==================== Helper Functions ====================

fn protocol(dir: &Path) -> FailoverProtocol {
    protocol_with_store(ArtifactStore::new(dir.join("staging"), dir.join("delivery")))
}

fn protocol_with_store(store: ArtifactStore) -> FailoverProtocol {
    let fetcher = Arc::new(HttpPageFetcher::new(1, Duration::from_millis(10)).unwrap());
    let registry = build_default_resolver_registry(fetcher, None);
    let engine = TransferEngine::new(
        HttpClient::new().unwrap(),
        RetryPolicy::new(2, Duration::from_millis(10), 2, Duration::from_millis(10))
            .with_jitter(Duration::ZERO),
    );
    FailoverProtocol::new(Arc::new(registry), Arc::new(engine), store)
        .with_countdown_limits(2, Duration::from_secs(1))
}

/// Queues a job the way the coordinator would and claims it.
fn claimed_job(id: &str, format: &str, links: Vec<String>) -> Job {
    let queue = JobQueue::new();
    let mut record = BookRecord::new(id);
    record.format = Some(format.to_string());
    record.download_urls = links;
    queue.add(id, record, 0);
    queue.claim_next().unwrap()
}

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/html")
        .set_body_string(body)
}

async fn mount_book(server: &MockServer, route: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/epub+zip")
                .set_body_bytes(EPUB_BYTES.to_vec()),
        )
        .mount(server)
        .await;
}

fn staging_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir.join("staging")).map_or(true, |mut entries| entries.next().is_none())
}

// ==================== Failover ====================

#[tokio::test]
async fn test_third_candidate_wins_after_two_dead_pages() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/mirror-a"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/mirror-b"))
        .respond_with(html("<html><body>No links here</body></html>"))
        .mount(&server)
        .await;
    mount_book(&server, "/files/book.epub").await;

    let dir = TempDir::new().unwrap();
    let job = claimed_job(
        "abc",
        "epub",
        vec![
            format!("{}/mirror-a", server.uri()),
            format!("{}/mirror-b", server.uri()),
            format!("{}/files/book.epub", server.uri()),
        ],
    );

    let report = protocol(dir.path()).run(&job, &NoProgress).await;

    let JobOutcome::Available { path } = &report.outcome else {
        panic!("expected available, got {:?}", report.outcome);
    };
    assert_eq!(path, &dir.path().join("delivery").join("abc.epub"));
    assert_eq!(std::fs::read(path).unwrap(), EPUB_BYTES);
    assert_eq!(report.failed_attempts.len(), 2);
    assert!(report.failed_attempts.iter().all(|a| a.stage == AttemptStage::Resolve));
    assert!(report.source_url.unwrap().ends_with("/files/book.epub"));
    assert!(staging_is_empty(dir.path()));
}

#[tokio::test]
async fn test_mirror_page_link_is_followed() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/ads.php"))
        .respond_with(html(r#"<a href="/get.php?md5=abc"><h2>GET</h2></a>"#))
        .mount(&server)
        .await;
    mount_book(&server, "/get.php").await;

    let dir = TempDir::new().unwrap();
    let job = claimed_job("abc", "epub", vec![format!("{}/ads.php?md5=abc", server.uri())]);

    let report = protocol(dir.path()).run(&job, &NoProgress).await;
    assert!(matches!(report.outcome, JobOutcome::Available { .. }));
    assert!(report.failed_attempts.is_empty());
}

#[tokio::test]
async fn test_countdown_gate_is_waited_out() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/slow_download/abc/0/1"))
        .respond_with(html(r#"<span class="js-partner-countdown">0</span>"#))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/slow_download/abc/0/1"))
        .respond_with(html(r#"<a href="/partner/abc.epub">Download now</a>"#))
        .mount(&server)
        .await;
    mount_book(&server, "/partner/abc.epub").await;

    let dir = TempDir::new().unwrap();
    let job = claimed_job(
        "abc",
        "epub",
        vec![format!("{}/slow_download/abc/0/1", server.uri())],
    );

    let report = protocol(dir.path()).run(&job, &NoProgress).await;
    assert!(matches!(report.outcome, JobOutcome::Available { .. }), "{report:?}");
}

#[tokio::test]
async fn test_endless_countdown_abandons_candidate() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(html(r#"<span class="js-partner-countdown">0</span>"#))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let job = claimed_job("abc", "epub", vec![format!("{}/slow_download/abc/0/1", server.uri())]);

    let report = protocol(dir.path()).run(&job, &NoProgress).await;
    assert_eq!(
        report.outcome,
        JobOutcome::Failed {
            reason: NO_REACHABLE_SOURCE.to_string()
        }
    );
    assert!(report.failed_attempts[0].reason.contains("countdown"));
    // One fetch per gate plus the one that found the gate again.
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_interstitial_fails_over_to_next_source() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/captcha/book.epub"))
        .respond_with(html("<!DOCTYPE html><html><body>Are you human?</body></html>"))
        .mount(&server)
        .await;
    mount_book(&server, "/good/book.epub").await;

    let dir = TempDir::new().unwrap();
    let queue = JobQueue::new();
    let mut record = BookRecord::new("abc");
    record.format = Some("epub".to_string());
    record.size = Some("1 KB".to_string());
    record.download_urls = vec![
        format!("{}/captcha/book.epub", server.uri()),
        format!("{}/good/book.epub", server.uri()),
    ];
    queue.add("abc", record, 0);
    let job = queue.claim_next().unwrap();

    let report = protocol(dir.path()).run(&job, &NoProgress).await;
    assert!(matches!(report.outcome, JobOutcome::Available { .. }));
    assert_eq!(report.failed_attempts.len(), 1);
    assert_eq!(report.failed_attempts[0].stage, AttemptStage::Transfer);
    assert!(report.failed_attempts[0].reason.contains("markup interstitial"));
}

#[tokio::test]
async fn test_all_candidates_exhausted() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let job = claimed_job(
        "abc",
        "pdf",
        vec![
            format!("{}/a/book.pdf", server.uri()),
            format!("{}/b/book.pdf", server.uri()),
        ],
    );

    let report = protocol(dir.path()).run(&job, &NoProgress).await;
    assert_eq!(
        report.outcome,
        JobOutcome::Failed {
            reason: NO_REACHABLE_SOURCE.to_string()
        }
    );
    assert_eq!(report.failed_attempts.len(), 2);
    assert!(report.failed_attempts.iter().all(|a| a.stage == AttemptStage::Transfer));
    assert!(!dir.path().join("delivery").join("abc.pdf").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_failing_post_process_rejects_every_candidate() {
    let server = require_mock_server!();
    mount_book(&server, "/a/book.epub").await;
    mount_book(&server, "/b/book.epub").await;

    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::new(dir.path().join("staging"), dir.path().join("delivery"))
        .with_post_process(Some(PathBuf::from("false")));
    let job = claimed_job(
        "abc",
        "epub",
        vec![
            format!("{}/a/book.epub", server.uri()),
            format!("{}/b/book.epub", server.uri()),
        ],
    );

    let report = protocol_with_store(store).run(&job, &NoProgress).await;

    assert!(matches!(report.outcome, JobOutcome::Failed { .. }));
    assert_eq!(report.failed_attempts.len(), 2);
    assert!(report.failed_attempts.iter().all(|a| a.stage == AttemptStage::Persist));
    assert!(report.failed_attempts[0].reason.contains("post-process"));
    assert!(!dir.path().join("delivery").join("abc.epub").exists());
    assert!(staging_is_empty(dir.path()));
}

#[tokio::test]
async fn test_cancel_mid_transfer_leaves_nothing() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(EPUB_BYTES.to_vec())
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let job = claimed_job(
        "abc",
        "epub",
        vec![
            format!("{}/slow/book.epub", server.uri()),
            format!("{}/other/book.epub", server.uri()),
        ],
    );
    let trigger = job.token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.signal();
    });

    let report = protocol(dir.path()).run(&job, &NoProgress).await;
    assert_eq!(report.outcome, JobOutcome::Cancelled);
    assert!(report.failed_attempts.is_empty());
    assert!(!dir.path().join("delivery").join("abc.epub").exists());
    assert!(staging_is_empty(dir.path()));
}
