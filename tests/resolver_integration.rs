//! Integration tests for link resolution over HTTP.

use std::sync::Arc;
use std::time::Duration;

use bookdl_core::CancellationToken;
use bookdl_core::resolver::{
    HttpPageFetcher, MarkupLinkExtractor, PageFetcher, PageResolver, ResolveError, ResolveStep,
    Resolver, build_default_resolver_registry, fast_download_link,
};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

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

fn fetcher() -> Arc<dyn PageFetcher> {
    Arc::new(HttpPageFetcher::new(2, Duration::from_millis(10)).unwrap())
}

fn page_resolver() -> PageResolver {
    PageResolver::new(fetcher(), Arc::new(MarkupLinkExtractor::new()))
}

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/html")
        .set_body_string(body)
}

// ==================== Page Resolver ====================

#[tokio::test]
async fn test_page_resolver_extracts_relative_get_link() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/ads.php"))
        .respond_with(html(
            r#"<html><body><a href="get.php?md5=abc&amp;key=K1"><h2>GET</h2></a></body></html>"#,
        ))
        .mount(&server)
        .await;

    let link = format!("{}/ads.php?md5=abc", server.uri());
    let step = page_resolver()
        .resolve(&link, &CancellationToken::new())
        .await
        .unwrap();

    let ResolveStep::Url(resolved) = step else {
        panic!("expected a URL, got {step:?}");
    };
    assert_eq!(resolved.url, format!("{}/get.php?md5=abc&key=K1", server.uri()));
    assert_eq!(resolved.metadata.get("resolver").unwrap(), "page");
}

#[tokio::test]
async fn test_page_resolver_missing_page_is_unavailable() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let step = page_resolver()
        .resolve(&format!("{}/gone", server.uri()), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(step, ResolveStep::Unavailable("page not found".to_string()));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_page_resolver_retries_server_errors_then_gives_up() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let step = page_resolver()
        .resolve(&format!("{}/flaky", server.uri()), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(step, ResolveStep::Unavailable(_)));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_page_resolver_surfaces_countdown() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(html(
            r#"<p>Please wait <span class="js-partner-countdown">15</span> seconds</p>"#,
        ))
        .mount(&server)
        .await;

    let step = page_resolver()
        .resolve(
            &format!("{}/slow_download/abc/0/1", server.uri()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(step, ResolveStep::Countdown(Duration::from_secs(15)));
}

#[tokio::test]
async fn test_page_resolver_cancelled_token() {
    let server = require_mock_server!();
    let token = CancellationToken::new();
    token.signal();

    let err = page_resolver()
        .resolve(&format!("{}/ads.php", server.uri()), &token)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(server.received_requests().await.unwrap().is_empty());
}

// ==================== Default Registry ====================

#[tokio::test]
async fn test_registry_direct_link_needs_no_page_fetch() {
    let server = require_mock_server!();
    let registry = build_default_resolver_registry(fetcher(), None);

    let link = format!("{}/files/book.epub", server.uri());
    let step = registry
        .resolve(&link, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(step, ResolveStep::Url(ref r) if r.url == link));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_registry_fast_download_api() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/dyn/api/fast_download.json"))
        .and(query_param("md5", "abc"))
        .and(query_param("key", "secret"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"download_url": "https://fast.example/abc.epub"}"#),
        )
        .mount(&server)
        .await;

    let registry = build_default_resolver_registry(fetcher(), None);
    let link = fast_download_link(&server.uri(), "abc", "secret");
    let step = registry
        .resolve(&link, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(step, ResolveStep::Url(ref r) if r.url == "https://fast.example/abc.epub"));
}

#[tokio::test]
async fn test_registry_fast_download_error_falls_back_to_page() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/dyn/api/fast_download.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"error": "Invalid key"}"#))
        .mount(&server)
        .await;

    let registry = build_default_resolver_registry(fetcher(), None);
    let link = fast_download_link(&server.uri(), "abc", "bad");
    let err = registry
        .resolve(&link, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ResolveError::AllResolversFailed { tried_count: 2, ref last_reason, .. }
            if last_reason == "no download link on page"
    ));
}
