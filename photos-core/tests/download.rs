//! Downloader behavior against a real local HTTP server.

mod common;

use std::time::Duration;

use common::{png_bytes, serve, url, Canned};
use photos_core::{parse_url, DownloadOutcome, Downloader};

const LIMIT: usize = 32 * 1024;

fn downloader() -> Downloader {
    Downloader::new(128, Duration::from_secs(5)).unwrap()
}

async fn fetch(raw: &str, limit: usize, override_limit: bool) -> DownloadOutcome {
    downloader()
        .fetch(&parse_url(raw).unwrap(), limit, override_limit)
        .await
}

#[tokio::test]
async fn test_valid_image_is_normalized() {
    common::init_tracing();
    let addr = serve(vec![
        ("/wide.png", Canned::png(png_bytes(96, 64))),
        ("/tall.png", Canned::png(png_bytes(20, 50))),
    ])
    .await;

    for path in ["/wide.png", "/tall.png"] {
        match fetch(&url(addr, path), LIMIT, false).await {
            DownloadOutcome::Success(bitmap) => assert_eq!(bitmap.dimensions(), (128, 128)),
            other => panic!("expected success for {path}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_declared_length_over_limit_is_too_large() {
    let addr = serve(vec![(
        "/huge.png",
        Canned::png(Vec::new()).declaring(10 * 1024 * 1024),
    )])
    .await;
    let outcome = fetch(&url(addr, "/huge.png"), LIMIT, false).await;
    assert!(matches!(outcome, DownloadOutcome::TooLarge), "got {outcome:?}");
}

#[tokio::test]
async fn test_override_lifts_the_limit() {
    let body = png_bytes(64, 64);
    let limit = body.len() / 2;
    let addr = serve(vec![("/a.png", Canned::png(body))]).await;

    let capped = fetch(&url(addr, "/a.png"), limit, false).await;
    assert!(matches!(capped, DownloadOutcome::TooLarge), "got {capped:?}");

    let lifted = fetch(&url(addr, "/a.png"), limit, true).await;
    assert!(lifted.is_success(), "got {lifted:?}");
}

#[tokio::test]
async fn test_non_image_payload_is_not_image() {
    let addr = serve(vec![(
        "/page",
        Canned::ok("text/html", b"<html><body>hello</body></html>".to_vec()),
    )])
    .await;
    let outcome = fetch(&url(addr, "/page"), LIMIT, false).await;
    assert!(matches!(outcome, DownloadOutcome::NotImage), "got {outcome:?}");
}

#[tokio::test]
async fn test_missing_resource_is_not_found() {
    let addr = serve(vec![]).await;
    let outcome = fetch(&url(addr, "/nothing.png"), LIMIT, false).await;
    assert!(matches!(outcome, DownloadOutcome::NotFound), "got {outcome:?}");
}

#[tokio::test]
async fn test_truncated_body_is_not_found() {
    let body = png_bytes(32, 32);
    let declared = body.len() + 500;
    let addr = serve(vec![("/cut.png", Canned::png(body).declaring(declared))]).await;
    let outcome = fetch(&url(addr, "/cut.png"), LIMIT, false).await;
    assert!(matches!(outcome, DownloadOutcome::NotFound), "got {outcome:?}");
}

#[tokio::test]
async fn test_unreachable_host_is_not_found() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let outcome = fetch(&url(addr, "/a.png"), LIMIT, false).await;
    assert!(matches!(outcome, DownloadOutcome::NotFound), "got {outcome:?}");
}
