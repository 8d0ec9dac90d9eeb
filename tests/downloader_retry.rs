//! The downloader retries transient 5xx responses with backoff, but gives up immediately on a
//! non-retryable 4xx rather than burning through its retry budget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use dash_hls_gateway::downloader::Downloader;
use dash_hls_gateway::error::GatewayError;
use url::Url;

#[derive(Clone)]
struct FlakyState {
    requests: Arc<AtomicUsize>,
    fail_first_n: usize,
}

async fn flaky(State(state): State<FlakyState>) -> StatusCode {
    let n = state.requests.fetch_add(1, Ordering::SeqCst);
    if n < state.fail_first_n {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

#[derive(Clone)]
struct CountingState {
    requests: Arc<AtomicUsize>,
}

async fn always_forbidden(State(state): State<CountingState>) -> StatusCode {
    state.requests.fetch_add(1, Ordering::SeqCst);
    StatusCode::FORBIDDEN
}

fn downloader() -> Downloader {
    Downloader::new(Downloader::default_client(), HashMap::new(), Duration::from_secs(5))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_5xx_is_retried_until_success() {
    let requests = Arc::new(AtomicUsize::new(0));
    let state = FlakyState {
        requests: requests.clone(),
        fail_first_n: 2,
    };
    let app = Router::new().route("/seg.m4s", get(flaky)).with_state(state);

    let handle = axum_server::Handle::new();
    let bound = handle.clone();
    tokio::spawn(async move {
        axum_server::bind("127.0.0.1:16606".parse().unwrap())
            .handle(bound)
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let dl = downloader();
    let url = Url::parse("http://127.0.0.1:16606/seg.m4s").unwrap();
    dl.fetch(&url).await.expect("should eventually succeed after retrying 5xx");
    assert_eq!(requests.load(Ordering::SeqCst), 3, "two failed attempts plus the succeeding one");

    handle.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_retryable_4xx_fails_on_the_first_attempt() {
    let requests = Arc::new(AtomicUsize::new(0));
    let state = CountingState {
        requests: requests.clone(),
    };
    let app = Router::new()
        .route("/seg.m4s", get(always_forbidden))
        .with_state(state);

    let handle = axum_server::Handle::new();
    let bound = handle.clone();
    tokio::spawn(async move {
        axum_server::bind("127.0.0.1:16607".parse().unwrap())
            .handle(bound)
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let dl = downloader();
    let url = Url::parse("http://127.0.0.1:16607/seg.m4s").unwrap();
    let err = dl.fetch(&url).await.unwrap_err();
    assert!(matches!(err, GatewayError::Network { .. }), "{err:?}");
    assert_eq!(requests.load(Ordering::SeqCst), 1, "a 403 must not be retried");

    handle.shutdown();
}
