//! The segment downloader: an async HTTP fetcher with per-host connection reuse
//! (via a shared `reqwest::Client`), caller-supplied headers, bounded retries with exponential
//! backoff and jitter, and byte-accurate result delivery. The downloader never interprets payload
//! bytes.

use std::collections::HashMap;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use tracing::{info, warn};
use url::Url;

use crate::error::{network_error, GatewayError, NetworkErrorKind};

const INITIAL_BACKOFF_MS: u64 = 250;
/// Total attempts per segment, counting the first try: 1 initial attempt plus `MAX_RETRIES`
/// retries on transient failure.
const MAX_ATTEMPTS: usize = 4;
const MAX_RETRIES: usize = MAX_ATTEMPTS - 1;

/// Shared HTTP client plus the per-stream defaults (timeout, extra headers) that every fetch for
/// a given session should carry.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    headers: HashMap<String, String>,
    timeout: Duration,
}

impl Downloader {
    pub fn new(client: reqwest::Client, headers: HashMap<String, String>, timeout: Duration) -> Self {
        Downloader {
            client,
            headers,
            timeout,
        }
    }

    /// Builds a client with keep-alive connection pooling and redirect-following (up to 5 hops).
    /// One client is shared across all fetches for a stream so that per-host connections are
    /// reused.
    pub fn default_client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .expect("building reqwest client")
    }

    /// Fetches `url`, retrying transient network errors and 5xx responses with exponential
    /// backoff (250ms initial delay, 4 attempts total, +/-20% jitter). A 404 short-circuits to
    /// `GatewayError::NotFound` without retrying, so the caller (the session loop) can treat it as
    /// "not yet available" and re-enumerate on the next refresh cycle. Other 4xx responses
    /// short-circuit to a client-class `GatewayError::Network`.
    pub async fn fetch(&self, url: &Url) -> Result<Bytes, GatewayError> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(INITIAL_BACKOFF_MS))
            .with_max_times(MAX_RETRIES)
            .with_jitter();

        let attempt = || async { self.one_attempt(url).await };

        attempt
            .retry(backoff)
            .when(|e: &AttemptError| e.transient)
            .notify(|err: &AttemptError, dur: Duration| {
                warn!("retrying {url} after {dur:?}: {}", err.source);
            })
            .await
            .map_err(|e| e.source)
    }

    async fn one_attempt(&self, url: &Url) -> Result<Bytes, AttemptError> {
        let mut req = self.client.get(url.clone()).timeout(self.timeout);
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }
        let response = req.send().await.map_err(|e| {
            let transient = reqwest_error_transient(&e);
            AttemptError {
                source: network_error(url, e),
                transient,
            }
        })?;

        let status = response.status();
        match classify_status(status) {
            StatusOutcome::Success => {}
            StatusOutcome::NotFound => {
                return Err(AttemptError {
                    source: GatewayError::NotFound {
                        url: url.to_string(),
                    },
                    transient: false,
                })
            }
            StatusOutcome::Retryable => {
                return Err(AttemptError {
                    source: GatewayError::Network {
                        url: url.to_string(),
                        kind: NetworkErrorKind::Client {
                            status: status.as_u16(),
                        },
                    },
                    transient: true,
                })
            }
            StatusOutcome::Fatal => {
                return Err(AttemptError {
                    source: GatewayError::Network {
                        url: url.to_string(),
                        kind: NetworkErrorKind::Client {
                            status: status.as_u16(),
                        },
                    },
                    transient: false,
                })
            }
        }

        info!("fetched {url} ({} bytes)", response.content_length().unwrap_or(0));
        response.bytes().await.map_err(|e| AttemptError {
            transient: reqwest_error_transient(&e),
            source: network_error(url, e),
        })
    }
}

/// How one response status should be handled: pass through, treated as "not yet available"
/// (404), retried (5xx, 408, 429), or treated as a fatal per-segment failure (other 4xx).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusOutcome {
    Success,
    NotFound,
    Retryable,
    Fatal,
}

fn classify_status(status: reqwest::StatusCode) -> StatusOutcome {
    if status == reqwest::StatusCode::NOT_FOUND {
        return StatusOutcome::NotFound;
    }
    if status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        return StatusOutcome::Retryable;
    }
    if status.is_client_error() {
        return StatusOutcome::Fatal;
    }
    StatusOutcome::Success
}

#[derive(Debug)]
struct AttemptError {
    source: GatewayError,
    transient: bool,
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}
impl std::error::Error for AttemptError {}

fn reqwest_error_transient(e: &reqwest::Error) -> bool {
    if e.is_timeout() || e.is_connect() {
        return true;
    }
    if let Some(status) = e.status() {
        return status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
    }
    false
}
