//! Error taxonomy for the gateway, as described in the design's error handling section.
//!
//! Each sub-error enum carries the context that the control-plane collaborator needs to render a
//! useful message (failing URL, representation id, segment number, subprocess exit code). Per-segment
//! failures are constructed and logged by the session loop; they are not necessarily fatal (see
//! `session.rs`).

use std::path::PathBuf;

use url::Url;

/// Top-level error type returned by the public API of this crate.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("network error fetching {url}: {kind}")]
    Network { url: String, kind: NetworkErrorKind },

    #[error("segment not found: {url}")]
    NotFound { url: String },

    #[error("decryption error: {0}")]
    Decryption(#[from] DecryptionError),

    #[error("write error: {0}")]
    Write(#[from] WriteError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

impl GatewayError {
    /// A short, stable label used when recording `Session.error_message`, so that the control
    /// plane can match on error class without string-parsing the full message.
    pub fn kind_label(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "ConfigError",
            GatewayError::Manifest(_) => "ManifestError",
            GatewayError::Network { .. } => "NetworkError",
            GatewayError::NotFound { .. } => "NotFound",
            GatewayError::Decryption(_) => "DecryptionError",
            GatewayError::Write(_) => "WriteError",
            GatewayError::Session(_) => "SessionError",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkErrorKind {
    #[error("timeout")]
    Timeout,
    #[error("connection failed")]
    Connect,
    #[error("client error: HTTP {status}")]
    Client { status: u16 },
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no usable video or audio representation found in manifest")]
    NoUsableRepresentation,
    #[error("invalid hex length for {field}: expected 32 characters, got {len}")]
    InvalidKeyLength { field: &'static str, len: usize },
    #[error("invalid URL {0:?}")]
    InvalidUrl(String),
    #[error("representation_id {0:?} not found in manifest")]
    RepresentationNotFound(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unsupported manifest feature: {0}")]
    Unsupported(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DecryptionError {
    #[error("{binary} exited with status {code:?}: {stderr_excerpt}")]
    ExitCode {
        binary: String,
        code: Option<i32>,
        stderr_excerpt: String,
    },
    #[error("{binary} produced empty output for input {input}")]
    EmptyOutput { binary: String, input: PathBuf },
    #[error("{binary} timed out after {seconds}s")]
    Timeout { binary: String, seconds: u64 },
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("playlist serialization failed: {0}")]
    Playlist(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {id} is in state {state:?}, expected {expected:?}")]
    WrongState {
        id: uuid::Uuid,
        state: &'static str,
        expected: &'static str,
    },
    #[error("session {0} not found")]
    NotFound(uuid::Uuid),
    #[error("segment {number} failed {consecutive_failures} consecutive times, giving up")]
    TooManyConsecutiveFailures {
        number: u64,
        consecutive_failures: u32,
    },
    #[error("manifest refresh failed {consecutive_failures} consecutive times, giving up")]
    TooManyRefreshFailures { consecutive_failures: u32 },
}

pub(crate) fn network_error(url: &Url, e: reqwest::Error) -> GatewayError {
    let kind = if e.is_timeout() {
        NetworkErrorKind::Timeout
    } else if e.is_connect() {
        NetworkErrorKind::Connect
    } else if let Some(status) = e.status() {
        NetworkErrorKind::Client {
            status: status.as_u16(),
        }
    } else {
        NetworkErrorKind::Other(e.to_string())
    };
    GatewayError::Network {
        url: url.to_string(),
        kind,
    }
}
