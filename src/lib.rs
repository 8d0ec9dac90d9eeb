//! A Rust library for ingesting MPEG-DASH manifests (VOD and live), decrypting Common Encryption
//! (CENC) protected segments with caller-supplied keys, and re-exposing the result as fMP4-based
//! HLS: a master playlist, one media playlist per variant (video, audio), and the init/media
//! segment files backing them.
//!
//! [DASH](https://en.wikipedia.org/wiki/Dynamic_Adaptive_Streaming_over_HTTP) (dynamic adaptive
//! streaming over HTTP), also called MPEG-DASH, describes a streaming service as an XML manifest
//! (the MPD) that a client uses to decide which segments to request for adaptive playback.
//! [HLS](https://en.wikipedia.org/wiki/HTTP_Live_Streaming) describes the same kind of service
//! with an `.m3u8` playlist family instead. This library bridges the two: it runs the DASH side of
//! the conversation against the origin server, and writes out an HLS-compatible directory tree
//! that any ordinary HLS client or CDN can serve as-is.
//!
//! ## What this crate does
//!
//! - Parses DASH MPD manifests (`manifest`), resolving BaseURL chains and expanding
//!   SegmentTemplate / SegmentTimeline into concrete segment references (`segments`).
//! - Selects the representation(s) to carry for a stream, by bandwidth or by explicit id
//!   (`select`).
//! - Fetches segments over HTTP with retry and backoff (`downloader`).
//! - Decrypts CENC-protected segments via an external `mp4decrypt`-compatible binary
//!   (`decryptor`).
//! - Writes the resulting fMP4 HLS output, including the sliding live window
//!   (`hls`).
//! - Drives one DASH-to-HLS conversion end to end as a background task (`session`), and manages
//!   many of them concurrently (`manager`).
//!
//! ## What this crate does not do
//!
//! It does not transcode or remux between codecs, does not stitch multi-period discontinuities
//! beyond emitting an HLS discontinuity marker, does not acquire decryption keys from a license
//! server, and does not serve the generated HLS output over HTTP itself — that, along with the
//! REST control plane surface and the CLI, is left to the collaborator embedding this crate.

pub mod config;
pub mod decryptor;
pub mod downloader;
pub mod error;
pub mod hls;
pub mod manager;
pub mod manifest;
pub mod segments;
pub mod select;
pub mod session;

pub use config::SessionConfig;
pub use error::GatewayError;
pub use manager::{SessionSnapshot, StreamManager};
