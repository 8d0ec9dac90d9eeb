/// Shared code for the integration test harness: an in-process mock origin server (axum +
/// axum-server) standing in for the DASH/segment origin, plus tiny fMP4 byte fixtures.

use std::sync::Once;

use lazy_static::lazy_static;

lazy_static! {
    static ref TRACING_INIT: Once = Once::new();
}

pub fn setup_logging() {
    use tracing_subscriber::{fmt, fmt::time::LocalTime, prelude::*, EnvFilter};
    use time::macros::format_description;

    TRACING_INIT.call_once(|| {
        let timer = LocalTime::new(format_description!("[hour]:[minute]:[second]"));
        let fmt_layer = fmt::layer().compact().with_timer(timer).with_target(false);
        let filter_layer = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info,reqwest=warn,hyper=warn,h2=warn"))
            .expect("initializing logging");
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    });
}

/// A deterministic, content-distinguishable stand-in for an fMP4 init or media segment. Real
/// `ftyp`/`moof`/`mdat` structure is irrelevant here: the pipeline under test only moves and
/// (optionally) decrypts bytes, it never parses ISO-BMFF boxes.
pub fn fake_segment(tag: &str) -> Vec<u8> {
    format!("fake-fmp4-segment:{tag}").into_bytes()
}
