//! `representation_id` forces a specific video rendition regardless of bandwidth
//! ranking.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::extract::Path as AxumPath;
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use dash_hls_gateway::config::SessionConfig;
use dash_hls_gateway::manager::StreamManager;
use common::{fake_segment, setup_logging};

const MPD_THREE_RENDITIONS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT4S">
  <Period>
    <AdaptationSet contentType="video">
      <Representation id="lo" mimeType="video/mp4" codecs="avc1.640015" bandwidth="500000">
        <SegmentTemplate initialization="lo_init.mp4" media="lo_$Number$.m4s" startNumber="1" duration="2" timescale="1"/>
      </Representation>
      <Representation id="mid" mimeType="video/mp4" codecs="avc1.640020" bandwidth="1000000">
        <SegmentTemplate initialization="mid_init.mp4" media="mid_$Number$.m4s" startNumber="1" duration="2" timescale="1"/>
      </Representation>
      <Representation id="hi" mimeType="video/mp4" codecs="avc1.640028" bandwidth="2000000">
        <SegmentTemplate initialization="hi_init.mp4" media="hi_$Number$.m4s" startNumber="1" duration="2" timescale="1"/>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

async fn send_manifest() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/dash+xml")
        .body(Body::from(MPD_THREE_RENDITIONS))
        .unwrap()
}

async fn send_media(AxumPath(name): AxumPath<String>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .body(Body::from(fake_segment(&name)))
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn representation_id_override_selects_the_requested_rendition() {
    setup_logging();
    let app = Router::new()
        .route("/manifest.mpd", get(send_manifest))
        .route("/{name}", get(send_media));

    let handle = axum_server::Handle::new();
    let bound = handle.clone();
    tokio::spawn(async move {
        axum_server::bind("127.0.0.1:16602".parse().unwrap())
            .handle(bound)
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let tmp = tempfile::tempdir().unwrap();
    let manager = StreamManager::new(tmp.path());
    let config = SessionConfig {
        mpd_url: "http://127.0.0.1:16602/manifest.mpd".to_string(),
        key: None,
        kid: None,
        key_map: Default::default(),
        mp4decrypt_path: "mp4decrypt".to_string(),
        representation_id: Some("mid".to_string()),
        label: None,
        poll_interval: 0.3,
        window_size: 6,
        history_size: 128,
        headers: Default::default(),
        output_dir: None,
        http_timeout_seconds: 15.0,
    };
    let id = manager.create(config).await;

    let mut snapshot = manager.get(id).await.unwrap();
    for _ in 0..50 {
        if snapshot.state == "stopped" || snapshot.state == "error" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        snapshot = manager.get(id).await.unwrap();
    }
    assert_eq!(snapshot.state, "stopped", "error_message={:?}", snapshot.error_message);

    let dir = manager.session_dir(id).await.unwrap();
    let master = tokio::fs::read_to_string(dir.join("master.m3u8")).await.unwrap();
    assert!(master.contains("BANDWIDTH=1000000"), "master playlist:\n{master}");
    assert!(dir.join("seg_1.m4s").exists());

    handle.shutdown();
}
