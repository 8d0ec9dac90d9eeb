//! The HLS writer: turns the fMP4 bytes a session produces into a master playlist,
//! one media playlist per variant, and the init/media segment files on disk, using `m3u8-rs` for
//! playlist serialization. Every write (playlist or segment) goes through a temp-file-plus-rename
//! so that a concurrent HTTP GET of the playlist never observes a half-written file.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use m3u8_rs::{
    AlternativeMedia, AlternativeMediaType, MasterPlaylist, MediaPlaylist, MediaPlaylistType,
    MediaSegment, Map as M3uMap, Resolution, VariantStream,
};
use tracing::debug;

use crate::error::WriteError;
use crate::select::VariantKind;

/// One emitted media segment, tracked so the sliding window can evict the oldest entries and the
/// playlist can be rebuilt from scratch on every refresh (no incremental appends to
/// the `.m3u8` text, always a clean rewrite).
#[derive(Debug, Clone)]
pub struct EmittedSegment {
    pub number: u64,
    pub filename: String,
    pub duration_seconds: f64,
    pub discontinuity: bool,
}

/// Per-variant playlist state: the sliding window of recently emitted segments plus the metadata
/// needed to render `EXT-X-MEDIA-SEQUENCE` and `EXT-X-TARGETDURATION` correctly.
pub struct VariantWriter {
    pub kind: VariantKind,
    pub name: String,
    dir: PathBuf,
    window_size: usize,
    window: VecDeque<EmittedSegment>,
    media_sequence: u64,
    target_duration: u64,
    discontinuity_sequence: u64,
    init_filename: Option<String>,
    ended: bool,
}

impl VariantWriter {
    pub fn new(kind: VariantKind, name: impl Into<String>, dir: PathBuf, window_size: usize) -> Self {
        VariantWriter {
            kind,
            name: name.into(),
            dir,
            window_size,
            window: VecDeque::new(),
            media_sequence: 0,
            target_duration: 1,
            discontinuity_sequence: 0,
            init_filename: None,
            ended: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes the init segment (`EXT-X-MAP`) atomically. Called once per variant, and again if a
    /// manifest refresh swaps in a representation with different initialization bytes
    /// (an init-segment content change forces `EXT-X-DISCONTINUITY` on the next
    /// media segment). Idempotent: if the file already holds these exact bytes, the write
    /// is skipped after a byte comparison.
    pub async fn write_init(&mut self, bytes: &Bytes) -> Result<(), WriteError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| WriteError::Io {
                path: self.dir.clone(),
                source: e,
            })?;
        let filename = "init.mp4".to_string();
        let path = self.dir.join(&filename);
        if let Ok(existing) = tokio::fs::read(&path).await {
            if existing == bytes.as_ref() {
                self.init_filename = Some(filename);
                return Ok(());
            }
        }
        atomic_write(&path, bytes).await?;
        self.init_filename = Some(filename);
        Ok(())
    }

    /// Appends one media segment's bytes to disk and to the sliding window, evicting the oldest
    /// entry (and bumping `media_sequence`) once `window_size` is exceeded. `discontinuity`
    /// should be set when the caller detected an init-segment change, a timescale change, or a
    /// gap in segment numbers since the previous append.
    pub async fn append_segment(
        &mut self,
        number: u64,
        bytes: &Bytes,
        duration_seconds: f64,
        discontinuity: bool,
    ) -> Result<(), WriteError> {
        let filename = format!("seg_{number}.m4s");
        atomic_write(&self.dir.join(&filename), bytes).await?;

        if discontinuity {
            self.discontinuity_sequence += 1;
        }
        self.target_duration = self.target_duration.max(duration_seconds.ceil() as u64);
        self.window.push_back(EmittedSegment {
            number,
            filename,
            duration_seconds,
            discontinuity,
        });
        while self.window.len() > self.window_size {
            if let Some(evicted) = self.window.pop_front() {
                let path = self.dir.join(&evicted.filename);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    debug!("failed to remove evicted segment {}: {e}", path.display());
                }
            }
        }
        if let Some(front) = self.window.front() {
            self.media_sequence = front.number;
        }
        Ok(())
    }

    /// Marks this variant's stream as complete (VOD reached its last segment) so the next
    /// playlist render carries `EXT-X-ENDLIST`.
    pub fn finalize(&mut self) {
        self.ended = true;
    }

    /// Renders and atomically writes this variant's media playlist.
    pub async fn write_playlist(&self) -> Result<(), WriteError> {
        let Some(init_filename) = &self.init_filename else {
            debug!("skipping playlist render for {}: no init segment yet", self.name);
            return Ok(());
        };
        let segments = self
            .window
            .iter()
            .map(|seg| MediaSegment {
                uri: seg.filename.clone(),
                duration: seg.duration_seconds as f32,
                map: Some(M3uMap {
                    uri: init_filename.clone(),
                    byte_range: None,
                }),
                discontinuity: seg.discontinuity,
                ..Default::default()
            })
            .collect();

        let playlist = MediaPlaylist {
            version: Some(7),
            target_duration: self.target_duration as f32,
            media_sequence: self.media_sequence,
            playlist_type: Some(if self.ended {
                MediaPlaylistType::Vod
            } else {
                MediaPlaylistType::Event
            }),
            end_list: self.ended,
            discontinuity_sequence: self.discontinuity_sequence,
            segments,
            ..Default::default()
        };

        let mut buf = Vec::new();
        playlist
            .write_to(&mut buf)
            .map_err(|e| WriteError::Playlist(e.to_string()))?;
        atomic_write(&self.dir.join("index.m3u8"), &Bytes::from(buf)).await
    }
}

/// Writes the master playlist referencing the video variant (`EXT-X-STREAM-INF`) and the audio
/// variant as an `EXT-X-MEDIA` alternative rendition grouped onto it.
pub async fn write_master_playlist(
    root: &Path,
    video: Option<&VariantWriter>,
    audio: Option<&VariantWriter>,
    video_bandwidth: u64,
    video_codecs: Option<&str>,
    video_resolution: Option<(u64, u64)>,
) -> Result<(), WriteError> {
    let mut variants = Vec::new();
    let mut alternatives = Vec::new();

    if let Some(audio) = audio {
        alternatives.push(AlternativeMedia {
            media_type: AlternativeMediaType::Audio,
            uri: Some(format!("{}/index.m3u8", audio.name)),
            group_id: "aud".to_string(),
            language: None,
            assoc_language: None,
            name: audio.name.clone(),
            default: true,
            autoselect: true,
            channels: None,
            ..Default::default()
        });
    }

    if let Some(video) = video {
        variants.push(VariantStream {
            uri: "index.m3u8".to_string(),
            bandwidth: video_bandwidth,
            codecs: video_codecs.map(str::to_string),
            resolution: video_resolution.map(|(width, height)| Resolution { width, height }),
            audio: audio.map(|_| "aud".to_string()),
            ..Default::default()
        });
    }

    let master = MasterPlaylist {
        version: Some(7),
        alternatives,
        variants,
        ..Default::default()
    };
    let mut buf = Vec::new();
    master
        .write_to(&mut buf)
        .map_err(|e| WriteError::Playlist(e.to_string()))?;
    atomic_write(&root.join("master.m3u8"), &Bytes::from(buf)).await
}

async fn atomic_write(path: &Path, bytes: &Bytes) -> Result<(), WriteError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| WriteError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    use std::io::Write;
    tmp.write_all(bytes).map_err(|e| WriteError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    tmp.persist(path).map_err(|e| WriteError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_segment_evicts_oldest_and_advances_media_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = VariantWriter::new(VariantKind::Video, "video", dir.path().to_path_buf(), 3);
        writer.write_init(&Bytes::from_static(b"init")).await.unwrap();
        for n in 1..=5u64 {
            writer
                .append_segment(n, &Bytes::from_static(b"seg"), 2.0, false)
                .await
                .unwrap();
        }
        assert_eq!(writer.window.len(), 3);
        assert_eq!(writer.window.front().unwrap().number, 3);
        assert_eq!(writer.media_sequence, 3);
    }

    #[tokio::test]
    async fn write_playlist_without_init_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let writer = VariantWriter::new(VariantKind::Audio, "audio", dir.path().to_path_buf(), 3);
        writer.write_playlist().await.unwrap();
        assert!(!dir.path().join("index.m3u8").exists());
    }

    #[tokio::test]
    async fn discontinuity_increments_the_sequence_counter() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = VariantWriter::new(VariantKind::Video, "video", dir.path().to_path_buf(), 6);
        writer.write_init(&Bytes::from_static(b"init")).await.unwrap();
        writer
            .append_segment(1, &Bytes::from_static(b"seg"), 2.0, false)
            .await
            .unwrap();
        assert_eq!(writer.discontinuity_sequence, 0);
        writer
            .append_segment(2, &Bytes::from_static(b"seg"), 2.0, true)
            .await
            .unwrap();
        assert_eq!(writer.discontinuity_sequence, 1);
        writer
            .append_segment(3, &Bytes::from_static(b"seg"), 2.0, true)
            .await
            .unwrap();
        assert_eq!(writer.discontinuity_sequence, 2);
    }

    #[tokio::test]
    async fn finalize_sets_endlist_on_next_render() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = VariantWriter::new(VariantKind::Video, "video", dir.path().to_path_buf(), 3);
        writer.write_init(&Bytes::from_static(b"init")).await.unwrap();
        writer
            .append_segment(1, &Bytes::from_static(b"seg"), 2.0, false)
            .await
            .unwrap();
        writer.finalize();
        writer.write_playlist().await.unwrap();
        let text = tokio::fs::read_to_string(dir.path().join("index.m3u8"))
            .await
            .unwrap();
        assert!(text.contains("EXT-X-ENDLIST"));
    }
}
