//! The stream session state machine: one task per active stream, cycling through
//! manifest refresh -> segment enumeration -> download -> decrypt -> append, until the source
//! goes VOD-complete, a caller requests a stop, or too many consecutive failures accumulate.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::decryptor;
use crate::downloader::Downloader;
use crate::error::{GatewayError, SessionError};
use crate::hls::{self, VariantWriter};
use crate::manifest::{self, resolve_base_url, MPD};
use crate::segments::{self, SegmentRef};
use crate::select::{self, Selection, VariantKind};

const MAX_CONSECUTIVE_SEGMENT_FAILURES: u32 = 10;
const MAX_CONSECUTIVE_REFRESH_FAILURES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Error => "error",
        }
    }
}

/// Selected-representation info surfaced to the control plane's `list`/`get` responses.
#[derive(Debug, Clone)]
pub struct RepresentationInfo {
    pub representation_id: String,
    pub bandwidth: u64,
    pub codecs: Option<String>,
    pub width: Option<u64>,
    pub height: Option<u64>,
}

impl RepresentationInfo {
    fn from_representation(rep: &crate::manifest::Representation) -> Self {
        RepresentationInfo {
            representation_id: rep.id.clone().unwrap_or_default(),
            bandwidth: rep.bandwidth.unwrap_or(0),
            codecs: rep.codecs.clone(),
            width: rep.width,
            height: rep.height,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: SessionState,
    pub error_message: Option<String>,
    pub last_manifest_refresh: Option<DateTime<Utc>>,
    pub master_playlist_path: Option<PathBuf>,
    pub video: Option<RepresentationInfo>,
    pub audio: Option<RepresentationInfo>,
}

struct VariantRuntime {
    writer: VariantWriter,
    last_number: Option<u64>,
    processed: HashSet<u64>,
    processed_order: VecDeque<u64>,
    history_cap: usize,
    representation_id: Option<String>,
    consecutive_failures: u32,
}

impl VariantRuntime {
    fn mark_processed(&mut self, number: u64) {
        self.processed.insert(number);
        self.processed_order.push_back(number);
        while self.processed_order.len() > self.history_cap {
            if let Some(oldest) = self.processed_order.pop_front() {
                self.processed.remove(&oldest);
            }
        }
    }
}

/// Everything one session's background task owns. Constructed by `manager::create`, which then
/// hands the `run` future to `tokio::spawn`.
pub struct Session {
    pub id: Uuid,
    config: SessionConfig,
    downloader: Downloader,
    root_dir: PathBuf,
    status: Arc<Mutex<SessionStatus>>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(id: Uuid, config: SessionConfig, root_dir: PathBuf, cancel: CancellationToken) -> Self {
        let headers = config.headers.clone();
        let timeout = Duration::from_secs_f64(config.http_timeout_seconds.max(1.0));
        let downloader = Downloader::new(Downloader::default_client(), headers, timeout);
        let status = Arc::new(Mutex::new(SessionStatus {
            state: SessionState::Starting,
            error_message: None,
            last_manifest_refresh: None,
            master_playlist_path: None,
            video: None,
            audio: None,
        }));
        Session {
            id,
            config,
            downloader,
            root_dir,
            status,
            cancel,
        }
    }

    pub fn status_handle(&self) -> Arc<Mutex<SessionStatus>> {
        self.status.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn set_state(&self, state: SessionState) {
        self.status.lock().await.state = state;
    }

    async fn fail(&self, err: &GatewayError) {
        error!(session = %self.id, "session failed: {err}");
        let mut status = self.status.lock().await;
        status.state = SessionState::Error;
        status.error_message = Some(format!("{}: {err}", err.kind_label()));
    }

    /// Runs the session to completion: a single `starting` pass, then repeated `running` refresh
    /// cycles until cancellation, VOD completion, or fatal failure.
    #[instrument(skip(self), fields(session = %self.id))]
    pub async fn run(self) {
        let key_map = match self.config.resolved_key_map() {
            Ok(map) => map,
            Err(e) => {
                self.fail(&GatewayError::from(e)).await;
                return;
            }
        };

        let mpd_url = match Url::parse(&self.config.mpd_url) {
            Ok(u) => u,
            Err(_) => {
                self.fail(&GatewayError::Config(crate::error::ConfigError::InvalidUrl(
                    self.config.mpd_url.clone(),
                )))
                .await;
                return;
            }
        };

        let mut state = match self.start(&mpd_url, key_map).await {
            Ok(s) => s,
            Err(e) => {
                self.fail(&e).await;
                return;
            }
        };

        self.set_state(SessionState::Running).await;

        loop {
            let interval = Duration::from_secs_f64(self.config.poll_interval.max(0.5));
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.set_state(SessionState::Stopping).await;
                    info!(session = %self.id, "cancellation requested, stopping");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            match self.refresh_cycle(&mpd_url, &mut state).await {
                Ok(true) => {
                    info!(session = %self.id, "source reached VOD completion");
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    self.fail(&e).await;
                    return;
                }
            }
        }

        if let Some(video) = state.video.as_mut() {
            video.writer.finalize();
            let _ = video.writer.write_playlist().await;
        }
        if let Some(audio) = state.audio.as_mut() {
            audio.writer.finalize();
            let _ = audio.writer.write_playlist().await;
        }
        self.set_state(SessionState::Stopped).await;
    }

    async fn start(&self, mpd_url: &Url, key_map: HashMap<String, String>) -> Result<RunState, GatewayError> {
        let bytes = self.downloader.fetch(mpd_url).await?;
        let xml = String::from_utf8_lossy(&bytes).into_owned();
        let mpd = manifest::parse(&xml)?;
        let selection = select::select_representations(&mpd, &self.config)?;

        let key_map = fill_kid_from_manifest(&mpd, &selection, key_map);
        let is_dynamic = mpd.is_dynamic();

        let mut video = match &selection.video {
            Some(sel) => Some(self.init_variant(&mpd, sel, "video", &key_map, is_dynamic).await?),
            None => None,
        };
        let mut audio = match &selection.audio {
            Some(sel) => Some(self.init_variant(&mpd, sel, "audio", &key_map, is_dynamic).await?),
            None => None,
        };

        if let Some(video) = video.as_mut() {
            video.writer.write_playlist().await.map_err(GatewayError::from)?;
        }
        if let Some(audio) = audio.as_mut() {
            audio.writer.write_playlist().await.map_err(GatewayError::from)?;
        }
        self.write_master(&mpd, &selection, video.as_ref(), audio.as_ref()).await?;

        self.update_representation_status(&mpd, &selection).await;
        self.status.lock().await.last_manifest_refresh = Some(Utc::now());

        Ok(RunState {
            mpd,
            selection,
            key_map,
            video,
            audio,
            refresh_failures: 0,
        })
    }

    async fn init_variant(
        &self,
        mpd: &MPD,
        selected: &select::SelectedRepresentation,
        name: &str,
        key_map: &HashMap<String, String>,
        is_dynamic: bool,
    ) -> Result<VariantRuntime, GatewayError> {
        let period = &mpd.periods[0];
        let adaptation = select::adaptation_at(mpd, selected);
        let representation = select::representation_at(mpd, selected);
        let base_url = resolve_base_url(
            &Url::parse(&self.config.mpd_url).expect("validated above"),
            mpd,
            period,
            adaptation,
            representation,
        )?;

        let init_path = representation
            .effective_segment_template(adaptation)
            .and_then(|t| t.initialization.clone())
            .ok_or_else(|| crate::error::ManifestError::Unsupported(
                "representation has no SegmentTemplate/@initialization".to_string(),
            ))?;
        let init_url = base_url.join(&init_path).map_err(|e| {
            crate::error::ManifestError::InvalidUrl(format!("{init_path}: {e}"))
        })?;
        let init_bytes = self.downloader.fetch(&init_url).await?;
        let init_bytes = self.maybe_decrypt(key_map, &init_bytes).await?;

        let dir = match selected.kind {
            VariantKind::Video => self.root_dir.clone(),
            VariantKind::Audio => self.root_dir.join(name),
        };
        // The sliding window only bounds live output; VOD retains every segment
        // for the session's lifetime, so the writer is given an effectively unbounded capacity.
        let window_cap = if is_dynamic { self.config.window_size } else { usize::MAX };
        let mut writer = VariantWriter::new(selected.kind, name, dir, window_cap);
        writer
            .write_init(&init_bytes)
            .await
            .map_err(GatewayError::from)?;

        Ok(VariantRuntime {
            writer,
            last_number: None,
            processed: HashSet::new(),
            processed_order: VecDeque::new(),
            history_cap: self.config.history_size.max(1),
            representation_id: representation.id.clone(),
            consecutive_failures: 0,
        })
    }

    /// Re-fetches and rewrites the init segment when a manifest refresh has selected a different
    /// representation than last cycle, returning whether a swap happened. The caller forces
    /// `EXT-X-DISCONTINUITY` on the next appended segment when this returns `true`
    /// (init-bytes change is a discontinuity trigger).
    async fn refresh_init_if_changed(
        &self,
        runtime: &mut VariantRuntime,
        base_url: &Url,
        adaptation: &crate::manifest::AdaptationSet,
        representation: &crate::manifest::Representation,
        key_map: &HashMap<String, String>,
    ) -> Result<bool, GatewayError> {
        if representation.id == runtime.representation_id {
            return Ok(false);
        }
        let init_path = representation
            .effective_segment_template(adaptation)
            .and_then(|t| t.initialization.clone())
            .ok_or_else(|| {
                crate::error::ManifestError::Unsupported(
                    "representation has no SegmentTemplate/@initialization".to_string(),
                )
            })?;
        let init_url = base_url
            .join(&init_path)
            .map_err(|e| crate::error::ManifestError::InvalidUrl(format!("{init_path}: {e}")))?;
        let init_bytes = self.downloader.fetch(&init_url).await?;
        let init_bytes = self.maybe_decrypt(key_map, &init_bytes).await?;
        runtime
            .writer
            .write_init(&init_bytes)
            .await
            .map_err(GatewayError::from)?;
        runtime.representation_id = representation.id.clone();
        Ok(true)
    }

    async fn write_master(
        &self,
        mpd: &MPD,
        selection: &Selection,
        video: Option<&VariantRuntime>,
        audio: Option<&VariantRuntime>,
    ) -> Result<(), GatewayError> {
        let video_bandwidth = selection
            .video
            .as_ref()
            .map(|s| select::representation_at(mpd, s).bandwidth.unwrap_or(0))
            .unwrap_or(0);
        let video_codecs = selection
            .video
            .as_ref()
            .map(|s| select::representation_at(mpd, s).codecs.clone())
            .flatten();
        let video_resolution = selection.video.as_ref().and_then(|s| {
            let rep = select::representation_at(mpd, s);
            Some((rep.width?, rep.height?))
        });
        hls::write_master_playlist(
            &self.root_dir,
            video.map(|v| &v.writer),
            audio.map(|a| &a.writer),
            video_bandwidth,
            video_codecs.as_deref(),
            video_resolution,
        )
        .await
        .map_err(GatewayError::from)
    }

    async fn update_representation_status(&self, mpd: &MPD, selection: &Selection) {
        let video = selection
            .video
            .as_ref()
            .map(|s| RepresentationInfo::from_representation(select::representation_at(mpd, s)));
        let audio = selection
            .audio
            .as_ref()
            .map(|s| RepresentationInfo::from_representation(select::representation_at(mpd, s)));
        let mut status = self.status.lock().await;
        status.video = video;
        status.audio = audio;
    }

    async fn maybe_decrypt(
        &self,
        key_map: &HashMap<String, String>,
        bytes: &Bytes,
    ) -> Result<Bytes, GatewayError> {
        if key_map.is_empty() {
            return Ok(bytes.clone());
        }
        decryptor::decrypt(&self.config.mp4decrypt_path, key_map, bytes)
            .await
            .map_err(GatewayError::from)
    }

    /// One manifest-refresh-and-catch-up cycle. Returns `Ok(true)` once the source is a static
    /// manifest and every enumerable segment has been emitted (VOD completion).
    async fn refresh_cycle(&self, mpd_url: &Url, state: &mut RunState) -> Result<bool, GatewayError> {
        let refreshed = self.downloader.fetch(mpd_url).await;
        let bytes = match refreshed {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(session = %self.id, "manifest refresh failed, keeping previous manifest: {e}");
                state.refresh_failures += 1;
                if state.refresh_failures > MAX_CONSECUTIVE_REFRESH_FAILURES {
                    return Err(GatewayError::from(SessionError::TooManyRefreshFailures {
                        consecutive_failures: state.refresh_failures,
                    }));
                }
                return Ok(false);
            }
        };
        state.refresh_failures = 0;

        let xml = String::from_utf8_lossy(&bytes).into_owned();
        let mpd = manifest::parse(&xml)?;
        let selection = select::select_representations(&mpd, &self.config)?;
        let is_dynamic = mpd.is_dynamic();
        let availability_start = mpd.availability_start_time();

        let video_fut = catch_up_variant(
            self,
            &mpd,
            &selection.video,
            state.video.as_mut(),
            &state.key_map,
            is_dynamic,
            availability_start,
        );
        let audio_fut = catch_up_variant(
            self,
            &mpd,
            &selection.audio,
            state.audio.as_mut(),
            &state.key_map,
            is_dynamic,
            availability_start,
        );
        let (video_done, audio_done) = tokio::join!(video_fut, audio_fut);
        let video_done = video_done?;
        let audio_done = audio_done?;

        state.mpd = mpd;
        state.selection = selection;
        self.update_representation_status(&state.mpd, &state.selection).await;
        self.status.lock().await.last_manifest_refresh = Some(Utc::now());

        let vod_complete = !is_dynamic && video_done && audio_done;
        Ok(vod_complete)
    }
}

struct RunState {
    mpd: MPD,
    selection: Selection,
    key_map: HashMap<String, String>,
    video: Option<VariantRuntime>,
    audio: Option<VariantRuntime>,
    refresh_failures: u32,
}

/// Enumerates, downloads, decrypts, and appends every not-yet-processed segment for one variant.
/// Returns whether this variant's source is exhausted (no selected representation, or a static
/// manifest with nothing left to enumerate) -- used by the caller to detect VOD completion.
async fn catch_up_variant(
    session: &Session,
    mpd: &MPD,
    selected: &Option<select::SelectedRepresentation>,
    runtime: Option<&mut VariantRuntime>,
    key_map: &HashMap<String, String>,
    is_dynamic: bool,
    availability_start: Option<DateTime<Utc>>,
) -> Result<bool, GatewayError> {
    let (Some(selected), Some(runtime)) = (selected, runtime) else {
        return Ok(true);
    };
    let period = &mpd.periods[0];
    let adaptation = select::adaptation_at(mpd, selected);
    let representation = select::representation_at(mpd, selected);
    let base_url = resolve_base_url(
        &Url::parse(&session.config.mpd_url).expect("validated in start()"),
        mpd,
        period,
        adaptation,
        representation,
    )?;

    let representation_changed = session
        .refresh_init_if_changed(runtime, &base_url, adaptation, representation, key_map)
        .await?;

    let Some(template) = representation.effective_segment_template(adaptation) else {
        return Ok(!is_dynamic);
    };

    let refs: Vec<SegmentRef> = if is_dynamic {
        let availability_start = availability_start.unwrap_or_else(Utc::now);
        segments::enumerate_live_computed(
            representation,
            template,
            &base_url,
            availability_start,
            chrono::Duration::zero(),
            Utc::now(),
        )
    } else {
        let available_ticks = mpd.mediaPresentationDuration.map(|d| {
            let timescale = template.timescale.unwrap_or(1);
            (d.as_secs_f64() * timescale as f64).round() as i64
        });
        segments::enumerate_static(representation, template, &base_url, available_ticks)
    };

    let pending: Vec<&SegmentRef> = refs
        .iter()
        .filter(|r| !runtime.processed.contains(&r.number))
        .collect();

    let mut force_discontinuity = representation_changed;
    for seg in pending {
        match download_and_append(session, runtime, seg, key_map, force_discontinuity).await {
            Ok(()) => {
                runtime.consecutive_failures = 0;
                runtime.mark_processed(seg.number);
                runtime.last_number = Some(seg.number);
                force_discontinuity = false;
            }
            Err(GatewayError::NotFound { url }) => {
                // Not yet available at the origin; not a failure, just try again next cycle.
                info!(session = %session.id, segment = seg.number, %url, "segment not yet available, will retry next cycle");
            }
            Err(e) => {
                runtime.consecutive_failures += 1;
                warn!(
                    session = %session.id,
                    segment = seg.number,
                    "segment failed ({}/{MAX_CONSECUTIVE_SEGMENT_FAILURES} consecutive): {e}",
                    runtime.consecutive_failures,
                );
                if runtime.consecutive_failures >= MAX_CONSECUTIVE_SEGMENT_FAILURES {
                    return Err(GatewayError::from(SessionError::TooManyConsecutiveFailures {
                        number: seg.number,
                        consecutive_failures: runtime.consecutive_failures,
                    }));
                }
            }
        }
    }

    runtime.writer.write_playlist().await.map_err(GatewayError::from)?;

    let exhausted = !is_dynamic
        && refs
            .last()
            .map(|last| runtime.last_number.map(|n| n >= last.number).unwrap_or(false))
            .unwrap_or(true);
    Ok(exhausted)
}

async fn download_and_append(
    session: &Session,
    runtime: &mut VariantRuntime,
    seg: &SegmentRef,
    key_map: &HashMap<String, String>,
    force_discontinuity: bool,
) -> Result<(), GatewayError> {
    let bytes = session.downloader.fetch(&seg.url).await?;
    let bytes = session.maybe_decrypt(key_map, &bytes).await?;

    let number_gap = match runtime.last_number {
        Some(last) => seg.number != last + 1,
        None => false,
    };
    let discontinuity = force_discontinuity || number_gap;

    runtime
        .writer
        .append_segment(seg.number, &bytes, seg.duration_seconds(), discontinuity)
        .await
        .map_err(GatewayError::from)
}

fn fill_kid_from_manifest(
    mpd: &MPD,
    selection: &Selection,
    mut key_map: HashMap<String, String>,
) -> HashMap<String, String> {
    if let Some(placeholder_key) = key_map.remove("") {
        let kid = [&selection.video, &selection.audio]
            .into_iter()
            .flatten()
            .find_map(|sel| {
                let aset = select::adaptation_at(mpd, sel);
                aset.kids().into_iter().next()
            });
        if let Some(kid) = kid {
            key_map.insert(kid, placeholder_key);
        } else {
            warn!("a decryption key was configured without a KID, and none could be found in the manifest's ContentProtection elements");
        }
    }
    key_map
}
