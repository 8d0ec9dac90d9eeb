//! Representation selection: a pure function over a parsed manifest and the session config,
//! producing at most one video and one audio representation. No I/O, fully
//! unit-testable.

use tracing::warn;

use crate::config::SessionConfig;
use crate::error::ConfigError;
use crate::manifest::{AdaptationSet, ContentType, Representation, MPD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantKind {
    Video,
    Audio,
}

/// A representation selected for one variant, together with the adaptation set it came from (for
/// ContentProtection / KID lookup) and its index within that adaptation set's representation
/// list (for looking it back up after a manifest refresh).
#[derive(Debug, Clone)]
pub struct SelectedRepresentation {
    pub kind: VariantKind,
    pub adaptation_index: usize,
    pub representation_index: usize,
}

pub struct Selection {
    pub video: Option<SelectedRepresentation>,
    pub audio: Option<SelectedRepresentation>,
}

/// Selects representations. Only the manifest's first Period is considered; subsequent periods
/// are ignored rather than rejected outright (see DESIGN.md).
pub fn select_representations(
    mpd: &MPD,
    config: &SessionConfig,
) -> Result<Selection, ConfigError> {
    if mpd.periods.len() > 1 {
        warn!(
            periods = mpd.periods.len(),
            "manifest has more than one Period; only the first is considered"
        );
    }
    let period = mpd
        .periods
        .first()
        .ok_or(ConfigError::NoUsableRepresentation)?;

    if let Some(wanted_id) = &config.representation_id {
        for (ai, aset) in period.adaptations.iter().enumerate() {
            for (ri, rep) in aset.representations.iter().enumerate() {
                if rep.id.as_deref() == Some(wanted_id.as_str()) {
                    let kind = match aset.inferred_content_type() {
                        ContentType::Video => VariantKind::Video,
                        ContentType::Audio => VariantKind::Audio,
                        ContentType::Text => {
                            return Err(ConfigError::RepresentationNotFound(wanted_id.clone()))
                        }
                    };
                    let selected = SelectedRepresentation {
                        kind,
                        adaptation_index: ai,
                        representation_index: ri,
                    };
                    return Ok(match kind {
                        VariantKind::Video => Selection {
                            video: Some(selected),
                            audio: None,
                        },
                        VariantKind::Audio => Selection {
                            video: None,
                            audio: Some(selected),
                        },
                    });
                }
            }
        }
        return Err(ConfigError::RepresentationNotFound(wanted_id.clone()));
    }

    let video = best_of_kind(period.adaptations.as_slice(), ContentType::Video);
    let audio = best_of_kind(period.adaptations.as_slice(), ContentType::Audio);
    if video.is_none() && audio.is_none() {
        return Err(ConfigError::NoUsableRepresentation);
    }
    Ok(Selection { video, audio })
}

fn best_of_kind(
    adaptations: &[AdaptationSet],
    wanted: ContentType,
) -> Option<SelectedRepresentation> {
    let mut best: Option<(u64, usize, usize)> = None;
    for (ai, aset) in adaptations.iter().enumerate() {
        if aset.inferred_content_type() != wanted {
            continue;
        }
        for (ri, rep) in aset.representations.iter().enumerate() {
            let bandwidth = rep.bandwidth.unwrap_or(0);
            // first-seen order wins ties: only replace when strictly greater.
            let better = match &best {
                Some((best_bw, _, _)) => bandwidth > *best_bw,
                None => true,
            };
            if better {
                best = Some((bandwidth, ai, ri));
            }
        }
    }
    best.map(|(_, ai, ri)| SelectedRepresentation {
        kind: match wanted {
            ContentType::Video => VariantKind::Video,
            ContentType::Audio => VariantKind::Audio,
            ContentType::Text => unreachable!("text is never selected"),
        },
        adaptation_index: ai,
        representation_index: ri,
    })
}

pub fn representation_at<'m>(
    mpd: &'m MPD,
    selected: &SelectedRepresentation,
) -> &'m Representation {
    &mpd.periods[0].adaptations[selected.adaptation_index].representations
        [selected.representation_index]
}

pub fn adaptation_at<'m>(mpd: &'m MPD, selected: &SelectedRepresentation) -> &'m AdaptationSet {
    &mpd.periods[0].adaptations[selected.adaptation_index]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Period, SegmentTemplate};
    use std::collections::HashMap;

    fn config(representation_id: Option<&str>) -> SessionConfig {
        SessionConfig {
            mpd_url: "https://example.com/manifest.mpd".to_string(),
            key: None,
            kid: None,
            key_map: HashMap::new(),
            mp4decrypt_path: "mp4decrypt".to_string(),
            representation_id: representation_id.map(str::to_string),
            label: None,
            poll_interval: 4.0,
            window_size: 6,
            history_size: 128,
            headers: HashMap::new(),
            output_dir: None,
            http_timeout_seconds: 15.0,
        }
    }

    fn three_video_reps_manifest() -> MPD {
        let rep = |id: &str, bw: u64| Representation {
            id: Some(id.to_string()),
            bandwidth: Some(bw),
            SegmentTemplate: Some(SegmentTemplate::default()),
            ..Default::default()
        };
        let aset = AdaptationSet {
            contentType: Some("video".to_string()),
            representations: vec![rep("lo", 500_000), rep("mid", 1_000_000), rep("hi", 2_000_000)],
            ..Default::default()
        };
        MPD {
            periods: vec![Period {
                adaptations: vec![aset],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn picks_highest_bandwidth() {
        let mpd = three_video_reps_manifest();
        let sel = select_representations(&mpd, &config(None)).unwrap();
        let rep = representation_at(&mpd, sel.video.as_ref().unwrap());
        assert_eq!(rep.id.as_deref(), Some("hi"));
        assert_eq!(rep.bandwidth, Some(2_000_000));
    }

    #[test]
    fn representation_id_override() {
        let mpd = three_video_reps_manifest();
        let sel = select_representations(&mpd, &config(Some("mid"))).unwrap();
        let rep = representation_at(&mpd, sel.video.as_ref().unwrap());
        assert_eq!(rep.bandwidth, Some(1_000_000));
        assert!(sel.audio.is_none());
    }

    #[test]
    fn no_usable_representation_is_an_error() {
        let mpd = MPD {
            periods: vec![Period::default()],
            ..Default::default()
        };
        let err = select_representations(&mpd, &config(None)).unwrap_err();
        assert!(matches!(err, ConfigError::NoUsableRepresentation));
    }
}
