//! Segment enumeration: turning a SegmentTemplate (with or without a SegmentTimeline) into the
//! ordered list of segment descriptors a variant should fetch, and the live high-water-mark
//! computation used to bound enumeration for dynamic manifests without an explicit timeline.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use url::Url;

use crate::manifest::{expand_segment_timeline, resolve_url_template, Representation, SegmentTemplate};

/// A segment, derived and never persisted: everything the downloader and writer need to fetch and
/// append one media segment.
#[derive(Debug, Clone)]
pub struct SegmentRef {
    pub number: u64,
    pub time: i64,
    pub duration_ticks: i64,
    pub timescale: u64,
    pub url: Url,
}

impl SegmentRef {
    pub fn duration_seconds(&self) -> f64 {
        self.duration_ticks as f64 / self.timescale.max(1) as f64
    }
}

fn template_params<'a>(
    representation_id: &'a str,
    bandwidth: &'a str,
    number: Option<u64>,
    time: Option<i64>,
) -> HashMap<&'a str, String> {
    let mut params = HashMap::new();
    params.insert("RepresentationID", representation_id.to_string());
    params.insert("Bandwidth", bandwidth.to_string());
    if let Some(n) = number {
        params.insert("Number", n.to_string());
    }
    if let Some(t) = time {
        params.insert("Time", t.to_string());
    }
    params
}

/// Enumerates every segment describable from this representation's SegmentTemplate, given a
/// base URL already resolved against the BaseURL chain. The template may carry
/// either an explicit SegmentTimeline, or a `duration`/`timescale` pair used with a computed
/// range.
///
/// `available_duration_ticks` bounds the computed-range case (used for static manifests, where
/// the range is `[startNumber, startNumber + floor(available_duration / duration))`); it is
/// ignored when a SegmentTimeline is present.
///
/// `template` is the representation's *effective* SegmentTemplate (its own, or the enclosing
/// AdaptationSet's if it declares none -- see `Representation::effective_segment_template`).
pub fn enumerate_static(
    representation: &Representation,
    template: &SegmentTemplate,
    base_url: &Url,
    available_duration_ticks: Option<i64>,
) -> Vec<SegmentRef> {
    let Some(media) = &template.media else {
        return Vec::new();
    };
    let rep_id = representation.id.clone().unwrap_or_default();
    let bandwidth = representation.bandwidth.unwrap_or(0).to_string();
    let timescale = template.timescale.unwrap_or(1);
    let start_number = template.startNumber.unwrap_or(1);

    if let Some(timeline) = &template.segment_timeline {
        return expand_segment_timeline(timeline, start_number)
            .into_iter()
            .map(|entry| {
                let params = template_params(&rep_id, &bandwidth, Some(entry.number), Some(entry.time));
                let url = base_url
                    .join(&resolve_url_template(media, &params))
                    .expect("segment URL join");
                SegmentRef {
                    number: entry.number,
                    time: entry.time,
                    duration_ticks: entry.duration,
                    timescale,
                    url,
                }
            })
            .collect();
    }

    let Some(duration) = template.duration else {
        return Vec::new();
    };
    let count = match available_duration_ticks {
        Some(avail) => (avail / duration as i64).max(0) as u64,
        None => 0,
    };
    (0..count)
        .map(|i| {
            let number = start_number + i;
            let time = i as i64 * duration as i64;
            let params = template_params(&rep_id, &bandwidth, Some(number), Some(time));
            let url = base_url
                .join(&resolve_url_template(media, &params))
                .expect("segment URL join");
            SegmentRef {
                number,
                time,
                duration_ticks: duration as i64,
                timescale,
                url,
            }
        })
        .collect()
}

/// Computes the live high-water segment number for a dynamic manifest without a SegmentTimeline,
/// `N_live = startNumber + floor((now - availabilityStartTime - periodStart) *
/// timescale / duration)`.
pub fn live_high_water_number(
    template: &SegmentTemplate,
    availability_start: DateTime<Utc>,
    period_start: chrono::Duration,
    now: DateTime<Utc>,
) -> Option<u64> {
    let duration = template.duration?;
    let timescale = template.timescale.unwrap_or(1);
    let start_number = template.startNumber.unwrap_or(1);
    let elapsed = (now - availability_start - period_start).num_milliseconds();
    if elapsed < 0 {
        return Some(start_number);
    }
    let ticks = elapsed as i64 * timescale as i64 / 1000;
    let count = (ticks / duration as i64).max(0) as u64;
    Some(start_number + count)
}

/// Enumerates a dynamic manifest's representation up to (but not including) the live high-water
/// number computed above, for the computed-range case (no SegmentTimeline).
pub fn enumerate_live_computed(
    representation: &Representation,
    template: &SegmentTemplate,
    base_url: &Url,
    availability_start: DateTime<Utc>,
    period_start: chrono::Duration,
    now: DateTime<Utc>,
) -> Vec<SegmentRef> {
    if template.segment_timeline.is_some() {
        // SegmentTimeline manifests enumerate directly; the timeline's own `(t, d, r)` entries
        // already reflect availability, there is no separate high-water computation.
        return enumerate_static(representation, template, base_url, None);
    }
    let Some(high_water) = live_high_water_number(template, availability_start, period_start, now)
    else {
        return Vec::new();
    };
    let Some(duration) = template.duration else {
        return Vec::new();
    };
    let start_number = template.startNumber.unwrap_or(1);
    let rep_id = representation.id.clone().unwrap_or_default();
    let bandwidth = representation.bandwidth.unwrap_or(0).to_string();
    let timescale = template.timescale.unwrap_or(1);
    let Some(media) = &template.media else {
        return Vec::new();
    };
    (start_number..high_water)
        .map(|number| {
            let time = (number - start_number) as i64 * duration as i64;
            let params = template_params(&rep_id, &bandwidth, Some(number), Some(time));
            let url = base_url
                .join(&resolve_url_template(media, &params))
                .expect("segment URL join");
            SegmentRef {
                number,
                time,
                duration_ticks: duration as i64,
                timescale,
                url,
            }
        })
        .collect()
}
