//! The DASH MPD manifest model: parsing, BaseURL resolution, and segment template/timeline
//! expansion.
//!
//! The struct shapes mirror the ISO/IEC 23009-1 XML schema closely, the same way as this crate's
//! upstream cousins do it: fields are mostly `Option<...>` because in-the-wild manifests omit
//! almost anything that isn't strictly required, and we prefer to interoperate with existing
//! practice over being strict. We use `quick-xml`'s serde integration, wrapped in
//! `serde_path_to_error` so that parse failures point at the offending element.

use std::collections::HashMap;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::error::ManifestError;

fn parse_xs_duration(s: &str) -> Result<Duration, ManifestError> {
    match iso8601::duration(s) {
        Ok(iso8601::Duration::Weeks(w)) => Ok(Duration::new(w as u64 * 60 * 60 * 24 * 7, 0)),
        Ok(iso8601::Duration::YMDHMS {
            year,
            month,
            day,
            hour,
            minute,
            second,
            millisecond,
        }) => {
            let mut secs: u64 = second.into();
            secs += minute as u64 * 60;
            secs += hour as u64 * 60 * 60;
            secs += day as u64 * 60 * 60 * 24;
            secs += month as u64 * 60 * 60 * 24 * 31;
            secs += year as u64 * 60 * 60 * 24 * 31 * 365;
            Ok(Duration::new(secs, millisecond * 1_000_000))
        }
        Err(e) => Err(ManifestError::Parse(format!(
            "couldn't parse xs:duration {s:?}: {e:?}"
        ))),
    }
}

fn deserialize_xs_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    match <Option<String>>::deserialize(deserializer) {
        Ok(Some(s)) => parse_xs_duration(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        Ok(None) => Ok(None),
        Err(_) => Ok(None),
    }
}

/// Describes a sequence of contiguous segments with identical duration, one entry of a
/// `SegmentTimeline`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct S {
    pub t: Option<i64>,
    pub d: i64,
    pub r: Option<i64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SegmentTimeline {
    #[serde(rename = "S", default)]
    pub segments: Vec<S>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SegmentTemplate {
    pub initialization: Option<String>,
    pub media: Option<String>,
    #[serde(rename = "SegmentTimeline")]
    pub segment_timeline: Option<SegmentTimeline>,
    pub startNumber: Option<u64>,
    pub duration: Option<u64>,
    pub timescale: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BaseURL {
    #[serde(rename = "$value")]
    pub base: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ContentProtection {
    pub schemeIdUri: Option<String>,
    #[serde(rename = "cenc:default_KID")]
    pub default_KID: Option<String>,
}

impl ContentProtection {
    /// Normalizes `cenc:default_KID` to 32 lowercase hex characters, accepting both the
    /// hyphenated GUID form (`"12345678-1234-1234-1234-123456789abc"`) and bare hex.
    pub fn normalized_kid(&self) -> Option<String> {
        self.default_KID.as_ref().map(|k| normalize_kid(k))
    }
}

/// Normalizes a KID string (hyphenated GUID or bare hex, any case) to 32 lowercase hex chars.
pub fn normalize_kid(kid: &str) -> String {
    kid.chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Video,
    Audio,
    Text,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Representation {
    pub id: Option<String>,
    pub mimeType: Option<String>,
    pub codecs: Option<String>,
    pub contentType: Option<String>,
    pub bandwidth: Option<u64>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub frameRate: Option<String>,
    pub BaseURL: Option<BaseURL>,
    pub SegmentTemplate: Option<SegmentTemplate>,
}

impl Representation {
    /// Returns this representation's own `SegmentTemplate` if it declares one, else falls back to
    /// the enclosing `AdaptationSet`'s: a SegmentTemplate is inherited by every Representation in
    /// an AdaptationSet unless an individual Representation overrides it (spec.md 3/4.1).
    pub fn effective_segment_template<'a>(
        &'a self,
        adaptation: &'a AdaptationSet,
    ) -> Option<&'a SegmentTemplate> {
        self.SegmentTemplate.as_ref().or(adaptation.SegmentTemplate.as_ref())
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AdaptationSet {
    pub id: Option<String>,
    pub contentType: Option<String>,
    pub mimeType: Option<String>,
    pub codecs: Option<String>,
    pub BaseURL: Option<BaseURL>,
    pub SegmentTemplate: Option<SegmentTemplate>,
    #[serde(rename = "ContentProtection", default)]
    pub content_protections: Vec<ContentProtection>,
    #[serde(rename = "Representation", default)]
    pub representations: Vec<Representation>,
}

impl AdaptationSet {
    /// Infer the content type for this adaptation set: explicit
    /// `@contentType`, then MIME type, then the representations' codec strings, defaulting to
    /// `Text` (ignored by selection) when nothing matches.
    pub fn inferred_content_type(&self) -> ContentType {
        if let Some(ct) = &self.contentType {
            match ct.as_str() {
                "video" => return ContentType::Video,
                "audio" => return ContentType::Audio,
                "text" => return ContentType::Text,
                _ => {}
            }
        }
        if let Some(mime) = &self.mimeType {
            if mime.starts_with("video/") {
                return ContentType::Video;
            }
            if mime.starts_with("audio/") {
                return ContentType::Audio;
            }
        }
        let codec_strings = self
            .codecs
            .iter()
            .cloned()
            .chain(self.representations.iter().filter_map(|r| r.codecs.clone()))
            .chain(
                self.representations
                    .iter()
                    .filter_map(|r| r.mimeType.clone()),
            );
        for s in codec_strings {
            if let Some(ct) = content_type_from_codec(&s) {
                return ct;
            }
        }
        ContentType::Text
    }

    pub fn kids(&self) -> Vec<String> {
        self.content_protections
            .iter()
            .filter_map(|cp| cp.normalized_kid())
            .collect()
    }
}

fn content_type_from_codec(s: &str) -> Option<ContentType> {
    if s.starts_with("video/") || s.starts_with("audio/") {
        if s.starts_with("video/") {
            return Some(ContentType::Video);
        }
        return Some(ContentType::Audio);
    }
    for needle in ["mp4a", "ac-3", "ec-3"] {
        if s.contains(needle) {
            return Some(ContentType::Audio);
        }
    }
    for needle in ["avc", "hev", "hvc", "vp0", "vp8", "vp9", "av01"] {
        if s.contains(needle) {
            return Some(ContentType::Video);
        }
    }
    None
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Period {
    pub id: Option<String>,
    pub start: Option<String>,
    #[serde(default, deserialize_with = "deserialize_xs_duration")]
    pub duration: Option<Duration>,
    pub BaseURL: Option<BaseURL>,
    #[serde(rename = "AdaptationSet", default)]
    pub adaptations: Vec<AdaptationSet>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MPD {
    #[serde(rename = "type")]
    pub mpdtype: Option<String>,
    #[serde(default, deserialize_with = "deserialize_xs_duration")]
    pub mediaPresentationDuration: Option<Duration>,
    pub minimumUpdatePeriod: Option<String>,
    pub availabilityStartTime: Option<String>,
    pub timeShiftBufferDepth: Option<String>,
    pub suggestedPresentationDelay: Option<String>,
    #[serde(rename = "Period", default)]
    pub periods: Vec<Period>,
    #[serde(rename = "BaseURL")]
    pub base_urls: Option<Vec<BaseURL>>,
}

impl MPD {
    pub fn is_dynamic(&self) -> bool {
        self.mpdtype.as_deref() == Some("dynamic")
    }

    pub fn minimum_update_period(&self) -> Option<Duration> {
        self.minimumUpdatePeriod
            .as_ref()
            .and_then(|s| parse_xs_duration(s).ok())
    }

    pub fn availability_start_time(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.availabilityStartTime
            .as_ref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
    }
}

/// Parse an MPD manifest from XML bytes, as fetched from `request_url`. `request_url` provides
/// the base of the BaseURL resolution chain when the manifest itself carries no
/// absolute BaseURL.
pub fn parse(xml: &str) -> Result<MPD, ManifestError> {
    let mut de = quick_xml::de::Deserializer::from_str(xml);
    serde_path_to_error::deserialize(&mut de)
        .map_err(|e| ManifestError::Parse(format!("{} at {}", e, e.path())))
}

/// Resolves the chain of BaseURL elements for a given representation, following the precedence
/// Representation > AdaptationSet > Period > MPD > request URL. Relative BaseURLs
/// compose against the next-outer URL per RFC 3986; an absolute BaseURL resets the chain.
pub fn resolve_base_url(
    request_url: &Url,
    mpd: &MPD,
    period: &Period,
    adaptation: &AdaptationSet,
    representation: &Representation,
) -> Result<Url, ManifestError> {
    let mut current = request_url.clone();
    for base in [
        mpd.base_urls.as_ref().and_then(|v| v.first()),
        period.BaseURL.as_ref(),
        adaptation.BaseURL.as_ref(),
        representation.BaseURL.as_ref(),
    ]
    .into_iter()
    .flatten()
    {
        current = current
            .join(&base.base)
            .map_err(|e| ManifestError::InvalidUrl(format!("{}: {e}", base.base)))?;
    }
    Ok(current)
}

lazy_static::lazy_static! {
    static ref TEMPLATE_IDS: Vec<(&'static str, String, Regex)> =
        vec!["RepresentationID", "Number", "Time", "Bandwidth"]
            .into_iter()
            .map(|k| (k, format!("${k}$"), Regex::new(&format!(r"\${k}%0([\d])d\$")).unwrap()))
            .collect();
}

/// Expands `$RepresentationID$`, `$Number$`, `$Time$`, `$Bandwidth$` placeholders, including the
/// width-formatted variant such as `$Number%05d$`.
pub fn resolve_url_template(template: &str, params: &HashMap<&str, String>) -> String {
    let mut result = template.to_string();
    for (k, ident, rx) in TEMPLATE_IDS.iter() {
        if result.contains(ident.as_str()) {
            if let Some(value) = params.get(k) {
                result = result.replace(ident.as_str(), value);
            }
        }
        if let Some(cap) = rx.captures(&result) {
            if let Some(value) = params.get(k) {
                let width: usize = cap[1].parse().unwrap_or(0);
                let count = format!("{value:0>width$}");
                let m = rx.find(&result).unwrap();
                result = result[..m.start()].to_owned() + &count + &result[m.end()..];
            }
        }
    }
    result
}

/// One expanded entry of a SegmentTimeline: segment number, start time, duration (all in
/// timescale units).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEntry {
    pub number: u64,
    pub time: i64,
    pub duration: i64,
}

/// Expands the `(t, d, r)` triples of a SegmentTimeline into one entry per segment, numbered
/// starting at `start_number`. When `t` is omitted on an entry (other than the first), the
/// timeline continues from the previous entry's end.
pub fn expand_segment_timeline(timeline: &SegmentTimeline, start_number: u64) -> Vec<TimelineEntry> {
    let mut out = Vec::new();
    let mut number = start_number;
    let mut cursor: i64 = 0;
    for s in &timeline.segments {
        let mut time = s.t.unwrap_or(cursor);
        let repeat = s.r.unwrap_or(0).max(0) as u64;
        for _ in 0..=repeat {
            out.push(TimelineEntry {
                number,
                time,
                duration: s.d,
            });
            number += 1;
            time += s.d;
            cursor = time;
        }
    }
    out
}
