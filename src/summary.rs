use std::fmt;

use chrono::TimeDelta;
use serde::Serialize;

use crate::gpx_types::*;
use crate::options::SummaryOptions;
use crate::timestamp::Instant;

/// Trip statistics for a whole document, ready for serialization.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpxSummary {
    pub creator: Option<String>,
    pub version: String,
    pub time: Option<Instant>,
    pub tracks: Vec<TrackSummary>,
    pub totals: Totals,
}

/// Document-wide aggregates. `None` means unknown or no data.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub distance: Option<f64>,
    pub duration_seconds: Option<i64>,
    pub full_duration_seconds: Option<i64>,
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
    pub elevation_gain: Option<f64>,
    pub elevation_loss: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSummary {
    pub name: Option<String>,
    pub number: Option<u32>,
    pub description: Option<String>,
    pub distance: Option<f64>,
    pub duration_seconds: Option<i64>,
    pub full_duration_seconds: Option<i64>,
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
    pub elevation_gain: Option<f64>,
    pub elevation_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<SegmentSummary>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentSummary {
    pub points: usize,
    pub distance: f64,
    pub duration_seconds: Option<i64>,
    pub elevation_gain: Option<f64>,
    pub elevation_loss: Option<f64>,
}

/// Summarize every track of a parsed document.
pub fn summarize(gpx: &Gpx, opts: &SummaryOptions) -> GpxSummary {
    let unit = opts.distance_unit;

    let tracks = gpx
        .tracks()
        .iter()
        .map(|trk| track_summary(trk, opts))
        .collect();

    let totals = Totals {
        distance: gpx.distance().ok().map(|d| unit.convert(d)),
        duration_seconds: gpx.duration().ok().map(seconds),
        full_duration_seconds: gpx.full_duration().map(seconds),
        start_time: gpx.start_time(),
        end_time: gpx.end_time(),
        elevation_gain: gpx.elevation_gain(),
        elevation_loss: gpx.elevation_loss(),
    };

    GpxSummary {
        creator: gpx.creator().map(str::to_string),
        version: gpx.version().to_string(),
        time: gpx.time(),
        tracks,
        totals,
    }
}

fn track_summary(trk: &Track, opts: &SummaryOptions) -> TrackSummary {
    let unit = opts.distance_unit;

    let segments = opts.include_segments.then(|| {
        trk.segments()
            .iter()
            .map(|seg| SegmentSummary {
                points: seg.points().len(),
                distance: unit.convert(seg.distance()),
                duration_seconds: seg.duration().ok().map(seconds),
                elevation_gain: seg.elevation_gain(),
                elevation_loss: seg.elevation_loss(),
            })
            .collect::<Vec<_>>()
    });

    TrackSummary {
        name: trk.name().map(str::to_string),
        number: trk.number(),
        description: trk.description().map(str::to_string),
        distance: trk.distance().ok().map(|d| unit.convert(d)),
        duration_seconds: trk.duration().ok().map(seconds),
        full_duration_seconds: trk.full_duration().map(seconds),
        start_time: trk.start_time(),
        end_time: trk.end_time(),
        elevation_gain: trk.elevation_gain(),
        elevation_loss: trk.elevation_loss(),
        segments,
    }
}

fn seconds(d: TimeDelta) -> i64 {
    d.num_seconds()
}

/// Formats as `H:MM:SS`, with a leading `-` for negative spans.
fn hms(total: i64) -> String {
    let sign = if total < 0 { "-" } else { "" };
    let total = total.unsigned_abs();
    format!(
        "{sign}{}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// One line per track: distance, duration, full duration, start and end
/// time. Unknown values print as `-`.
impl fmt::Display for TrackSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn or_dash<T>(value: Option<T>, show: impl Fn(T) -> String) -> String {
            value.map(show).unwrap_or_else(|| "-".to_string())
        }

        write!(
            f,
            "{} {} {} {} {}",
            or_dash(self.distance, |d| format!("{d:.3}")),
            or_dash(self.duration_seconds, hms),
            or_dash(self.full_duration_seconds, hms),
            or_dash(self.start_time, |t| t.to_rfc3339()),
            or_dash(self.end_time, |t| t.to_rfc3339()),
        )
    }
}
