use std::io::Read;
use std::str::FromStr;

use chrono::TimeDelta;

use crate::error::{GpxError, Result};
use crate::geodesy::{self, Coordinate};
use crate::parser;
use crate::timestamp::Instant;

/// A parsed GPX 1.1 document.
#[derive(Debug, Clone, Default)]
pub struct Gpx {
    pub(crate) creator: Option<String>,
    pub(crate) version: String,
    pub(crate) time: Option<Instant>,
    pub(crate) metadata: Option<Metadata>,
    pub(crate) tracks: Vec<Track>,
}

/// The `<metadata>` element, retained verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub raw: String,
}

/// A GPX track (<trk>).
#[derive(Debug, Clone, Default)]
pub struct Track {
    pub(crate) name: Option<String>,
    pub(crate) number: Option<u32>,
    pub(crate) description: Option<String>,
    pub(crate) segments: Vec<TrackSegment>,
}

/// A GPX track segment (<trkseg>). Never empty.
#[derive(Debug, Clone)]
pub struct TrackSegment {
    points: Vec<TrackPoint>,
    elevation: Option<ElevationChange>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ElevationChange {
    gain: f64,
    loss: f64,
}

/// A single GPS fix (<trkpt>).
#[derive(Debug, Clone, PartialEq)]
pub struct TrackPoint {
    coordinate: Coordinate,
    elevation: Option<f64>,
    timestamp: Option<Instant>,
    heart_rate: Option<u16>,
}

impl TrackPoint {
    pub fn new(coordinate: Coordinate) -> Self {
        Self {
            coordinate,
            elevation: None,
            timestamp: None,
            heart_rate: None,
        }
    }

    pub fn with_elevation(mut self, elevation: f64) -> Self {
        self.elevation = Some(elevation);
        self
    }

    pub fn with_timestamp(mut self, timestamp: Instant) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_heart_rate(mut self, bpm: u16) -> Self {
        self.heart_rate = Some(bpm);
        self
    }

    pub fn coordinate(&self) -> Coordinate {
        self.coordinate
    }

    pub fn elevation(&self) -> Option<f64> {
        self.elevation
    }

    pub fn timestamp(&self) -> Option<Instant> {
        self.timestamp
    }

    pub fn heart_rate(&self) -> Option<u16> {
        self.heart_rate
    }

    /// Great-circle distance to `other` in meters.
    pub fn distance_to(&self, other: &TrackPoint) -> f64 {
        geodesy::distance(self.coordinate, other.coordinate)
    }

    /// Time elapsed from this point to `other`. Negative if `other` is earlier.
    pub fn duration_to(&self, other: &TrackPoint) -> Result<TimeDelta> {
        match (self.timestamp, other.timestamp) {
            (Some(from), Some(to)) => Ok(to - from),
            _ => Err(GpxError::MissingTimestamp),
        }
    }
}

impl TrackSegment {
    /// Build a segment from points in recorded order. Returns `None` when
    /// there are no points, since an empty segment carries no data.
    pub fn new(points: Vec<TrackPoint>) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let elevation = elevation_change(&points);
        Some(Self { points, elevation })
    }

    pub fn points(&self) -> &[TrackPoint] {
        &self.points
    }

    pub fn first(&self) -> &TrackPoint {
        &self.points[0]
    }

    pub fn last(&self) -> &TrackPoint {
        &self.points[self.points.len() - 1]
    }

    /// Sum of distances between consecutive points, in meters.
    pub fn distance(&self) -> f64 {
        self.points
            .windows(2)
            .map(|pair| pair[0].distance_to(&pair[1]))
            .sum()
    }

    /// Time from the first point to the last.
    pub fn duration(&self) -> Result<TimeDelta> {
        self.first().duration_to(self.last())
    }

    /// Total climb in meters, `None` if any point lacks an elevation.
    pub fn elevation_gain(&self) -> Option<f64> {
        self.elevation.map(|e| e.gain)
    }

    /// Total descent in meters, `None` if any point lacks an elevation.
    pub fn elevation_loss(&self) -> Option<f64> {
        self.elevation.map(|e| e.loss)
    }
}

// One missing elevation voids the whole segment rather than yielding a
// partial sum.
fn elevation_change(points: &[TrackPoint]) -> Option<ElevationChange> {
    let elevations = points
        .iter()
        .map(TrackPoint::elevation)
        .collect::<Option<Vec<f64>>>()?;

    let mut change = ElevationChange {
        gain: 0.0,
        loss: 0.0,
    };
    for pair in elevations.windows(2) {
        let delta = pair[1] - pair[0];
        if delta > 0.0 {
            change.gain += delta;
        } else {
            change.loss -= delta;
        }
    }
    Some(change)
}

impl Track {
    pub fn new(segments: Vec<TrackSegment>) -> Self {
        Self {
            segments,
            ..Self::default()
        }
    }

    /// Display name: the text of whichever of `<name>` or `<number>` came
    /// last in the document.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The `<number>` element on its own. `None` if absent or too large for
    /// a `u32`; the display name still carries its text.
    pub fn number(&self) -> Option<u32> {
        self.number
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn segments(&self) -> &[TrackSegment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn distance(&self) -> Result<f64> {
        if self.is_empty() {
            return Err(GpxError::NoData);
        }
        Ok(self.segments.iter().map(TrackSegment::distance).sum())
    }

    /// Sum of segment durations. Time between segments is not counted.
    pub fn duration(&self) -> Result<TimeDelta> {
        if self.is_empty() {
            return Err(GpxError::NoData);
        }
        self.segments.iter().map(TrackSegment::duration).sum()
    }

    pub fn elevation_gain(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        self.segments.iter().map(TrackSegment::elevation_gain).sum()
    }

    pub fn elevation_loss(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        self.segments.iter().map(TrackSegment::elevation_loss).sum()
    }

    pub fn start(&self) -> Option<&TrackPoint> {
        self.segments.first().map(TrackSegment::first)
    }

    pub fn end(&self) -> Option<&TrackPoint> {
        self.segments.last().map(TrackSegment::last)
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.start().and_then(TrackPoint::timestamp)
    }

    pub fn end_time(&self) -> Option<Instant> {
        self.end().and_then(TrackPoint::timestamp)
    }

    /// Time from the first point to the last, including breaks between
    /// segments.
    pub fn full_duration(&self) -> Option<TimeDelta> {
        full_duration(self.start(), self.end())
    }
}

impl Gpx {
    /// Parse and validate a GPX 1.1 document.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        parser::parse_gpx(bytes)
    }

    /// Read the whole stream, then parse it.
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Self::parse(&buf)
    }

    pub fn creator(&self) -> Option<&str> {
        self.creator.as_deref()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Document timestamp: a top-level `<time>` if present, otherwise
    /// `<metadata><time>`.
    pub fn time(&self) -> Option<Instant> {
        self.time
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    // Tracks without segments contribute nothing to document totals.
    fn tracks_with_data(&self) -> Result<Vec<&Track>> {
        let tracks: Vec<&Track> = self.tracks.iter().filter(|t| !t.is_empty()).collect();
        if tracks.is_empty() {
            return Err(GpxError::NoData);
        }
        Ok(tracks)
    }

    pub fn distance(&self) -> Result<f64> {
        self.tracks_with_data()?
            .into_iter()
            .map(Track::distance)
            .sum()
    }

    pub fn duration(&self) -> Result<TimeDelta> {
        self.tracks_with_data()?
            .into_iter()
            .map(Track::duration)
            .sum()
    }

    pub fn elevation_gain(&self) -> Option<f64> {
        self.tracks_with_data()
            .ok()?
            .into_iter()
            .map(Track::elevation_gain)
            .sum()
    }

    pub fn elevation_loss(&self) -> Option<f64> {
        self.tracks_with_data()
            .ok()?
            .into_iter()
            .map(Track::elevation_loss)
            .sum()
    }

    pub fn start(&self) -> Option<&TrackPoint> {
        self.tracks.first().and_then(Track::start)
    }

    pub fn end(&self) -> Option<&TrackPoint> {
        self.tracks.last().and_then(Track::end)
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.start().and_then(TrackPoint::timestamp)
    }

    pub fn end_time(&self) -> Option<Instant> {
        self.end().and_then(TrackPoint::timestamp)
    }

    pub fn full_duration(&self) -> Option<TimeDelta> {
        full_duration(self.start(), self.end())
    }
}

impl FromStr for Gpx {
    type Err = GpxError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s.as_bytes())
    }
}

fn full_duration(start: Option<&TrackPoint>, end: Option<&TrackPoint>) -> Option<TimeDelta> {
    start?.duration_to(end?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::parse_timestamp;

    fn point(lat: f64, lon: f64) -> TrackPoint {
        TrackPoint::new(Coordinate::new(lat, lon).unwrap())
    }

    fn at(s: &str) -> Instant {
        parse_timestamp(s).unwrap()
    }

    fn climb(elevations: &[f64]) -> TrackSegment {
        let points = elevations
            .iter()
            .enumerate()
            .map(|(i, ele)| point(47.0 + i as f64 * 0.001, 8.0).with_elevation(*ele))
            .collect();
        TrackSegment::new(points).unwrap()
    }

    #[test]
    fn test_empty_segment_not_constructed() {
        assert!(TrackSegment::new(Vec::new()).is_none());
    }

    #[test]
    fn test_single_point_segment() {
        let seg = TrackSegment::new(vec![point(1.0, 2.0).with_elevation(5.0)]).unwrap();
        assert_eq!(seg.distance(), 0.0);
        assert_eq!(seg.elevation_gain(), Some(0.0));
        assert_eq!(seg.elevation_loss(), Some(0.0));
        assert!(matches!(seg.duration(), Err(GpxError::MissingTimestamp)));
    }

    #[test]
    fn test_elevation_gain_and_loss() {
        let elevations = [100.0, 110.0, 105.0, 105.0, 130.0, 90.0];
        let seg = climb(&elevations);
        let gain = seg.elevation_gain().unwrap();
        let loss = seg.elevation_loss().unwrap();
        assert!((gain - 35.0).abs() < 1e-9);
        assert!((loss - 45.0).abs() < 1e-9);
        assert!((gain - loss - (90.0 - 100.0)).abs() < 1e-9);
    }

    #[test]
    fn test_missing_elevation_voids_segment() {
        let seg = TrackSegment::new(vec![
            point(1.0, 2.0).with_elevation(5.0),
            point(1.001, 2.0),
            point(1.002, 2.0).with_elevation(7.0),
        ])
        .unwrap();
        assert_eq!(seg.elevation_gain(), None);
        assert_eq!(seg.elevation_loss(), None);

        let track = Track::new(vec![climb(&[1.0, 2.0]), seg]);
        assert_eq!(track.elevation_gain(), None);
        assert_eq!(track.elevation_loss(), None);
    }

    #[test]
    fn test_duration_to_requires_both_timestamps() {
        let a = point(1.0, 2.0).with_timestamp(at("2025-01-01T00:00:00Z"));
        let b = point(1.0, 2.0);
        assert!(matches!(a.duration_to(&b), Err(GpxError::MissingTimestamp)));
        assert!(matches!(b.duration_to(&a), Err(GpxError::MissingTimestamp)));
    }

    #[test]
    fn test_track_sums_segments() {
        let first = TrackSegment::new(vec![
            point(47.0, 8.0).with_timestamp(at("2025-01-01T10:00:00Z")),
            point(47.01, 8.0).with_timestamp(at("2025-01-01T10:05:00Z")),
        ])
        .unwrap();
        let second = TrackSegment::new(vec![
            point(47.02, 8.0).with_timestamp(at("2025-01-01T10:30:00Z")),
            point(47.03, 8.0).with_timestamp(at("2025-01-01T10:40:00Z")),
        ])
        .unwrap();
        let expected = first.distance() + second.distance();
        let track = Track::new(vec![first, second]);

        assert!((track.distance().unwrap() - expected).abs() < 1e-9);
        assert_eq!(track.duration().unwrap(), TimeDelta::minutes(15));
        assert_eq!(track.full_duration(), Some(TimeDelta::minutes(40)));
        assert_eq!(track.start_time(), Some(at("2025-01-01T10:00:00Z")));
        assert_eq!(track.end_time(), Some(at("2025-01-01T10:40:00Z")));
    }

    #[test]
    fn test_track_without_segments() {
        let track = Track::default();
        assert!(track.start().is_none());
        assert!(track.end().is_none());
        assert!(track.start_time().is_none());
        assert!(track.full_duration().is_none());
        assert!(matches!(track.distance(), Err(GpxError::NoData)));
        assert!(matches!(track.duration(), Err(GpxError::NoData)));
        assert_eq!(track.elevation_gain(), None);
    }

    #[test]
    fn test_track_duration_propagates_missing_timestamp() {
        let timed = TrackSegment::new(vec![
            point(1.0, 2.0).with_timestamp(at("2025-01-01T00:00:00Z")),
            point(1.0, 2.1).with_timestamp(at("2025-01-01T00:01:00Z")),
        ])
        .unwrap();
        let untimed = TrackSegment::new(vec![point(1.0, 2.2), point(1.0, 2.3)]).unwrap();
        let track = Track::new(vec![timed, untimed]);
        assert!(matches!(track.duration(), Err(GpxError::MissingTimestamp)));
        // Sibling metrics are unaffected.
        assert!(track.distance().is_ok());
        assert!(track.full_duration().is_none());
    }

    #[test]
    fn test_document_without_tracks() {
        let gpx = Gpx::default();
        assert!(matches!(gpx.distance(), Err(GpxError::NoData)));
        assert!(matches!(gpx.duration(), Err(GpxError::NoData)));
        assert_eq!(gpx.elevation_gain(), None);
        assert!(gpx.start().is_none());
        assert!(gpx.full_duration().is_none());
    }

    #[test]
    fn test_document_skips_empty_tracks() {
        let gpx = Gpx {
            tracks: vec![Track::default(), Track::new(vec![climb(&[10.0, 20.0])])],
            ..Gpx::default()
        };
        let expected = gpx.tracks[1].distance().unwrap();
        assert!((gpx.distance().unwrap() - expected).abs() < 1e-9);
        assert_eq!(gpx.elevation_gain(), Some(10.0));
        assert_eq!(gpx.elevation_loss(), Some(0.0));
        // start delegates to the first track, which is empty.
        assert!(gpx.start().is_none());
        assert!(gpx.end().is_some());
    }
}
