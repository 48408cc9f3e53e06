use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::error::{GpxError, Result};
use crate::geodesy::Coordinate;
use crate::gpx_types::*;
use crate::schema::GPX_NAMESPACE;
use crate::timestamp::{Instant, parse_timestamp};
use crate::validator;

/// Parse a GPX 1.1 byte stream into a [`Gpx`].
///
/// The whole document is checked before anything is built: the root must be
/// `<gpx version="1.1">` and the document must validate against the GPX 1.1
/// schema. Only then is the track hierarchy constructed.
pub fn parse_gpx(bytes: &[u8]) -> Result<Gpx> {
    let xml = validator::decode(bytes)?;
    let tree = validator::parse_tree(xml)?;
    validator::check_header(&tree)?;
    validator::validate_document(&tree)?;

    let mut reader = Reader::from_str(xml);

    let mut gpx = loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => break parse_document(&e, &mut reader, false)?,
            Ok(Event::Empty(e)) => break parse_document(&e, &mut reader, true)?,
            // Unreachable once the schema has accepted a root element.
            Ok(Event::Eof) => return Err(GpxError::NoData),
            Err(e) => return Err(GpxError::Xml(e)),
            _ => {}
        }
    };
    if gpx.time.is_none() {
        gpx.time = metadata_time(&tree)?;
    }
    Ok(gpx)
}

/// The GPX 1.1 schema puts the document timestamp in `<metadata><time>`. The
/// rest of the metadata stays opaque.
fn metadata_time(tree: &roxmltree::Document) -> Result<Option<Instant>> {
    tree.root_element()
        .children()
        .find(|n| n.has_tag_name((GPX_NAMESPACE, "metadata")))
        .and_then(|metadata| {
            metadata
                .children()
                .find(|n| n.has_tag_name((GPX_NAMESPACE, "time")))
        })
        .map(|time| parse_timestamp(time.text().unwrap_or_default()))
        .transpose()
}

/// Parse the root <gpx> element and its children.
fn parse_document<'a>(
    start: &BytesStart<'a>,
    reader: &mut Reader<&'a [u8]>,
    empty: bool,
) -> Result<Gpx> {
    let local = start.local_name();
    if local.as_ref() != b"gpx" {
        return Err(GpxError::NotGpx(lossy(local.as_ref())));
    }

    let mut gpx = Gpx {
        creator: attribute(start, b"creator")?,
        version: attribute(start, b"version")?.unwrap_or_default(),
        ..Gpx::default()
    };
    if gpx.version != "1.1" {
        return Err(GpxError::UnsupportedVersion(gpx.version));
    }
    if empty {
        return Ok(gpx);
    }

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"trk" => gpx.tracks.push(parse_track(reader, false)?),
                b"metadata" => {
                    let raw = reader
                        .read_text(e.name())
                        .map_err(GpxError::Xml)?;
                    gpx.metadata = Some(Metadata {
                        raw: raw.into_owned(),
                    });
                }
                b"time" => {
                    let text = read_text_owned(reader, &e)?;
                    gpx.time = Some(parse_timestamp(&text)?);
                }
                other => return Err(unrecognized("gpx", other)),
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"trk" => gpx.tracks.push(parse_track(reader, true)?),
                b"metadata" => {
                    gpx.metadata = Some(Metadata { raw: String::new() });
                }
                other => return Err(unrecognized("gpx", other)),
            },
            Ok(Event::End(e)) if e.local_name().as_ref() == b"gpx" => break,
            Ok(Event::Eof) => break,
            Err(e) => return Err(GpxError::Xml(e)),
            _ => {}
        }
    }

    log::debug!(
        "parsed GPX document from {:?}: {} track(s)",
        gpx.creator,
        gpx.tracks.len()
    );
    Ok(gpx)
}

/// Read an optional attribute as an owned string.
fn attribute(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    for attr_result in e.attributes() {
        let attr = attr_result.map_err(|e| GpxError::Xml(e.into()))?;
        if attr.key.local_name().as_ref() == name {
            return Ok(Some(lossy(&attr.value)));
        }
    }
    Ok(None)
}

/// Parse lat/lon attributes from a <trkpt> start tag.
fn parse_coordinate(e: &BytesStart<'_>) -> Result<Coordinate> {
    let mut lat: Option<f64> = None;
    let mut lon: Option<f64> = None;

    for attr_result in e.attributes() {
        let attr = attr_result.map_err(|e| GpxError::Xml(e.into()))?;
        let key = attr.key.local_name();
        let val = std::str::from_utf8(&attr.value).unwrap_or_default().trim();
        match key.as_ref() {
            b"lat" => {
                lat = Some(val.parse::<f64>().map_err(|_| GpxError::InvalidAttribute {
                    element: "trkpt",
                    attribute: "lat",
                    value: val.to_string(),
                })?);
            }
            b"lon" => {
                lon = Some(val.parse::<f64>().map_err(|_| GpxError::InvalidAttribute {
                    element: "trkpt",
                    attribute: "lon",
                    value: val.to_string(),
                })?);
            }
            _ => {}
        }
    }

    let lat = lat.ok_or(GpxError::MissingAttribute {
        element: "trkpt",
        attribute: "lat",
    })?;
    let lon = lon.ok_or(GpxError::MissingAttribute {
        element: "trkpt",
        attribute: "lon",
    })?;

    Coordinate::new(lat, lon)
}

/// Parse a <trkpt> element and its children.
/// Called after receiving Event::Start (or Event::Empty) for the point.
fn parse_point<'a>(
    start: &BytesStart<'a>,
    reader: &mut Reader<&'a [u8]>,
    empty: bool,
) -> Result<TrackPoint> {
    let mut point = TrackPoint::new(parse_coordinate(start)?);
    if empty {
        return Ok(point);
    }

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"ele" => {
                    let text = read_text_owned(reader, &e)?;
                    point = point.with_elevation(parse_number("ele", &text)?);
                }
                b"time" => {
                    let text = read_text_owned(reader, &e)?;
                    point = point.with_timestamp(parse_timestamp(&text)?);
                }
                b"extensions" => {
                    if let Some(bpm) = parse_extensions(reader)? {
                        point = point.with_heart_rate(bpm);
                    }
                }
                other => return Err(unrecognized("trkpt", other)),
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"extensions" => {}
                b"ele" => return Err(invalid_number("ele", "")),
                b"time" => return Err(GpxError::MalformedTimestamp(String::new())),
                other => return Err(unrecognized("trkpt", other)),
            },
            Ok(Event::End(e)) if e.local_name().as_ref() == b"trkpt" => break,
            Ok(Event::Eof) => break,
            Err(e) => return Err(GpxError::Xml(e)),
            _ => {}
        }
    }

    log::trace!(
        "trkpt {:?} ele={:?} time={:?}",
        point.coordinate(),
        point.elevation(),
        point.timestamp()
    );
    Ok(point)
}

/// Walk an <extensions> element, picking up the heart rate from
/// `TrackPointExtension/hr`. All other extension content is skipped.
/// Called after receiving Event::Start for <extensions>.
fn parse_extensions(reader: &mut Reader<&[u8]>) -> Result<Option<u16>> {
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut heart_rate = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let local = e.local_name();
                let on_hr_path = match path.as_slice() {
                    [ext] => ext == b"TrackPointExtension" && local.as_ref() == b"hr",
                    _ => false,
                };
                if on_hr_path {
                    let text = read_text_owned(reader, &e)?;
                    let bpm = text
                        .trim()
                        .parse::<u16>()
                        .map_err(|_| invalid_number("hr", &text))?;
                    heart_rate = Some(bpm);
                } else {
                    path.push(local.as_ref().to_vec());
                }
            }
            Ok(Event::End(_)) => {
                // An empty path means this is </extensions> itself.
                if path.pop().is_none() {
                    break;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(GpxError::Xml(e)),
            _ => {}
        }
    }

    Ok(heart_rate)
}

/// Parse a <trk> element.
fn parse_track(reader: &mut Reader<&[u8]>, empty: bool) -> Result<Track> {
    let mut track = Track::default();
    if empty {
        return Ok(track);
    }

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                // <name> and <number> share the display name, last one wins.
                b"name" => track.name = Some(read_text_owned(reader, &e)?),
                b"number" => {
                    let text = read_text_owned(reader, &e)?;
                    track.number = text.trim().parse::<u32>().ok();
                    if track.number.is_none() {
                        log::debug!("track number {} does not fit in u32", text.trim());
                    }
                    track.name = Some(text);
                }
                b"desc" => track.description = Some(read_text_owned(reader, &e)?),
                b"trkseg" => {
                    let points = parse_segment(reader)?;
                    match TrackSegment::new(points) {
                        Some(segment) => track.segments.push(segment),
                        None => log::debug!("dropping empty track segment"),
                    }
                }
                other => return Err(unrecognized("trk", other)),
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"trkseg" => log::debug!("dropping empty track segment"),
                b"name" => track.name = Some(String::new()),
                b"desc" => track.description = Some(String::new()),
                b"number" => return Err(invalid_number("number", "")),
                other => return Err(unrecognized("trk", other)),
            },
            Ok(Event::End(e)) if e.local_name().as_ref() == b"trk" => break,
            Ok(Event::Eof) => break,
            Err(e) => return Err(GpxError::Xml(e)),
            _ => {}
        }
    }

    log::debug!(
        "parsed track {:?} with {} segment(s)",
        track.name(),
        track.segments.len()
    );
    Ok(track)
}

/// Collect the <trkpt> children of a <trkseg> element, in document order.
fn parse_segment<'a>(reader: &mut Reader<&'a [u8]>) -> Result<Vec<TrackPoint>> {
    let mut points = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"trkpt" => points.push(parse_point(&e, reader, false)?),
                other => return Err(unrecognized("trkseg", other)),
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"trkpt" => points.push(parse_point(&e, reader, true)?),
                other => return Err(unrecognized("trkseg", other)),
            },
            Ok(Event::End(e)) if e.local_name().as_ref() == b"trkseg" => break,
            Ok(Event::Eof) => break,
            Err(e) => return Err(GpxError::Xml(e)),
            _ => {}
        }
    }

    Ok(points)
}

/// Read text content of an element as an owned String.
/// Handles regular text, CDATA sections, and entity references (Event::GeneralRef).
fn read_text_owned(reader: &mut Reader<&[u8]>, start: &BytesStart<'_>) -> Result<String> {
    let end_name = start.name().0.to_vec();
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                let raw = std::str::from_utf8(e.as_ref()).unwrap_or_default();
                text.push_str(raw);
            }
            Ok(Event::CData(e)) => {
                let s = std::str::from_utf8(e.as_ref()).unwrap_or_default();
                text.push_str(s);
            }
            Ok(Event::GeneralRef(e)) => {
                // Handle character references (&#60; &#x3C;) and predefined entities
                if let Ok(Some(ch)) = e.resolve_char_ref() {
                    text.push(ch);
                } else {
                    let name = std::str::from_utf8(e.as_ref()).unwrap_or_default();
                    match name {
                        "amp" => text.push('&'),
                        "lt" => text.push('<'),
                        "gt" => text.push('>'),
                        "quot" => text.push('"'),
                        "apos" => text.push('\''),
                        // Only a DTD can declare other entities.
                        other => return Err(GpxError::UnsupportedEntity(other.to_string())),
                    }
                }
            }
            Ok(Event::End(e)) if e.name().0 == end_name.as_slice() => break,
            Ok(Event::Eof) => break,
            Err(e) => return Err(GpxError::Xml(e)),
            _ => {}
        }
    }

    Ok(text)
}

fn parse_number(element: &'static str, text: &str) -> Result<f64> {
    text.trim()
        .parse::<f64>()
        .map_err(|_| invalid_number(element, text))
}

fn invalid_number(element: &'static str, value: &str) -> GpxError {
    GpxError::InvalidNumber {
        element,
        value: value.to_string(),
    }
}

fn unrecognized(parent: &'static str, element: &[u8]) -> GpxError {
    GpxError::UnrecognizedElement {
        parent,
        element: lossy(element),
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn doc(body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx xmlns="http://www.topografix.com/GPX/1/1" version="1.1" creator="unit-test">{body}</gpx>"#
        )
    }

    fn parse(xml: &str) -> Result<Gpx> {
        parse_gpx(xml.as_bytes())
    }

    #[test]
    fn test_empty_gpx() {
        let xml = r#"<gpx xmlns="http://www.topografix.com/GPX/1/1" version="1.1" creator="x"/>"#;
        let gpx = parse(xml).unwrap();
        assert_eq!(gpx.creator(), Some("x"));
        assert_eq!(gpx.version(), "1.1");
        assert!(gpx.tracks().is_empty());
        assert!(gpx.metadata().is_none());
    }

    #[test]
    fn test_simple_track() {
        let xml = doc(r#"
  <trk>
    <name>Morning Run</name>
    <desc>Around the lake</desc>
    <trkseg>
      <trkpt lat="35.0" lon="139.0"><ele>10.0</ele><time>2025-01-01T00:00:00Z</time></trkpt>
      <trkpt lat="35.001" lon="139.001"><ele>11.0</ele><time>2025-01-01T00:00:30Z</time></trkpt>
      <trkpt lat="35.002" lon="139.002"><ele>9.5</ele><time>2025-01-01T00:01:00Z</time></trkpt>
    </trkseg>
  </trk>"#);
        let gpx = parse(&xml).unwrap();
        assert_eq!(gpx.tracks().len(), 1);

        let track = &gpx.tracks()[0];
        assert_eq!(track.name(), Some("Morning Run"));
        assert_eq!(track.description(), Some("Around the lake"));
        assert_eq!(track.segments().len(), 1);

        let seg = &track.segments()[0];
        assert_eq!(seg.points().len(), 3);
        assert!((seg.points()[1].coordinate().lat() - 35.001).abs() < 1e-10);
        assert_eq!(seg.elevation_gain(), Some(1.0));
        assert_eq!(seg.elevation_loss(), Some(1.5));
        assert_eq!(track.duration().unwrap(), TimeDelta::seconds(60));
    }

    #[test]
    fn test_empty_segment_dropped() {
        let xml = doc(r#"
  <trk>
    <trkseg></trkseg>
    <trkseg/>
    <trkseg>
      <trkpt lat="35.0" lon="139.0"/>
    </trkseg>
  </trk>"#);
        let gpx = parse(&xml).unwrap();
        assert_eq!(gpx.tracks()[0].segments().len(), 1);
        assert_eq!(gpx.tracks()[0].segments()[0].points().len(), 1);
    }

    #[test]
    fn test_empty_track_kept() {
        let xml = doc("<trk/><trk><name>Nothing</name></trk>");
        let gpx = parse(&xml).unwrap();
        assert_eq!(gpx.tracks().len(), 2);
        assert!(gpx.tracks().iter().all(Track::is_empty));
        assert!(matches!(gpx.distance(), Err(GpxError::NoData)));
    }

    #[test]
    fn test_heart_rate_extension() {
        let xml = doc(r#"
  <trk>
    <trkseg>
      <trkpt lat="35.0" lon="139.0">
        <extensions>
          <gpxtpx:TrackPointExtension xmlns:gpxtpx="http://www.garmin.com/xmlschemas/TrackPointExtension/v1">
            <gpxtpx:atemp>21.0</gpxtpx:atemp>
            <gpxtpx:hr>150</gpxtpx:hr>
            <gpxtpx:cad>88</gpxtpx:cad>
          </gpxtpx:TrackPointExtension>
        </extensions>
      </trkpt>
      <trkpt lat="35.001" lon="139.0"/>
    </trkseg>
  </trk>"#);
        let gpx = parse(&xml).unwrap();
        let points = gpx.tracks()[0].segments()[0].points();
        assert_eq!(points[0].heart_rate(), Some(150));
        assert_eq!(points[1].heart_rate(), None);
    }

    #[test]
    fn test_unrelated_extensions_skipped() {
        let xml = doc(r#"
  <trk>
    <trkseg>
      <trkpt lat="35.0" lon="139.0">
        <extensions>
          <x:power xmlns:x="urn:example:power"><x:hr>99</x:hr></x:power>
        </extensions>
      </trkpt>
    </trkseg>
  </trk>"#);
        let gpx = parse(&xml).unwrap();
        assert_eq!(gpx.tracks()[0].segments()[0].points()[0].heart_rate(), None);
    }

    #[test]
    fn test_name_and_number_last_wins() {
        let xml = doc(r#"<trk><name>Loop</name><number>7</number></trk>"#);
        let gpx = parse(&xml).unwrap();
        let track = &gpx.tracks()[0];
        assert_eq!(track.name(), Some("7"));
        assert_eq!(track.number(), Some(7));
    }

    #[test]
    fn test_metadata_retained_verbatim() {
        let xml = doc("<metadata><name>Ride</name><time>2012-06-30T21:17:00Z</time></metadata>");
        let gpx = parse(&xml).unwrap();
        let metadata = gpx.metadata().unwrap();
        assert_eq!(metadata.raw, "<name>Ride</name><time>2012-06-30T21:17:00Z</time>");
        assert_eq!(
            gpx.time(),
            Some(parse_timestamp("2012-06-30T21:17:00Z").unwrap())
        );
    }

    #[test]
    fn test_document_time_absent_without_metadata_time() {
        let gpx = parse(&doc("<metadata><name>Ride</name></metadata><trk/>")).unwrap();
        assert!(gpx.time().is_none());
        assert!(parse(&doc("<trk/>")).unwrap().time().is_none());
    }

    #[test]
    fn test_track_number_beyond_u32() {
        let xml = doc("<trk><name>Loop</name><number>4294967296</number></trk>");
        let gpx = parse(&xml).unwrap();
        let track = &gpx.tracks()[0];
        assert_eq!(track.name(), Some("4294967296"));
        assert_eq!(track.number(), None);
    }

    #[test]
    fn test_doctype_accepted() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE gpx>
<gpx xmlns="http://www.topografix.com/GPX/1/1" version="1.1" creator="dtd">
  <trk><name>Lake &amp; back</name><trkseg><trkpt lat="35.0" lon="139.0"/></trkseg></trk>
</gpx>"#;
        let gpx = parse(xml).unwrap();
        assert_eq!(gpx.creator(), Some("dtd"));
        assert_eq!(gpx.tracks()[0].name(), Some("Lake & back"));
    }

    #[test]
    fn test_dtd_entity_in_text_unsupported() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE gpx [<!ENTITY lake "Zurichsee">]>
<gpx xmlns="http://www.topografix.com/GPX/1/1" version="1.1" creator="dtd">
  <trk><name>&lake;</name></trk>
</gpx>"#;
        assert!(matches!(
            parse(xml),
            Err(GpxError::UnsupportedEntity(name)) if name == "lake"
        ));
    }

    #[test]
    fn test_unrecognized_track_child() {
        // Valid per the schema, but not part of the track model.
        let xml = doc("<trk><type>running</type></trk>");
        let err = parse(&xml).unwrap_err();
        assert!(matches!(
            err,
            GpxError::UnrecognizedElement { parent: "trk", ref element } if element == "type"
        ));
    }

    #[test]
    fn test_unrecognized_point_child() {
        let xml = doc(r#"<trk><trkseg><trkpt lat="1" lon="2"><name>p</name></trkpt></trkseg></trk>"#);
        let err = parse(&xml).unwrap_err();
        assert!(matches!(
            err,
            GpxError::UnrecognizedElement { parent: "trkpt", ref element } if element == "name"
        ));
    }

    #[test]
    fn test_waypoints_unrecognized() {
        let xml = doc(r#"<wpt lat="35.0" lon="139.0"/>"#);
        let err = parse(&xml).unwrap_err();
        assert!(matches!(
            err,
            GpxError::UnrecognizedElement { parent: "gpx", ref element } if element == "wpt"
        ));
    }

    #[test]
    fn test_segment_extensions_unrecognized() {
        let xml = doc(r#"<trk><trkseg><trkpt lat="1" lon="2"/><extensions/></trkseg></trk>"#);
        let err = parse(&xml).unwrap_err();
        assert!(matches!(err, GpxError::UnrecognizedElement { parent: "trkseg", .. }));
    }

    #[test]
    fn test_schema_checked_before_construction() {
        // <ele> after <time> violates the sequence. Construction would have
        // accepted it, so the error must come from the schema gate.
        let xml = doc(r#"<trk><trkseg><trkpt lat="1" lon="2"><time>2025-01-01T00:00:00Z</time><ele>3</ele></trkpt></trkseg></trk>"#);
        assert!(matches!(parse(&xml), Err(GpxError::SchemaInvalid(_))));
    }

    #[test]
    fn test_version_1_0_unsupported() {
        let xml = r#"<?xml version="1.0"?>
<gpx xmlns="http://www.topografix.com/GPX/1/0" version="1.0" creator="old">
  <trk><trkseg><trkpt lat="35.0" lon="139.0"><speed>5.5</speed></trkpt></trkseg></trk>
</gpx>"#;
        assert!(matches!(parse(xml), Err(GpxError::UnsupportedVersion(v)) if v == "1.0"));
    }

    #[test]
    fn test_not_gpx() {
        let xml = r#"<kml xmlns="http://www.opengis.net/kml/2.2"/>"#;
        assert!(matches!(parse(xml), Err(GpxError::NotGpx(tag)) if tag == "kml"));
    }

    #[test]
    fn test_malformed_xml() {
        assert!(matches!(parse("<gpx version=\"1.1\">"), Err(GpxError::MalformedXml(_))));
    }

    #[test]
    fn test_cdata_and_entities_in_name() {
        let xml = doc("<trk><name><![CDATA[Up & Down]]></name><desc>A &amp; B &#60;3</desc></trk>");
        let gpx = parse(&xml).unwrap();
        assert_eq!(gpx.tracks()[0].name(), Some("Up & Down"));
        assert_eq!(gpx.tracks()[0].description(), Some("A & B <3"));
    }

    #[test]
    fn test_byte_order_mark() {
        let mut bytes = b"\xEF\xBB\xBF".to_vec();
        bytes.extend_from_slice(doc("<trk/>").as_bytes());
        let gpx = parse_gpx(&bytes).unwrap();
        assert_eq!(gpx.tracks().len(), 1);
    }
}
