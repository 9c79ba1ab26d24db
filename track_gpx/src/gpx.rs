//! GPX 1.1 export of an interpolated trace.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::heart_rate::{default_max_gap, HeartRateSeries};
use crate::interpolate::Trace;
use crate::TrackError;

const GPX_NS: &str = "http://www.topografix.com/GPX/1/1";
const TPX_NS: &str = "http://www.garmin.com/xmlschemas/TrackPointExtension/v1";
const CREATOR: &str = concat!("track-to-gpx ", env!("CARGO_PKG_VERSION"));

/// One `<trkpt>`.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportPoint {
    pub time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation_m: f64,
    pub heart_rate: Option<u8>,
}

/// Join trace points with heart rate, one inner vector per session.
pub fn assemble(trace: &Trace, heart_rate: Option<&HeartRateSeries>) -> Vec<Vec<ExportPoint>> {
    let max_gap = default_max_gap();
    trace
        .segments
        .iter()
        .map(|segment| {
            segment
                .points
                .iter()
                .map(|p| ExportPoint {
                    time: p.time.with_timezone(&Utc),
                    latitude: p.latitude,
                    longitude: p.longitude,
                    elevation_m: p.elevation_m,
                    heart_rate: heart_rate.and_then(|hr| hr.at(p.time, max_gap)),
                })
                .collect()
        })
        .collect()
}

pub fn write_gpx<W: Write>(
    writer: W,
    name: &str,
    segments: &[Vec<ExportPoint>],
) -> Result<(), TrackError> {
    let mut w = Writer::new_with_indent(writer, b' ', 2);
    let xml = |e: std::io::Error| TrackError::Xml(e.to_string());

    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml)?;
    let mut gpx = BytesStart::new("gpx");
    gpx.push_attribute(("version", "1.1"));
    gpx.push_attribute(("creator", CREATOR));
    gpx.push_attribute(("xmlns", GPX_NS));
    gpx.push_attribute(("xmlns:gpxtpx", TPX_NS));
    w.write_event(Event::Start(gpx)).map_err(xml)?;

    w.write_event(Event::Start(BytesStart::new("trk"))).map_err(xml)?;
    write_text_element(&mut w, "name", name)?;
    for segment in segments {
        w.write_event(Event::Start(BytesStart::new("trkseg")))
            .map_err(xml)?;
        for p in segment {
            write_point(&mut w, p)?;
        }
        w.write_event(Event::End(BytesEnd::new("trkseg")))
            .map_err(xml)?;
    }
    w.write_event(Event::End(BytesEnd::new("trk"))).map_err(xml)?;
    w.write_event(Event::End(BytesEnd::new("gpx"))).map_err(xml)?;
    w.into_inner().flush().map_err(xml)
}

pub fn write_gpx_file(
    path: &Path,
    name: &str,
    segments: &[Vec<ExportPoint>],
) -> Result<(), TrackError> {
    let file = File::create(path).map_err(|e| TrackError::io(path, e))?;
    write_gpx(BufWriter::new(file), name, segments)
}

fn write_point<W: Write>(w: &mut Writer<W>, p: &ExportPoint) -> Result<(), TrackError> {
    let xml = |e: std::io::Error| TrackError::Xml(e.to_string());
    let mut trkpt = BytesStart::new("trkpt");
    trkpt.push_attribute(("lat", p.latitude.to_string().as_str()));
    trkpt.push_attribute(("lon", p.longitude.to_string().as_str()));
    w.write_event(Event::Start(trkpt)).map_err(xml)?;
    write_text_element(w, "ele", &p.elevation_m.to_string())?;
    write_text_element(
        w,
        "time",
        &p.time.to_rfc3339_opts(SecondsFormat::Millis, true),
    )?;
    if let Some(bpm) = p.heart_rate {
        w.write_event(Event::Start(BytesStart::new("extensions")))
            .map_err(xml)?;
        w.write_event(Event::Start(BytesStart::new("gpxtpx:TrackPointExtension")))
            .map_err(xml)?;
        write_text_element(w, "gpxtpx:hr", &bpm.to_string())?;
        w.write_event(Event::End(BytesEnd::new("gpxtpx:TrackPointExtension")))
            .map_err(xml)?;
        w.write_event(Event::End(BytesEnd::new("extensions")))
            .map_err(xml)?;
    }
    w.write_event(Event::End(BytesEnd::new("trkpt"))).map_err(xml)
}

fn write_text_element<W: Write>(w: &mut Writer<W>, tag: &str, text: &str) -> Result<(), TrackError> {
    let xml = |e: std::io::Error| TrackError::Xml(e.to_string());
    w.write_event(Event::Start(BytesStart::new(tag))).map_err(xml)?;
    w.write_event(Event::Text(BytesText::new(text))).map_err(xml)?;
    w.write_event(Event::End(BytesEnd::new(tag))).map_err(xml)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn point(secs: i64, lat: f64, hr: Option<u8>) -> ExportPoint {
        ExportPoint {
            time: Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap() + TimeDelta::seconds(secs),
            latitude: lat,
            longitude: 3.6921,
            elevation_m: 7.0,
            heart_rate: hr,
        }
    }

    fn render(segments: &[Vec<ExportPoint>]) -> String {
        let mut out = Vec::new();
        write_gpx(&mut out, "Ghent <Tuesday> & co", segments).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_segments_round_trip_through_gpx_reader() {
        let segments = vec![
            vec![point(0, 51.0401, Some(120)), point(1, 51.0402, None)],
            vec![point(30, 51.0403, Some(150))],
        ];
        let text = render(&segments);
        let parsed = gpx::read(text.as_bytes()).unwrap();
        assert_eq!(parsed.version, gpx::GpxVersion::Gpx11);
        assert_eq!(parsed.tracks.len(), 1);
        let track = &parsed.tracks[0];
        assert_eq!(track.name.as_deref(), Some("Ghent <Tuesday> & co"));
        assert_eq!(track.segments.len(), 2);
        assert_eq!(track.segments[0].points.len(), 2);
        let p = &track.segments[1].points[0];
        assert_eq!(p.point().y(), 51.0403);
        assert_eq!(p.point().x(), 3.6921);
        assert_eq!(p.elevation, Some(7.0));
        assert!(p.time.is_some());
    }

    #[test]
    fn test_heart_rate_extension_and_utc_time() {
        let text = render(&[vec![point(0, 51.0, Some(142)), point(1, 51.0, None)]]);
        assert_eq!(text.matches("<gpxtpx:hr>").count(), 1);
        assert!(text.contains("<gpxtpx:hr>142</gpxtpx:hr>"));
        assert!(text.contains(TPX_NS));
        assert!(text.contains("<time>2024-01-01T11:00:01.000Z</time>"));
    }

    #[test]
    fn test_empty_export_is_valid() {
        let text = render(&[]);
        let parsed = gpx::read(text.as_bytes()).unwrap();
        assert_eq!(parsed.tracks.len(), 1);
        assert!(parsed.tracks[0].segments.is_empty());
    }

    #[test]
    fn test_write_gpx_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.gpx");
        write_gpx_file(&path, "t", &[vec![point(0, 51.0, None)]]).unwrap();
        let parsed = gpx::read(File::open(&path).unwrap()).unwrap();
        assert_eq!(parsed.tracks[0].segments[0].points.len(), 1);

        let missing = dir.path().join("no-such-dir").join("out.gpx");
        let err = write_gpx_file(&missing, "t", &[]).unwrap_err();
        assert!(matches!(err, TrackError::Io { .. }));
    }
}
