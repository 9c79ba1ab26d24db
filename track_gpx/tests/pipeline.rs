use std::fs;
use std::path::Path;

use chrono::{TimeDelta, TimeZone};
use chrono_tz::Tz;
use track_gpx::projection::local_distance_m;
use track_gpx::{
    assemble, load_or_build, map_interpolation_to_velodrome, read_transponder, write_gpx,
    write_gpx_file, Diagnostic, HeartRateSample, HeartRateSeries, InterpolationParams,
    TrackError, TransponderOptions, Velodrome, VelodromeConfig,
};

const EXPORT: &str = "Date,Start time,Laptime,Speed,Lap,Distance
01-01-2024,12:00:00,00:00:18,50 km/h,1,250
01-01-2024,12:00:18,00:00:18,50 km/h,2,250
01-01-2024,12:00:36,00:00:18,50 km/h,3,250
01-01-2024,12:05:00,00:00:20,45 km/h,10,250
01-01-2024,12:05:20,00:00:20,45 km/h,11,250
";

fn write_utf16le(path: &Path, text: &str) {
    let mut bytes = vec![0xFF, 0xFE];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    fs::write(path, bytes).unwrap();
}

fn config() -> VelodromeConfig {
    VelodromeConfig {
        precision_m: 0.5,
        ..VelodromeConfig::default()
    }
}

fn heart_rate_for_first_session() -> HeartRateSeries {
    let start = Tz::UTC.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap();
    HeartRateSeries::from_samples(
        (0..=54)
            .map(|s| HeartRateSample {
                time: start + TimeDelta::seconds(s),
                bpm: 120 + (s / 2) as u8,
            })
            .collect(),
    )
}

#[test]
fn test_transponder_export_becomes_gpx() {
    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("export.csv");
    let cache_path = dir.path().join("cache").join("ghent.csv");
    let gpx_path = dir.path().join("ride.gpx");
    write_utf16le(&csv_path, EXPORT);

    let mut sink: Vec<Diagnostic> = Vec::new();
    let laps = read_transponder(&csv_path, &TransponderOptions::default(), &mut sink).unwrap();
    assert_eq!(laps.len(), 5);
    assert!(sink.iter().any(|d| matches!(
        d,
        Diagnostic::SessionGap {
            session: 2,
            previous_lap: 3,
            lap: 10
        }
    )));

    let cfg = config();
    let velodrome = load_or_build(&cfg, &cache_path, &mut sink).unwrap();
    assert!(cache_path.is_file());
    let trace = map_interpolation_to_velodrome(
        &laps,
        velodrome.as_ref(),
        &InterpolationParams::default(),
        &mut sink,
    )
    .unwrap();
    assert_eq!(trace.segments.len(), 2);
    assert_eq!(trace.segments[0].points.len(), 55);
    assert_eq!(trace.segments[1].points.len(), 41);
    assert_eq!(trace.summary.points, 96);
    assert_eq!(trace.timezone(), chrono_tz::Europe::Brussels);

    let (center_lat, center_lon) = cfg.center.to_utm().unwrap().to_wgs84();
    let reach = cfg.straight_m / 2.0 + cfg.bend_radius_m() + 0.05;
    for p in trace.points() {
        assert!(local_distance_m(center_lat, center_lon, p.latitude, p.longitude) <= reach);
    }

    let hr = heart_rate_for_first_session().with_timezone(trace.timezone());
    let segments = assemble(&trace, Some(&hr));
    assert!(segments[0].iter().all(|p| p.heart_rate.is_some()));
    assert!(segments[1].iter().all(|p| p.heart_rate.is_none()));

    write_gpx_file(&gpx_path, velodrome.name(), &segments).unwrap();
    let parsed = gpx::read(fs::File::open(&gpx_path).unwrap()).unwrap();
    let track = &parsed.tracks[0];
    assert_eq!(track.segments.len(), 2);
    assert_eq!(track.segments[0].points.len(), 55);
    assert_eq!(track.segments[1].points.len(), 41);
    assert!(track.segments[1].points.iter().all(|p| p.elevation == Some(7.0)));
    let text = fs::read_to_string(&gpx_path).unwrap();
    assert_eq!(text.matches("<gpxtpx:hr>").count(), 55);
    assert!(text.contains("<time>2024-01-01T11:00:00.000Z</time>"));
}

#[test]
fn test_cached_geometry_reproduces_the_same_gpx() {
    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("export.csv");
    let cache_path = dir.path().join("ghent.csv");
    write_utf16le(&csv_path, EXPORT);
    let mut sink: Vec<Diagnostic> = Vec::new();
    let laps = read_transponder(&csv_path, &TransponderOptions::default(), &mut sink).unwrap();

    let render = |velodrome: &dyn Velodrome| {
        let trace = map_interpolation_to_velodrome(
            &laps,
            velodrome,
            &InterpolationParams::default(),
            &mut Vec::<Diagnostic>::new(),
        )
        .unwrap();
        let mut out = Vec::new();
        write_gpx(&mut out, velodrome.name(), &assemble(&trace, None)).unwrap();
        out
    };

    let mut sink: Vec<Diagnostic> = Vec::new();
    let built = load_or_build(&config(), &cache_path, &mut sink).unwrap();
    assert!(matches!(sink.last(), Some(Diagnostic::CacheWritten { .. })));
    let mut sink: Vec<Diagnostic> = Vec::new();
    let cached = load_or_build(&config(), &cache_path, &mut sink).unwrap();
    assert!(matches!(sink.last(), Some(Diagnostic::CacheLoaded { .. })));

    assert_eq!(render(built.as_ref()), render(cached.as_ref()));
}

#[test]
fn test_session_filter_limits_output() {
    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("export.csv");
    write_utf16le(&csv_path, EXPORT);
    let options = TransponderOptions {
        sessions: Some(vec![2]),
        ..TransponderOptions::default()
    };
    let laps = read_transponder(&csv_path, &options, &mut Vec::<Diagnostic>::new()).unwrap();
    assert_eq!(laps.iter().map(|l| l.lap).collect::<Vec<_>>(), vec![10, 11]);
}

#[test]
fn test_utf8_export_is_rejected_with_encoding_hint() {
    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("export.csv");
    fs::write(&csv_path, EXPORT).unwrap();
    let mut sink: Vec<Diagnostic> = Vec::new();
    let err = read_transponder(&csv_path, &TransponderOptions::default(), &mut sink).unwrap_err();
    assert!(matches!(err, TrackError::Encoding { .. }));
    assert!(err.to_string().contains("utf-16-le CSV"), "{err}");
}
