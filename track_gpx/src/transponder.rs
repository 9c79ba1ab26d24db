//! Transponder export reader: UTF-16LE CSV in, session-partitioned laps out.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;

use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::TrackError;

pub const REQUIRED_ENCODING: &str = "utf-16-le";

/// Column names of the normalised lap table, in output order.
pub const LAP_COLUMNS: [&str; 6] = [
    "Timestamp",
    "Session",
    "Lap",
    "Laptime (s)",
    "Average speed (m/s)",
    "Distance (m)",
];

const DELIMITERS: [u8; 3] = [b',', b';', b'\t'];
const DATE_FORMATS: [&str; 4] = ["%d-%m-%Y", "%d/%m/%Y", "%d.%m.%Y", "%Y-%m-%d"];
const TIME_FORMATS: [&str; 3] = ["%H:%M:%S%.f", "%H:%M:%S", "%H:%M"];
const KMH_TO_MPS: f64 = 1.0 / 3.6;
const MPH_TO_MPS: f64 = 0.44704;

/// One transponder detection. `timestamp` is the lap start, i.e. the moment
/// the rider crossed the start/finish line where the timing loop sits.
#[derive(Clone, Debug, PartialEq)]
pub struct LapRecord {
    pub timestamp: DateTime<Tz>,
    pub session: u32,
    pub lap: u32,
    pub laptime_s: f64,
    pub avg_speed_mps: f64,
    pub distance_m: f64,
}

#[derive(Clone, Debug)]
pub struct TransponderOptions {
    /// Timezone the export's wall-clock dates and times are expressed in.
    pub timezone: Tz,
    /// Sessions to keep; `None` keeps all of them.
    pub sessions: Option<Vec<u32>>,
}

impl Default for TransponderOptions {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Europe::Brussels,
            sessions: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SourceColumn {
    Date,
    StartTime,
    Laptime,
    Speed,
    Lap,
    Distance,
}

impl SourceColumn {
    const REQUIRED: [SourceColumn; 5] = [
        SourceColumn::Date,
        SourceColumn::StartTime,
        SourceColumn::Laptime,
        SourceColumn::Speed,
        SourceColumn::Lap,
    ];

    fn name(self) -> &'static str {
        match self {
            SourceColumn::Date => "Date",
            SourceColumn::StartTime => "Start time",
            SourceColumn::Laptime => "Laptime",
            SourceColumn::Speed => "Speed",
            SourceColumn::Lap => "Lap",
            SourceColumn::Distance => "Distance",
        }
    }

    fn aliases(self) -> &'static [&'static str] {
        match self {
            SourceColumn::Date => &["Date", "Datum"],
            SourceColumn::StartTime => &["Start time", "Starttime", "Starttijd", "Heure de départ"],
            SourceColumn::Laptime => &["Laptime", "Lap time", "Rondetijd", "Temps au tour"],
            SourceColumn::Speed => &["Speed", "Average speed", "Snelheid", "Vitesse"],
            SourceColumn::Lap => &["Lap", "Ronde", "Tour"],
            SourceColumn::Distance => &["Distance", "Distance (m)", "Afstand"],
        }
    }

    fn find(self, headers: &csv::StringRecord) -> Option<usize> {
        headers.iter().position(|header| {
            let header = header.trim();
            self.aliases()
                .iter()
                .any(|alias| header.eq_ignore_ascii_case(alias))
        })
    }
}

struct ColumnMap {
    date: usize,
    start_time: usize,
    laptime: usize,
    speed: usize,
    lap: usize,
    distance: Option<usize>,
}

impl ColumnMap {
    fn resolve(headers: &csv::StringRecord, path: &Path) -> Result<Self, TrackError> {
        let mut found = [0usize; 5];
        for (slot, column) in found.iter_mut().zip(SourceColumn::REQUIRED) {
            *slot = column.find(headers).ok_or_else(|| TrackError::Schema {
                path: path.to_path_buf(),
                column: column.name(),
                accepted: column.aliases().join(", "),
            })?;
        }
        Ok(Self {
            date: found[0],
            start_time: found[1],
            laptime: found[2],
            speed: found[3],
            lap: found[4],
            distance: SourceColumn::Distance.find(headers),
        })
    }

    fn required(&self) -> [usize; 5] {
        [self.date, self.start_time, self.laptime, self.speed, self.lap]
    }
}

/// Read a transponder export from disk.
pub fn read_transponder(
    path: &Path,
    options: &TransponderOptions,
    sink: &mut dyn DiagnosticSink,
) -> Result<Vec<LapRecord>, TrackError> {
    let bytes = fs::read(path).map_err(|e| TrackError::io(path, e))?;
    parse_transponder(&bytes, path, options, sink)
}

/// Parse raw export bytes; `origin` only labels error messages.
pub fn parse_transponder(
    bytes: &[u8],
    origin: &Path,
    options: &TransponderOptions,
    sink: &mut dyn DiagnosticSink,
) -> Result<Vec<LapRecord>, TrackError> {
    let text = decode_utf16le(bytes).map_err(|reason| TrackError::Encoding {
        path: origin.to_path_buf(),
        reason,
    })?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let delimiter = detect_delimiter(&text).ok_or_else(|| TrackError::Encoding {
        path: origin.to_path_buf(),
        reason: "header has no ',', ';' or tab delimiter; the file looks like single-byte text"
            .to_string(),
    })?;

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(text.as_bytes());
    let csv_context = |source: csv::Error| TrackError::Csv {
        context: origin.display().to_string(),
        source,
    };
    let headers = reader.headers().map_err(csv_context)?.clone();
    let columns = ColumnMap::resolve(&headers, origin)?;

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.map_err(csv_context)?;
        // Header is row 1.
        let row = idx + 2;
        let cell = |i: usize| record.get(i).unwrap_or("").trim();
        if columns.required().iter().all(|&i| cell(i).is_empty()) {
            sink.emit(Diagnostic::SkippedRow {
                row,
                reason: "required cells are blank".to_string(),
            });
            continue;
        }
        let invalid = |column: SourceColumn, value: &str, reason: &str| TrackError::InvalidValue {
            path: origin.to_path_buf(),
            row,
            column: column.name(),
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let date_raw = cell(columns.date);
        let date = parse_date(date_raw)
            .ok_or_else(|| invalid(SourceColumn::Date, date_raw, "unrecognised date"))?;
        let start_raw = cell(columns.start_time);
        let start = parse_clock(start_raw)
            .ok_or_else(|| invalid(SourceColumn::StartTime, start_raw, "unrecognised time"))?;
        let timestamp = options
            .timezone
            .from_local_datetime(&NaiveDateTime::new(date, start))
            .earliest()
            .ok_or_else(|| {
                invalid(
                    SourceColumn::StartTime,
                    start_raw,
                    &format!("local time does not exist in {}", options.timezone.name()),
                )
            })?;

        let laptime_raw = cell(columns.laptime);
        let laptime_s = parse_duration_s(laptime_raw)
            .ok_or_else(|| invalid(SourceColumn::Laptime, laptime_raw, "unrecognised duration"))?;
        let speed_raw = cell(columns.speed);
        let avg_speed_mps = parse_speed_mps(speed_raw)
            .ok_or_else(|| invalid(SourceColumn::Speed, speed_raw, "unrecognised speed"))?;
        let lap_raw = cell(columns.lap);
        let lap = lap_raw
            .parse::<u32>()
            .map_err(|e| invalid(SourceColumn::Lap, lap_raw, &e.to_string()))?;
        let distance_m = match columns.distance.map(cell).filter(|v| !v.is_empty()) {
            Some(raw) => parse_decimal(raw)
                .filter(|d| *d >= 0.0)
                .ok_or_else(|| invalid(SourceColumn::Distance, raw, "unrecognised distance"))?,
            None => avg_speed_mps * laptime_s.max(0.0),
        };

        rows.push(LapRecord {
            timestamp,
            session: 0,
            lap,
            laptime_s,
            avg_speed_mps,
            distance_m,
        });
    }

    let laps: Vec<u32> = rows.iter().map(|r| r.lap).collect();
    let mut previous_session = 0;
    for (i, (row, session)) in rows.iter_mut().zip(assign_sessions(&laps)).enumerate() {
        row.session = session;
        if i > 0 && session != previous_session {
            sink.emit(Diagnostic::SessionGap {
                session,
                previous_lap: laps[i - 1],
                lap: laps[i],
            });
        }
        previous_session = session;
    }

    if let Some(keep) = options.sessions.as_ref() {
        rows.retain(|r| keep.contains(&r.session));
    }
    Ok(rows)
}

/// Assign session numbers from the lap sequence alone.
///
/// The first row opens session 1; every row whose lap is not exactly one
/// more than the previous row's lap opens the next session.
pub fn assign_sessions(laps: &[u32]) -> Vec<u32> {
    let mut sessions = Vec::with_capacity(laps.len());
    let mut session = 0u32;
    let mut previous: Option<u32> = None;
    for &lap in laps {
        match previous {
            Some(prev) if prev.checked_add(1) == Some(lap) => {}
            _ => session += 1,
        }
        sessions.push(session);
        previous = Some(lap);
    }
    sessions
}

/// Write laps as a CSV table with exactly the [`LAP_COLUMNS`] header.
pub fn write_laps_csv<W: Write>(records: &[LapRecord], writer: W) -> Result<(), TrackError> {
    let wrap = |source: csv::Error| TrackError::Csv {
        context: "lap table".to_string(),
        source,
    };
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(LAP_COLUMNS).map_err(wrap)?;
    for record in records {
        writer
            .write_record([
                record.timestamp.to_rfc3339(),
                record.session.to_string(),
                record.lap.to_string(),
                format!("{:.3}", record.laptime_s),
                format!("{:.3}", record.avg_speed_mps),
                format!("{:.3}", record.distance_m),
            ])
            .map_err(wrap)?;
    }
    writer.flush().map_err(|e| wrap(e.into()))?;
    Ok(())
}

fn decode_utf16le(bytes: &[u8]) -> Result<String, String> {
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return Err("found a UTF-8 byte order mark".to_string());
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        return Err("found a big-endian UTF-16 byte order mark".to_string());
    }
    let body = bytes.strip_prefix(&[0xFF, 0xFE]).unwrap_or(bytes);
    if body.len() % 2 != 0 {
        return Err(format!("odd byte length {}", body.len()));
    }
    let units = body
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    let mut text = String::with_capacity(body.len() / 2);
    for unit in char::decode_utf16(units) {
        match unit {
            Ok(c) => text.push(c),
            Err(e) => {
                return Err(format!(
                    "unpaired surrogate 0x{:04X}",
                    e.unpaired_surrogate()
                ))
            }
        }
    }
    Ok(text)
}

fn detect_delimiter(text: &str) -> Option<u8> {
    let header = text.lines().find(|line| !line.trim().is_empty())?;
    DELIMITERS
        .iter()
        .map(|&d| (d, header.bytes().filter(|&b| b == d).count()))
        .filter(|&(_, count)| count > 0)
        .max_by_key(|&(_, count)| count)
        .map(|(d, _)| d)
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

fn parse_clock(raw: &str) -> Option<NaiveTime> {
    let normalized = raw.replace(',', ".");
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(&normalized, fmt).ok())
}

fn parse_decimal(raw: &str) -> Option<f64> {
    raw.trim()
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// `h:mm:ss.fff`, `m:ss.fff` or plain seconds.
fn parse_duration_s(raw: &str) -> Option<f64> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let (whole, last) = parts.split_at(parts.len() - 1);
    let mut total = parse_decimal(last[0])?;
    let mut scale = 60.0;
    for part in whole.iter().rev() {
        let value: u32 = part.trim().parse().ok()?;
        total += value as f64 * scale;
        scale *= 60.0;
    }
    Some(total).filter(|v| *v >= 0.0)
}

fn parse_speed_mps(raw: &str) -> Option<f64> {
    let lower = raw.trim().to_ascii_lowercase();
    let split = lower
        .find(|c: char| c.is_ascii_alphabetic() || c.is_whitespace() || c == '/')
        .unwrap_or(lower.len());
    let (number, unit) = lower.split_at(split);
    let value = parse_decimal(number)?;
    let factor = match unit.trim() {
        "" | "km/h" | "kmh" | "kph" => KMH_TO_MPS,
        "m/s" => 1.0,
        "mph" => MPH_TO_MPS,
        _ => return None,
    };
    Some(value * factor).filter(|v| *v >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Timelike};

    const EXTRA_COLUMNS: &str = "Date,Start time,Total time,Laptime,Speed,Lap,Diff,Transponder,H1,H2
01-01-2024,12:00:00,00:00:10,00:00:10,36 km/h,1,00:00:00,ABC123,foo,bar
01-01-2024,12:00:10,00:00:20,00:00:10,36 km/h,2,00:00:10,ABC123,foo,bar
01-01-2024,12:00:30,00:00:30,00:00:12,30 km/h,4,00:00:20,ABC123,foo,bar
01-01-2024,12:00:42,00:00:42,00:00:12,30 km/h,5,00:00:12,ABC123,foo,bar
";

    fn utf16le(text: &str, bom: bool) -> Vec<u8> {
        let mut out = Vec::new();
        if bom {
            out.extend_from_slice(&[0xFF, 0xFE]);
        }
        for unit in text.encode_utf16() {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out
    }

    fn parse(bytes: &[u8], options: &TransponderOptions) -> Result<Vec<LapRecord>, TrackError> {
        let mut sink: Vec<Diagnostic> = Vec::new();
        parse_transponder(bytes, Path::new("sessions.csv"), options, &mut sink)
    }

    #[test]
    fn test_extra_columns_are_dropped_and_sessions_assigned() {
        let laps = parse(&utf16le(EXTRA_COLUMNS, false), &TransponderOptions::default()).unwrap();
        assert_eq!(laps.len(), 4);
        let sessions: Vec<u32> = laps.iter().map(|l| l.session).collect();
        assert_eq!(sessions, vec![1, 1, 2, 2]);
        assert_eq!(laps[2].lap, 4);
        assert!((laps[0].laptime_s - 10.0).abs() < 1e-9);
        assert!((laps[0].avg_speed_mps - 10.0).abs() < 1e-9);
        assert!((laps[0].distance_m - 100.0).abs() < 1e-9);
        assert!((laps[3].distance_m - 100.0).abs() < 1e-9);
        assert_eq!(laps[1].timestamp.second(), 10);
        assert_eq!(
            laps[0].timestamp.fixed_offset().offset(),
            &FixedOffset::east_opt(3600).unwrap()
        );
    }

    #[test]
    fn test_bom_is_accepted() {
        let laps = parse(&utf16le(EXTRA_COLUMNS, true), &TransponderOptions::default()).unwrap();
        assert_eq!(laps.len(), 4);
    }

    #[test]
    fn test_output_table_has_exactly_six_columns() {
        let laps = parse(&utf16le(EXTRA_COLUMNS, false), &TransponderOptions::default()).unwrap();
        let mut out = Vec::new();
        write_laps_csv(&laps, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let header: Vec<&str> = text.lines().next().unwrap().split(',').collect();
        assert_eq!(header, LAP_COLUMNS.to_vec());
        assert!(!text.contains("ABC123"));
        assert!(!text.contains("foo"));
        assert_eq!(text.lines().count(), 5);
    }

    #[test]
    fn test_utf8_input_is_rejected_naming_encoding() {
        let err = parse(EXTRA_COLUMNS.as_bytes(), &TransponderOptions::default()).unwrap_err();
        assert!(matches!(err, TrackError::Encoding { .. }));
        assert!(err.to_string().contains("utf-16-le CSV"), "{}", err);
    }

    #[test]
    fn test_even_length_single_byte_text_is_rejected() {
        let text = "Date,Laps\n";
        assert_eq!(text.len() % 2, 0);
        let err = parse(text.as_bytes(), &TransponderOptions::default()).unwrap_err();
        assert!(err.to_string().contains("utf-16-le CSV"), "{}", err);
    }

    #[test]
    fn test_utf8_bom_and_big_endian_are_rejected() {
        let mut utf8 = vec![0xEF, 0xBB, 0xBF];
        utf8.extend_from_slice(b"Date,Lap\n");
        assert!(matches!(
            parse(&utf8, &TransponderOptions::default()),
            Err(TrackError::Encoding { .. })
        ));
        let big_endian = [0xFE, 0xFF, 0x00, 0x44];
        assert!(matches!(
            parse(&big_endian, &TransponderOptions::default()),
            Err(TrackError::Encoding { .. })
        ));
    }

    #[test]
    fn test_unpaired_surrogate_is_rejected() {
        let bytes = [0x00, 0xD8, 0x41, 0x00];
        let err = parse(&bytes, &TransponderOptions::default()).unwrap_err();
        assert!(err.to_string().contains("surrogate"));
    }

    #[test]
    fn test_empty_file_is_empty_result() {
        assert!(parse(&[], &TransponderOptions::default()).unwrap().is_empty());
        assert!(parse(&utf16le("  \r\n", true), &TransponderOptions::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_missing_column_is_named() {
        let text = "Date,Start time,Speed,Lap\n01-01-2024,12:00:00,36 km/h,1\n";
        let err = parse(&utf16le(text, false), &TransponderOptions::default()).unwrap_err();
        match &err {
            TrackError::Schema { column, .. } => assert_eq!(*column, "Laptime"),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains("Laptime"));
    }

    #[test]
    fn test_session_filter_keeps_file_order() {
        let options = TransponderOptions {
            sessions: Some(vec![2]),
            ..TransponderOptions::default()
        };
        let laps = parse(&utf16le(EXTRA_COLUMNS, false), &options).unwrap();
        assert_eq!(laps.iter().map(|l| l.lap).collect::<Vec<_>>(), vec![4, 5]);
        assert!(laps.iter().all(|l| l.session == 2));
    }

    #[test]
    fn test_session_gap_is_reported() {
        let mut sink: Vec<Diagnostic> = Vec::new();
        parse_transponder(
            &utf16le(EXTRA_COLUMNS, false),
            Path::new("sessions.csv"),
            &TransponderOptions::default(),
            &mut sink,
        )
        .unwrap();
        assert_eq!(
            sink,
            vec![Diagnostic::SessionGap {
                session: 2,
                previous_lap: 2,
                lap: 4
            }]
        );
    }

    #[test]
    fn test_tab_separated_dutch_export_with_distance() {
        let text = "Datum\tStarttijd\tRondetijd\tSnelheid\tRonde\tAfstand\n\
                    05.03.2024\t18:30:01,250\t17,5\t51,4 km/h\t7\t250\n\
                    \t\t\t\t\t\n\
                    05.03.2024\t18:30:18,750\t0:17.2\t14.5 m/s\t8\t250\n";
        let mut sink: Vec<Diagnostic> = Vec::new();
        let laps = parse_transponder(
            &utf16le(text, true),
            Path::new("dutch.csv"),
            &TransponderOptions::default(),
            &mut sink,
        )
        .unwrap();
        assert_eq!(laps.len(), 2);
        assert_eq!(laps[0].session, 1);
        assert_eq!(laps[1].session, 1);
        assert!((laps[0].laptime_s - 17.5).abs() < 1e-9);
        assert!((laps[1].laptime_s - 17.2).abs() < 1e-9);
        assert!((laps[1].avg_speed_mps - 14.5).abs() < 1e-9);
        assert!((laps[0].distance_m - 250.0).abs() < 1e-9);
        assert_eq!(laps[0].timestamp.nanosecond(), 250_000_000);
        assert!(matches!(sink[0], Diagnostic::SkippedRow { row: 3, .. }));
    }

    #[test]
    fn test_invalid_cell_reports_row_and_column() {
        let text = "Date,Start time,Laptime,Speed,Lap\n01-01-2024,12:00:00,00:00:10,fast,1\n";
        let err = parse(&utf16le(text, false), &TransponderOptions::default()).unwrap_err();
        match err {
            TrackError::InvalidValue { row, column, value, .. } => {
                assert_eq!(row, 2);
                assert_eq!(column, "Speed");
                assert_eq!(value, "fast");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_negative_laptime_is_invalid() {
        let text = "Date,Start time,Laptime,Speed,Lap\n01-01-2024,12:00:00,-5,50,1\n";
        let err = parse(&utf16le(text, false), &TransponderOptions::default()).unwrap_err();
        match err {
            TrackError::InvalidValue { row, column, value, .. } => {
                assert_eq!(row, 2);
                assert_eq!(column, "Laptime");
                assert_eq!(value, "-5");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_assign_sessions_sequences() {
        assert_eq!(assign_sessions(&[1, 2, 4, 5]), vec![1, 1, 2, 2]);
        assert_eq!(assign_sessions(&[1, 2, 3, 4]), vec![1, 1, 1, 1]);
        assert_eq!(assign_sessions(&[3, 1, 2]), vec![1, 2, 2]);
        assert_eq!(assign_sessions(&[7, 7, 8]), vec![1, 2, 2]);
        assert!(assign_sessions(&[]).is_empty());
    }

    #[test]
    fn test_assign_sessions_increments_once_per_break() {
        let laps = [10, 11, 12, 1, 2, 9, 3, 4, 5, 6];
        let sessions = assign_sessions(&laps);
        assert_eq!(sessions[0], 1);
        for i in 1..laps.len() {
            let expected = sessions[i - 1] + u32::from(laps[i] != laps[i - 1] + 1);
            assert_eq!(sessions[i], expected);
        }
        assert_eq!(*sessions.last().unwrap(), 4);
    }

    #[test]
    fn test_duration_and_speed_parsing() {
        assert_eq!(parse_duration_s("1:02:03.5"), Some(3723.5));
        assert_eq!(parse_duration_s("0:17,25"), Some(17.25));
        assert_eq!(parse_duration_s("12.5"), Some(12.5));
        assert_eq!(parse_duration_s("a:b"), None);
        assert_eq!(parse_duration_s("-5"), None);
        assert_eq!(parse_duration_s("0:-17.5"), None);
        assert!((parse_speed_mps("36").unwrap() - 10.0).abs() < 1e-9);
        assert!((parse_speed_mps("10 mph").unwrap() - 4.4704).abs() < 1e-9);
        assert_eq!(parse_speed_mps("10 furlongs"), None);
    }
}
