//! Turn transponder lap timings from a velodrome into a continuous GPS trace.
//!
//! The pipeline is `transponder` (raw export → session-partitioned laps),
//! `velodrome` (arc-length → coordinate table), `interpolate` (laps + table →
//! timed positions) and finally `gpx` (trace + optional heart rate → file).

use std::path::PathBuf;

use thiserror::Error;

pub mod config;
pub mod diagnostics;
pub mod gpx;
pub mod heart_rate;
pub mod interpolate;
pub mod projection;
pub mod transponder;
pub mod velodrome;

pub use config::{CenterAnchor, VelodromeConfig};
pub use diagnostics::{Diagnostic, DiagnosticSink, LogSink};
pub use self::gpx::{assemble, write_gpx, write_gpx_file, ExportPoint};
pub use heart_rate::{default_max_gap, read_fit_heart_rate, HeartRateSample, HeartRateSeries};
pub use interpolate::{
    map_interpolation_to_velodrome, InterpolatedPoint, InterpolationParams, Trace, TraceSegment,
    TraceSummary,
};
pub use transponder::{
    assign_sessions, parse_transponder, read_transponder, write_laps_csv, LapRecord,
    TransponderOptions, LAP_COLUMNS, REQUIRED_ENCODING,
};
pub use velodrome::{
    load_or_build, ArcLengthTable, ComputedVelodrome, GeoPoint, TableVelodrome, Velodrome,
};

#[derive(Error, Debug)]
pub enum TrackError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: expected a {enc} CSV export ({reason})", enc = REQUIRED_ENCODING)]
    Encoding { path: PathBuf, reason: String },
    #[error("{path}: missing required column '{column}' (accepted headers: {accepted})")]
    Schema {
        path: PathBuf,
        column: &'static str,
        accepted: String,
    },
    #[error("{path}: row {row}, column '{column}': invalid value '{value}': {reason}")]
    InvalidValue {
        path: PathBuf,
        row: usize,
        column: &'static str,
        value: String,
        reason: String,
    },
    #[error("{context}: {source}")]
    Csv {
        context: String,
        #[source]
        source: csv::Error,
    },
    #[error("invalid velodrome geometry: {0}")]
    GeometryConfig(String),
    #[error("{path}: invalid velodrome cache: {reason}")]
    CacheFormat { path: PathBuf, reason: String },
    #[error("failed to parse FIT file: {0}")]
    FitParse(String),
    #[error("failed to write GPX: {0}")]
    Xml(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TrackError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TrackError::Io {
            path: path.into(),
            source,
        }
    }
}
