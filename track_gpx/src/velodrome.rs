//! Track geometry: closed-loop arc-length fraction → latitude/longitude.
//!
//! [`ComputedVelodrome`] derives the table from physical parameters (the
//! expensive path, done once per track and cached to CSV) while
//! [`TableVelodrome`] wraps a table loaded from that cache. Both answer
//! queries through the [`Velodrome`] trait.

use std::f64::consts::PI;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::config::VelodromeConfig;
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::projection::{local_distance_m, UtmCoord};
use crate::TrackError;

const CACHE_HEADER: [&str; 3] = ["arc_fraction", "latitude", "longitude"];
const CLOSURE_SLACK_M: f64 = 1e-3;
const MAX_SEGMENTS: usize = 10_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation_m: f64,
}

/// Samples of the loop ordered by arc-length fraction; the last sample
/// (fraction 1) repeats the first.
#[derive(Clone, Debug, PartialEq)]
pub struct ArcLengthTable {
    fraction: Array1<f64>,
    latitude: Array1<f64>,
    longitude: Array1<f64>,
    length_m: f64,
}

impl ArcLengthTable {
    /// Fewest segments a loop may be discretised into.
    pub const MIN_SEGMENTS: usize = 8;

    /// Build a table, checking that it is a closed loop with
    /// non-decreasing fractions. The error is a human-readable reason.
    pub fn new(fraction: Vec<f64>, latitude: Vec<f64>, longitude: Vec<f64>) -> Result<Self, String> {
        let n = fraction.len();
        if latitude.len() != n || longitude.len() != n {
            return Err("column lengths differ".to_string());
        }
        if n < Self::MIN_SEGMENTS + 1 {
            return Err(format!(
                "{} samples, need at least {}",
                n,
                Self::MIN_SEGMENTS + 1
            ));
        }
        for i in 0..n {
            let (f, lat, lon) = (fraction[i], latitude[i], longitude[i]);
            if !f.is_finite() || !lat.is_finite() || !lon.is_finite() {
                return Err(format!("non-finite value in row {}", i));
            }
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                return Err(format!("row {} ({}, {}) is not a WGS84 coordinate", i, lat, lon));
            }
        }
        if fraction[0] != 0.0 {
            return Err(format!("first arc fraction is {}, expected 0", fraction[0]));
        }
        if fraction[n - 1] != 1.0 {
            return Err(format!("last arc fraction is {}, expected 1", fraction[n - 1]));
        }
        if let Some(i) = (1..n).find(|&i| fraction[i] < fraction[i - 1]) {
            return Err(format!("arc fraction decreases at row {}", i));
        }

        let mut length_m = 0.0;
        let mut max_step_m: f64 = 0.0;
        for i in 1..n {
            let step = local_distance_m(latitude[i - 1], longitude[i - 1], latitude[i], longitude[i]);
            length_m += step;
            max_step_m = max_step_m.max(step);
        }
        let gap_m = local_distance_m(latitude[0], longitude[0], latitude[n - 1], longitude[n - 1]);
        if gap_m > max_step_m + CLOSURE_SLACK_M {
            return Err(format!(
                "loop is not closed: first and last samples are {:.3} m apart",
                gap_m
            ));
        }
        if length_m <= 0.0 {
            return Err("loop has zero length".to_string());
        }

        Ok(Self {
            fraction: Array1::from_vec(fraction),
            latitude: Array1::from_vec(latitude),
            longitude: Array1::from_vec(longitude),
            length_m,
        })
    }

    pub fn len(&self) -> usize {
        self.fraction.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fraction.is_empty()
    }

    /// Geodesic length of the loop as sampled.
    pub fn length_m(&self) -> f64 {
        self.length_m
    }

    pub fn sample(&self, i: usize) -> Option<(f64, f64, f64)> {
        Some((
            *self.fraction.get(i)?,
            *self.latitude.get(i)?,
            *self.longitude.get(i)?,
        ))
    }

    /// Linear interpolation between the two samples bracketing
    /// `arc_fraction` (taken modulo 1).
    pub fn lookup(&self, arc_fraction: f64) -> (f64, f64) {
        let f = if arc_fraction.is_finite() {
            arc_fraction.rem_euclid(1.0)
        } else {
            0.0
        };
        let n = self.len();
        let fractions = self
            .fraction
            .as_slice()
            .unwrap_or_default();
        let hi = fractions.partition_point(|&x| x <= f).clamp(1, n - 1);
        let lo = hi - 1;
        let span = self.fraction[hi] - self.fraction[lo];
        let t = if span > 0.0 {
            ((f - self.fraction[lo]) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        (
            self.latitude[lo] + (self.latitude[hi] - self.latitude[lo]) * t,
            self.longitude[lo] + (self.longitude[hi] - self.longitude[lo]) * t,
        )
    }

    pub fn read_csv<R: Read>(reader: R) -> Result<Self, String> {
        let mut reader = csv::Reader::from_reader(reader);
        let headers = reader.headers().map_err(|e| e.to_string())?;
        if headers.iter().map(str::trim).ne(CACHE_HEADER.iter().copied()) {
            return Err(format!(
                "header {:?}, expected {}",
                headers.iter().collect::<Vec<_>>(),
                CACHE_HEADER.join(",")
            ));
        }
        let mut fraction = Vec::new();
        let mut latitude = Vec::new();
        let mut longitude = Vec::new();
        for (i, record) in reader.records().enumerate() {
            let record = record.map_err(|e| e.to_string())?;
            let value = |col: usize| -> Result<f64, String> {
                let raw = record.get(col).unwrap_or("").trim();
                raw.parse::<f64>()
                    .map_err(|e| format!("row {} column {}: '{}': {}", i + 2, CACHE_HEADER[col], raw, e))
            };
            fraction.push(value(0)?);
            latitude.push(value(1)?);
            longitude.push(value(2)?);
        }
        Self::new(fraction, latitude, longitude)
    }

    pub fn load(path: &Path) -> Result<Self, TrackError> {
        let file = File::open(path).map_err(|e| TrackError::io(path, e))?;
        Self::read_csv(file).map_err(|reason| TrackError::CacheFormat {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Floats are written in shortest round-trip form, so reading the
    /// output back reproduces this table exactly.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), TrackError> {
        let wrap = |source: csv::Error| TrackError::Csv {
            context: "velodrome table".to_string(),
            source,
        };
        let mut writer = csv::Writer::from_writer(writer);
        writer.write_record(CACHE_HEADER).map_err(wrap)?;
        for i in 0..self.len() {
            writer
                .write_record([
                    self.fraction[i].to_string(),
                    self.latitude[i].to_string(),
                    self.longitude[i].to_string(),
                ])
                .map_err(wrap)?;
        }
        writer.flush().map_err(|e| wrap(e.into()))?;
        Ok(())
    }

    /// Persist via a sibling temp file and rename, so concurrent writers
    /// never leave a torn file and the last rename wins.
    pub fn save(&self, path: &Path) -> Result<(), TrackError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| TrackError::io(dir, e))?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "velodrome.csv".to_string());
        let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));
        let file = File::create(&tmp).map_err(|e| TrackError::io(&tmp, e))?;
        let mut writer = BufWriter::new(file);
        let written = self
            .write_csv(&mut writer)
            .and_then(|_| writer.flush().map_err(|e| TrackError::io(&tmp, e)));
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        drop(writer);
        fs::rename(&tmp, path).map_err(|e| TrackError::io(path, e))
    }
}

/// Common query surface of both geometry variants.
pub trait Velodrome {
    fn name(&self) -> &str;
    fn elevation_m(&self) -> f64;
    /// Arc length of the finish line from the table origin.
    fn start_finish_m(&self) -> f64;
    fn table(&self) -> &ArcLengthTable;

    fn length_m(&self) -> f64 {
        self.table().length_m()
    }

    fn start_finish_fraction(&self) -> f64 {
        (self.start_finish_m() / self.length_m()).rem_euclid(1.0)
    }

    fn position_at(&self, arc_fraction: f64) -> GeoPoint {
        let (latitude, longitude) = self.table().lookup(arc_fraction);
        GeoPoint {
            latitude,
            longitude,
            elevation_m: self.elevation_m(),
        }
    }

    fn save(&self, path: &Path) -> Result<(), TrackError> {
        self.table().save(path)
    }
}

/// Geometry backed only by a precomputed table.
#[derive(Clone, Debug)]
pub struct TableVelodrome {
    name: String,
    elevation_m: f64,
    start_finish_m: f64,
    table: ArcLengthTable,
}

impl TableVelodrome {
    pub fn new(
        name: impl Into<String>,
        elevation_m: f64,
        start_finish_m: f64,
        table: ArcLengthTable,
    ) -> Result<Self, TrackError> {
        if !elevation_m.is_finite() || !start_finish_m.is_finite() {
            return Err(TrackError::GeometryConfig(format!(
                "elevation {} and start/finish {} must be finite",
                elevation_m, start_finish_m
            )));
        }
        Ok(Self {
            name: name.into(),
            elevation_m,
            start_finish_m,
            table,
        })
    }

    pub fn load(
        path: &Path,
        name: impl Into<String>,
        elevation_m: f64,
        start_finish_m: f64,
    ) -> Result<Self, TrackError> {
        let table = ArcLengthTable::load(path)?;
        Self::new(name, elevation_m, start_finish_m, table)
    }
}

impl Velodrome for TableVelodrome {
    fn name(&self) -> &str {
        &self.name
    }

    fn elevation_m(&self) -> f64 {
        self.elevation_m
    }

    fn start_finish_m(&self) -> f64 {
        self.start_finish_m
    }

    fn table(&self) -> &ArcLengthTable {
        &self.table
    }
}

/// Geometry computed from physical parameters as a stadium: two straights
/// joined by semicircular bends, ridden counter-clockwise from the start of
/// the home straight.
#[derive(Clone, Debug)]
pub struct ComputedVelodrome {
    config: VelodromeConfig,
    table: ArcLengthTable,
}

impl ComputedVelodrome {
    pub fn build(config: &VelodromeConfig) -> Result<Self, TrackError> {
        let invalid = |msg: String| Err(TrackError::GeometryConfig(msg));
        let finite = [
            config.length_m,
            config.straight_m,
            config.precision_m,
            config.rotation_deg,
            config.elevation_m,
            config.start_finish_m,
        ];
        if finite.iter().any(|v| !v.is_finite()) {
            return invalid(format!("non-finite parameter in {:?}", config));
        }
        if config.length_m <= 0.0 {
            return invalid(format!("length {} m must be positive", config.length_m));
        }
        if config.precision_m <= 0.0 {
            return invalid(format!("precision {} m must be positive", config.precision_m));
        }
        if config.straight_m < 0.0 || 2.0 * config.straight_m >= config.length_m {
            return invalid(format!(
                "straights of {} m leave no room for bends in a {} m loop",
                config.straight_m, config.length_m
            ));
        }
        let segments = (config.length_m / config.precision_m).round();
        if segments < ArcLengthTable::MIN_SEGMENTS as f64 {
            return invalid(format!(
                "{} m at {} m precision gives {} segments, need at least {}",
                config.length_m,
                config.precision_m,
                segments,
                ArcLengthTable::MIN_SEGMENTS
            ));
        }
        if segments > MAX_SEGMENTS as f64 {
            return invalid(format!(
                "{} m at {} m precision gives {} segments, at most {} supported",
                config.length_m, config.precision_m, segments, MAX_SEGMENTS
            ));
        }
        let segments = segments as usize;

        let center = config.center.to_utm()?;
        let scale = center.scale_factor();
        let (sin_r, cos_r) = config.rotation_deg.to_radians().sin_cos();
        let radius = config.bend_radius_m();

        let mut fraction = Vec::with_capacity(segments + 1);
        let mut latitude = Vec::with_capacity(segments + 1);
        let mut longitude = Vec::with_capacity(segments + 1);
        for i in 0..segments {
            let s = config.length_m * i as f64 / segments as f64;
            let (x, y) = stadium_point(s, config.straight_m, radius);
            let east = center.easting + scale * (x * cos_r - y * sin_r);
            let north = center.northing + scale * (x * sin_r + y * cos_r);
            let (lat, lon) = UtmCoord { easting: east, northing: north, ..center }.to_wgs84();
            fraction.push(i as f64 / segments as f64);
            latitude.push(lat);
            longitude.push(lon);
        }
        fraction.push(1.0);
        latitude.push(latitude[0]);
        longitude.push(longitude[0]);

        let table = ArcLengthTable::new(fraction, latitude, longitude)
            .map_err(TrackError::GeometryConfig)?;
        Ok(Self {
            config: config.clone(),
            table,
        })
    }

    pub fn config(&self) -> &VelodromeConfig {
        &self.config
    }
}

impl Velodrome for ComputedVelodrome {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn elevation_m(&self) -> f64 {
        self.config.elevation_m
    }

    fn start_finish_m(&self) -> f64 {
        self.config.start_finish_m
    }

    fn table(&self) -> &ArcLengthTable {
        &self.table
    }
}

/// Local (x, y) metres of arc length `s` on a stadium centred on the origin
/// with its straights parallel to x.
fn stadium_point(s: f64, straight: f64, radius: f64) -> (f64, f64) {
    let half = straight / 2.0;
    let bend = PI * radius;
    if s < straight {
        (-half + s, -radius)
    } else if s < straight + bend {
        let theta = -PI / 2.0 + (s - straight) / radius;
        (half + radius * theta.cos(), radius * theta.sin())
    } else if s < 2.0 * straight + bend {
        (half - (s - straight - bend), radius)
    } else {
        let theta = PI / 2.0 + (s - 2.0 * straight - bend) / radius;
        (-half + radius * theta.cos(), radius * theta.sin())
    }
}

/// Load the cached table when it validates, otherwise build from `config`
/// and persist to `cache_path`.
pub fn load_or_build(
    config: &VelodromeConfig,
    cache_path: &Path,
    sink: &mut dyn DiagnosticSink,
) -> Result<Box<dyn Velodrome>, TrackError> {
    if cache_path.is_file() {
        let cached = TableVelodrome::load(
            cache_path,
            config.name.as_str(),
            config.elevation_m,
            config.start_finish_m,
        );
        match cached {
            Ok(velodrome) => {
                sink.emit(Diagnostic::CacheLoaded {
                    path: cache_path.to_path_buf(),
                });
                return Ok(Box::new(velodrome));
            }
            Err(err) => sink.emit(Diagnostic::CacheRejected {
                path: cache_path.to_path_buf(),
                reason: err.to_string(),
            }),
        }
    }

    let velodrome = ComputedVelodrome::build(config)?;
    match velodrome.save(cache_path) {
        Ok(()) => sink.emit(Diagnostic::CacheWritten {
            path: cache_path.to_path_buf(),
        }),
        Err(err) => sink.emit(Diagnostic::CacheWriteFailed {
            path: cache_path.to_path_buf(),
            reason: err.to_string(),
        }),
    }
    Ok(Box::new(velodrome))
}
