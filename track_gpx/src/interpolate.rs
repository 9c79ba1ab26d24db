//! Lap events + velodrome geometry → densely sampled positions.
//!
//! Each lap starts at the finish line (the transponder loop) at its
//! timestamp and progresses along the loop at constant speed until the
//! next lap starts. Arc fraction at every lap boundary is therefore exactly
//! the start/finish fraction, which keeps consecutive laps continuous.

use chrono::{DateTime, TimeDelta};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::transponder::LapRecord;
use crate::velodrome::Velodrome;
use crate::TrackError;

const BOUNDARY_EPS_S: f64 = 1e-6;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpolationParams {
    /// Spacing of emitted samples, aligned to each session's first lap.
    pub sample_interval_s: f64,
    /// How far a lap's end may miss the next lap's start and still count
    /// as contiguous.
    pub contiguity_tolerance_s: f64,
}

impl Default for InterpolationParams {
    fn default() -> Self {
        Self {
            sample_interval_s: 1.0,
            contiguity_tolerance_s: 1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InterpolatedPoint {
    pub time: DateTime<Tz>,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation_m: f64,
    /// Position along the loop in [0, 1), measured from the table origin.
    pub arc_fraction: f64,
    pub session: u32,
    pub lap: u32,
}

/// Points of one session. Nothing is synthesised between segments.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceSegment {
    pub session: u32,
    pub points: Vec<InterpolatedPoint>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub sessions: usize,
    pub laps: usize,
    pub laps_skipped: usize,
    pub timing_gaps: usize,
    pub points: usize,
    /// RFC 3339 times of the first and last emitted point.
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Trace {
    pub segments: Vec<TraceSegment>,
    pub summary: TraceSummary,
    timezone: Tz,
}

impl Trace {
    /// Timezone of every point's timestamp.
    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn time_range(&self) -> Option<(DateTime<Tz>, DateTime<Tz>)> {
        let first = self.points().next()?.time;
        let last = self.points().last()?.time;
        Some((first, last))
    }

    pub fn points(&self) -> impl Iterator<Item = &InterpolatedPoint> + '_ {
        self.segments.iter().flat_map(|s| s.points.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.points().next().is_none()
    }
}

/// Interpolate every session in `laps` onto `velodrome`.
///
/// `laps` must be in file order as produced by the transponder reader, so
/// that the rows of one session are adjacent.
pub fn map_interpolation_to_velodrome(
    laps: &[LapRecord],
    velodrome: &dyn Velodrome,
    params: &InterpolationParams,
    sink: &mut dyn DiagnosticSink,
) -> Result<Trace, TrackError> {
    if !(params.sample_interval_s.is_finite() && params.sample_interval_s > 0.0) {
        return Err(TrackError::Config(format!(
            "sample interval {} s must be positive",
            params.sample_interval_s
        )));
    }
    if !(params.contiguity_tolerance_s.is_finite() && params.contiguity_tolerance_s >= 0.0) {
        return Err(TrackError::Config(format!(
            "contiguity tolerance {} s must be non-negative",
            params.contiguity_tolerance_s
        )));
    }

    let timezone = laps
        .first()
        .map(|lap| lap.timestamp.timezone())
        .unwrap_or(Tz::UTC);
    let mut summary = TraceSummary {
        laps: laps.len(),
        ..TraceSummary::default()
    };
    let mut segments = Vec::new();

    let mut start = 0;
    while start < laps.len() {
        let session = laps[start].session;
        let end = laps[start..]
            .iter()
            .position(|lap| lap.session != session)
            .map_or(laps.len(), |offset| start + offset);
        summary.sessions += 1;
        let points = interpolate_session(&laps[start..end], velodrome, params, sink, &mut summary);
        if !points.is_empty() {
            summary.points += points.len();
            segments.push(TraceSegment { session, points });
        }
        start = end;
    }

    let mut trace = Trace {
        segments,
        summary,
        timezone,
    };
    if let Some((start, end)) = trace.time_range() {
        trace.summary.start = Some(start.to_rfc3339());
        trace.summary.end = Some(end.to_rfc3339());
    }
    Ok(trace)
}

fn interpolate_session(
    laps: &[LapRecord],
    velodrome: &dyn Velodrome,
    params: &InterpolationParams,
    sink: &mut dyn DiagnosticSink,
    summary: &mut TraceSummary,
) -> Vec<InterpolatedPoint> {
    let mut points = Vec::new();
    let Some(first) = laps.first() else {
        return points;
    };
    let t0 = first.timestamp;
    let offset = |t: DateTime<Tz>| seconds_between(t0, t);
    let sf = velodrome.start_finish_fraction();
    let loop_m = velodrome.length_m();
    let dt = params.sample_interval_s;
    let tol = params.contiguity_tolerance_s;

    let mut push = |at_s: f64, arc: f64, lap: &LapRecord| {
        let arc_fraction = wrap_fraction(arc);
        let pos = velodrome.position_at(arc_fraction);
        points.push(InterpolatedPoint {
            time: t0 + TimeDelta::microseconds((at_s * 1e6).round() as i64),
            latitude: pos.latitude,
            longitude: pos.longitude,
            elevation_m: pos.elevation_m,
            arc_fraction,
            session: lap.session,
            lap: lap.lap,
        });
    };

    let distances = lap_distances(laps);
    for (i, lap) in laps.iter().enumerate() {
        let lap_start = offset(lap.timestamp);
        if is_degenerate(lap) {
            sink.emit(Diagnostic::DegenerateLap {
                session: lap.session,
                lap: lap.lap,
                laptime_s: lap.laptime_s,
            });
            summary.laps_skipped += 1;
            continue;
        }
        let nominal_end = lap_start + lap.laptime_s;

        // Skipped laps never close the one before them.
        let next = laps[i + 1..].iter().find(|next| !is_degenerate(next));

        // Abutting laps share their boundary point, emitted as the next start.
        let (lap_end, emit_end) = match next.map(|next| offset(next.timestamp)) {
            Some(next_start) if next_start <= lap_start + BOUNDARY_EPS_S => {
                sink.emit(Diagnostic::DegenerateLap {
                    session: lap.session,
                    lap: lap.lap,
                    laptime_s: next_start - lap_start,
                });
                summary.laps_skipped += 1;
                continue;
            }
            Some(next_start) if (next_start - nominal_end).abs() <= tol => (next_start, false),
            Some(next_start) => {
                sink.emit(Diagnostic::TimingGap {
                    session: lap.session,
                    lap: next.map_or(lap.lap, |next| next.lap),
                    gap_s: next_start - nominal_end,
                });
                summary.timing_gaps += 1;
                if next_start < nominal_end {
                    (next_start, false)
                } else {
                    (nominal_end, true)
                }
            }
            None => (nominal_end, true),
        };

        let loops = loops_per_lap(distances[i], loop_m);
        let duration = lap_end - lap_start;
        let arc_at = |t: f64| sf + loops * (t - lap_start) / duration;

        push(lap_start, sf, lap);
        let mut k = (lap_start / dt).floor() as i64 + 1;
        loop {
            let t = k as f64 * dt;
            if t >= lap_end - BOUNDARY_EPS_S {
                break;
            }
            if t > lap_start + BOUNDARY_EPS_S {
                push(t, arc_at(t), lap);
            }
            k += 1;
        }
        if emit_end {
            push(lap_end, sf + loops, lap);
        }
    }
    points
}

fn is_degenerate(lap: &LapRecord) -> bool {
    !(lap.laptime_s.is_finite() && lap.laptime_s > 0.0)
}

/// Distance ridden in each lap of one session.
///
/// Some exports carry a running total instead of a per-lap distance. A column
/// is read as cumulative when it never decreases and every step matches the
/// row's speed × lap time more closely than the raw value does.
fn lap_distances(laps: &[LapRecord]) -> Vec<f64> {
    let raw: Vec<f64> = laps.iter().map(|l| l.distance_m).collect();
    let expected: Vec<f64> = laps
        .iter()
        .map(|l| l.avg_speed_mps * l.laptime_s)
        .collect();
    let cumulative = raw.len() >= 2
        && (1..raw.len()).all(|i| {
            let step = raw[i] - raw[i - 1];
            step >= 0.0 && (step - expected[i]).abs() < (raw[i] - expected[i]).abs()
        });
    if !cumulative {
        return raw;
    }
    // A running total may carry distance from before the session started.
    let first = if expected[0] > 0.0 && raw[0] > 1.5 * expected[0] {
        expected[0]
    } else {
        raw[0]
    };
    std::iter::once(first)
        .chain(raw.windows(2).map(|w| w[1] - w[0]))
        .collect()
}

/// Whole loops covered by one transponder lap; at least one.
fn loops_per_lap(distance_m: f64, loop_m: f64) -> f64 {
    if distance_m.is_finite() && distance_m > 0.0 && loop_m > 0.0 {
        (distance_m / loop_m).round().max(1.0)
    } else {
        1.0
    }
}

fn wrap_fraction(arc: f64) -> f64 {
    let wrapped = arc.rem_euclid(1.0);
    if wrapped >= 1.0 {
        0.0
    } else {
        wrapped
    }
}

fn seconds_between(from: DateTime<Tz>, to: DateTime<Tz>) -> f64 {
    let delta = to - from;
    delta.num_seconds() as f64 + delta.subsec_nanos() as f64 / 1e9
}
