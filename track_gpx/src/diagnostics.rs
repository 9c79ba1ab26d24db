//! Non-fatal events raised while parsing, building geometry and interpolating.
//!
//! Library code never logs directly; callers pass a [`DiagnosticSink`] and
//! decide what to do with the events. Tests collect them into a `Vec`, the
//! CLI forwards them to `tracing` through [`LogSink`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Diagnostic {
    /// A new session started because the lap sequence broke.
    SessionGap {
        session: u32,
        previous_lap: u32,
        lap: u32,
    },
    /// Lap with a non-positive or non-finite duration; no points emitted.
    DegenerateLap { session: u32, lap: u32, laptime_s: f64 },
    /// Consecutive laps of one session that do not abut in time.
    TimingGap { session: u32, lap: u32, gap_s: f64 },
    /// Export row ignored because all required cells were blank.
    SkippedRow { row: usize, reason: String },
    CacheRejected { path: PathBuf, reason: String },
    CacheLoaded { path: PathBuf },
    /// Geometry was built but could not be persisted; the run continues.
    CacheWriteFailed { path: PathBuf, reason: String },
    CacheWritten { path: PathBuf },
}

pub trait DiagnosticSink {
    fn emit(&mut self, diagnostic: Diagnostic);
}

impl DiagnosticSink for Vec<Diagnostic> {
    fn emit(&mut self, diagnostic: Diagnostic) {
        self.push(diagnostic);
    }
}

/// Forwards every event to the process-wide `tracing` subscriber.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn emit(&mut self, diagnostic: Diagnostic) {
        match diagnostic {
            Diagnostic::SessionGap {
                session,
                previous_lap,
                lap,
            } => info!(
                "Session {} starts at lap {} (previous lap {})",
                session, lap, previous_lap
            ),
            Diagnostic::DegenerateLap {
                session,
                lap,
                laptime_s,
            } => warn!(
                "Skipping lap {} of session {}: lap time {:.3} s",
                lap, session, laptime_s
            ),
            Diagnostic::TimingGap { session, lap, gap_s } => warn!(
                "Session {}: {:.2} s between lap {} and the previous lap",
                session, gap_s, lap
            ),
            Diagnostic::SkippedRow { row, reason } => debug!("Skipping row {}: {}", row, reason),
            Diagnostic::CacheRejected { path, reason } => warn!(
                "Ignoring velodrome cache {} ({}); rebuilding",
                path.display(),
                reason
            ),
            Diagnostic::CacheLoaded { path } => {
                info!("Loaded velodrome from cache {}", path.display())
            }
            Diagnostic::CacheWriteFailed { path, reason } => warn!(
                "Could not write velodrome cache {}: {}",
                path.display(),
                reason
            ),
            Diagnostic::CacheWritten { path } => {
                info!("Wrote velodrome cache {}", path.display())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_sink_collects_in_order() {
        let mut sink: Vec<Diagnostic> = Vec::new();
        sink.emit(Diagnostic::SkippedRow {
            row: 3,
            reason: "blank".into(),
        });
        sink.emit(Diagnostic::TimingGap {
            session: 1,
            lap: 4,
            gap_s: 2.5,
        });
        assert_eq!(sink.len(), 2);
        assert!(matches!(sink[0], Diagnostic::SkippedRow { row: 3, .. }));
    }
}
