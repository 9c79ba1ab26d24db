//! Heart-rate samples from a FIT activity recorded alongside the track session.

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use fitparser::de::from_bytes;
use fitparser::profile::MesgNum;

use crate::TrackError;

/// Largest distance to the nearest sample before a point goes without HR.
pub const DEFAULT_MAX_GAP_S: i64 = 5;

pub fn default_max_gap() -> TimeDelta {
    TimeDelta::seconds(DEFAULT_MAX_GAP_S)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartRateSample {
    pub time: DateTime<Tz>,
    pub bpm: u8,
}

/// Time-ordered samples, one per instant.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeartRateSeries {
    samples: Vec<HeartRateSample>,
}

impl HeartRateSeries {
    pub fn from_samples(mut samples: Vec<HeartRateSample>) -> Self {
        samples.sort_by_key(|s| s.time);
        samples.dedup_by_key(|s| s.time);
        Self { samples }
    }

    pub fn samples(&self) -> &[HeartRateSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn time_range(&self) -> Option<(DateTime<Tz>, DateTime<Tz>)> {
        Some((self.samples.first()?.time, self.samples.last()?.time))
    }

    /// Express every sample in `tz`; instants are unchanged.
    pub fn with_timezone(self, tz: Tz) -> Self {
        let samples = self
            .samples
            .into_iter()
            .map(|s| HeartRateSample {
                time: s.time.with_timezone(&tz),
                bpm: s.bpm,
            })
            .collect();
        Self { samples }
    }

    /// Nearest sample to `time`, if it lies within `max_gap`.
    pub fn at(&self, time: DateTime<Tz>, max_gap: TimeDelta) -> Option<u8> {
        let idx = self.samples.partition_point(|s| s.time < time);
        let before = idx.checked_sub(1).and_then(|i| self.samples.get(i));
        let after = self.samples.get(idx);
        let nearest = match (before, after) {
            (Some(b), Some(a)) => {
                if time - b.time <= a.time - time {
                    b
                } else {
                    a
                }
            }
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => return None,
        };
        ((nearest.time - time).abs() <= max_gap).then_some(nearest.bpm)
    }
}

/// Collect `heart_rate` from every record message of a FIT file.
pub fn read_fit_heart_rate(input: &[u8]) -> Result<HeartRateSeries, TrackError> {
    let records = from_bytes(input).map_err(|e| TrackError::FitParse(e.to_string()))?;
    let mut samples = Vec::new();

    for record in records.into_iter() {
        if record.kind() != MesgNum::Record {
            continue;
        }
        let mut timestamp: Option<DateTime<Utc>> = None;
        let mut bpm: Option<u8> = None;
        for field in record.fields() {
            match field.name() {
                "timestamp" => {
                    if let fitparser::Value::Timestamp(ts) = field.value() {
                        timestamp = Some(ts.with_timezone(&Utc));
                    }
                }
                "heart_rate" => {
                    bpm = fit_value_to_bpm(field.value());
                }
                _ => {}
            }
        }
        if let (Some(ts), Some(bpm)) = (timestamp, bpm) {
            samples.push(HeartRateSample {
                time: ts.with_timezone(&Tz::UTC),
                bpm,
            });
        }
    }

    Ok(HeartRateSeries::from_samples(samples))
}

fn fit_value_to_bpm(value: &fitparser::Value) -> Option<u8> {
    let bpm = match value {
        fitparser::Value::UInt8(v) | fitparser::Value::UInt8z(v) | fitparser::Value::Byte(v) => {
            *v as f64
        }
        fitparser::Value::UInt16(v) => *v as f64,
        fitparser::Value::Float32(v) => *v as f64,
        fitparser::Value::Float64(v) => *v,
        fitparser::Value::Array(values) => return values.iter().find_map(fit_value_to_bpm),
        _ => return None,
    };
    (bpm.is_finite() && bpm > 0.0 && bpm < 255.0).then(|| bpm.round() as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(secs: i64, bpm: u8) -> HeartRateSample {
        HeartRateSample {
            time: Tz::UTC.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap() + TimeDelta::seconds(secs),
            bpm,
        }
    }

    fn series() -> HeartRateSeries {
        HeartRateSeries::from_samples(vec![sample(10, 150), sample(0, 120), sample(4, 131)])
    }

    #[test]
    fn test_samples_are_sorted() {
        let hr = series();
        let bpms: Vec<u8> = hr.samples().iter().map(|s| s.bpm).collect();
        assert_eq!(bpms, vec![120, 131, 150]);
    }

    #[test]
    fn test_at_picks_nearest_within_gap() {
        let hr = series();
        let t = |secs: i64| sample(secs, 0).time;
        assert_eq!(hr.at(t(4), default_max_gap()), Some(131));
        assert_eq!(hr.at(t(6), default_max_gap()), Some(131));
        assert_eq!(hr.at(t(8), default_max_gap()), Some(150));
        assert_eq!(hr.at(t(-5), default_max_gap()), Some(120));
        assert_eq!(hr.at(t(-6), default_max_gap()), None);
        assert_eq!(hr.at(t(16), default_max_gap()), None);
        assert_eq!(HeartRateSeries::default().at(t(0), default_max_gap()), None);
    }

    #[test]
    fn test_with_timezone_keeps_instants() {
        let local = series().with_timezone(chrono_tz::Europe::Brussels);
        let (start, _) = local.time_range().unwrap();
        assert_eq!(start.timezone(), chrono_tz::Europe::Brussels);
        assert_eq!(start, sample(0, 0).time);
        let brussels_noon = chrono_tz::Europe::Brussels
            .with_ymd_and_hms(2024, 1, 1, 12, 0, 4)
            .unwrap();
        assert_eq!(local.at(brussels_noon, default_max_gap()), Some(131));
    }

    #[test]
    fn test_garbage_is_fit_error() {
        let err = read_fit_heart_rate(b"definitely not a fit file").unwrap_err();
        assert!(matches!(err, TrackError::FitParse(_)));
    }

    #[test]
    fn test_bpm_conversion() {
        assert_eq!(fit_value_to_bpm(&fitparser::Value::UInt8(142)), Some(142));
        assert_eq!(fit_value_to_bpm(&fitparser::Value::UInt8(0)), None);
        assert_eq!(fit_value_to_bpm(&fitparser::Value::Float64(99.6)), Some(100));
        assert_eq!(fit_value_to_bpm(&fitparser::Value::String("x".into())), None);
    }
}
