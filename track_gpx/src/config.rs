//! Physical description of a velodrome, loadable from JSON.

use std::f64::consts::PI;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::projection::UtmCoord;
use crate::TrackError;

/// Where the centre of the loop sits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "crs", rename_all = "snake_case")]
pub enum CenterAnchor {
    Utm {
        easting: f64,
        northing: f64,
        zone: u8,
        #[serde(default = "default_northern")]
        northern: bool,
    },
    Wgs84 { latitude: f64, longitude: f64 },
}

fn default_northern() -> bool {
    true
}

impl CenterAnchor {
    pub fn to_utm(&self) -> Result<UtmCoord, TrackError> {
        match *self {
            CenterAnchor::Utm {
                easting,
                northing,
                zone,
                northern,
            } => UtmCoord::new(easting, northing, zone, northern),
            CenterAnchor::Wgs84 {
                latitude,
                longitude,
            } => {
                if !(-80.0..=84.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
                    return Err(TrackError::Config(format!(
                        "centre ({}, {}) is outside the UTM domain",
                        latitude, longitude
                    )));
                }
                Ok(UtmCoord::from_wgs84(latitude, longitude, None))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VelodromeConfig {
    pub name: String,
    pub center: CenterAnchor,
    /// Major axis orientation, degrees counter-clockwise from grid east.
    pub rotation_deg: f64,
    pub length_m: f64,
    /// Length of each of the two straights; the bends take the rest.
    pub straight_m: f64,
    /// Arc-length step of the lookup table.
    pub precision_m: f64,
    pub elevation_m: f64,
    /// Arc length from the home-straight origin to the finish line.
    pub start_finish_m: f64,
}

impl Default for VelodromeConfig {
    fn default() -> Self {
        // Eddy Merckx Wielercentrum, Ghent.
        let bend_radius_m = 27.7;
        let straight_m = 38.0;
        Self {
            name: "Eddy Merckx Wielercentrum".to_string(),
            center: CenterAnchor::Utm {
                easting: 548_540.34,
                northing: 5_655_259.58,
                zone: 31,
                northern: true,
            },
            rotation_deg: -18.0,
            length_m: 250.0,
            straight_m,
            precision_m: 0.1,
            elevation_m: 7.0,
            start_finish_m: ((PI * bend_radius_m + 2.0 * straight_m) * 10.0).round() / 10.0,
        }
    }
}

impl VelodromeConfig {
    pub fn from_json_str(text: &str) -> Result<Self, TrackError> {
        serde_json::from_str(text).map_err(|e| TrackError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, TrackError> {
        let text = fs::read_to_string(path).map_err(|e| TrackError::io(path, e))?;
        Self::from_json_str(&text)
            .map_err(|e| TrackError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Radius of the two semicircular bends.
    pub fn bend_radius_m(&self) -> f64 {
        (self.length_m - 2.0 * self.straight_m) / (2.0 * PI)
    }

    pub fn params_hash_sha256(&self) -> Result<String, TrackError> {
        let bytes = serde_json::to_vec(self).map_err(|e| TrackError::Config(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }

    /// Lower-case, dash separated form of the name for file names.
    pub fn slug(&self) -> String {
        let mut slug = String::with_capacity(self.name.len());
        for c in self.name.chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
            } else if !slug.ends_with('-') && !slug.is_empty() {
                slug.push('-');
            }
        }
        let slug = slug.trim_end_matches('-').to_string();
        if slug.is_empty() {
            "velodrome".to_string()
        } else {
            slug
        }
    }

    /// `<dir>/<slug>-<hash12>.csv`, unique per set of parameters.
    pub fn default_cache_path(&self, dir: &Path) -> Result<PathBuf, TrackError> {
        let hash = self.params_hash_sha256()?;
        Ok(dir.join(format!("{}-{}.csv", self.slug(), &hash[..12])))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_wielercentrum() {
        let cfg = VelodromeConfig::default();
        assert_eq!(cfg.start_finish_m, 163.0);
        assert!((cfg.bend_radius_m() - 27.69).abs() < 0.01);
        assert_eq!(cfg.slug(), "eddy-merckx-wielercentrum");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg = VelodromeConfig::from_json_str(
            r#"{"name": "Sportpaleis Alkmaar", "center": {"crs": "wgs84", "latitude": 52.63, "longitude": 4.72}, "length_m": 250.0, "straight_m": 40.0}"#,
        )
        .unwrap();
        assert_eq!(cfg.precision_m, 0.1);
        assert_eq!(cfg.elevation_m, 7.0);
        let utm = cfg.center.to_utm().unwrap();
        assert_eq!(utm.zone, 31);
        assert!(utm.northern);
    }

    #[test]
    fn test_unknown_crs_is_config_error() {
        let err = VelodromeConfig::from_json_str(r#"{"center": {"crs": "lambert72", "x": 1.0}}"#)
            .unwrap_err();
        assert!(matches!(err, TrackError::Config(_)));
    }

    #[test]
    fn test_cache_path_changes_with_parameters() {
        let dir = Path::new(".cache");
        let a = VelodromeConfig::default();
        let mut b = a.clone();
        b.precision_m = 0.05;
        let pa = a.default_cache_path(dir).unwrap();
        let pb = b.default_cache_path(dir).unwrap();
        assert_ne!(pa, pb);
        assert_eq!(pa, a.default_cache_path(dir).unwrap());
        assert!(pa
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("eddy-merckx-wielercentrum-"));
    }
}
