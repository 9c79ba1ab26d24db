//! WGS84 transverse Mercator (UTM) conversions and short-range distances.

use serde::{Deserialize, Serialize};

use crate::TrackError;

const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;
const UTM_K0: f64 = 0.9996;
const FALSE_EASTING: f64 = 500_000.0;
const FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

fn e2() -> f64 {
    WGS84_F * (2.0 - WGS84_F)
}

fn ep2() -> f64 {
    let e2 = e2();
    e2 / (1.0 - e2)
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UtmCoord {
    pub easting: f64,
    pub northing: f64,
    pub zone: u8,
    pub northern: bool,
}

impl UtmCoord {
    pub fn new(easting: f64, northing: f64, zone: u8, northern: bool) -> Result<Self, TrackError> {
        if !(1..=60).contains(&zone) {
            return Err(TrackError::Config(format!(
                "UTM zone {} outside 1..=60",
                zone
            )));
        }
        if !easting.is_finite() || !northing.is_finite() {
            return Err(TrackError::Config(format!(
                "UTM coordinate ({}, {}) is not finite",
                easting, northing
            )));
        }
        Ok(Self {
            easting,
            northing,
            zone,
            northern,
        })
    }

    /// Project a geographic coordinate, picking the standard zone when
    /// `zone` is `None`.
    pub fn from_wgs84(lat_deg: f64, lon_deg: f64, zone: Option<u8>) -> Self {
        let zone = zone.unwrap_or_else(|| zone_for_longitude(lon_deg));
        let lon0 = central_meridian_deg(zone).to_radians();
        let phi = lat_deg.to_radians();
        let (e2, ep2) = (e2(), ep2());

        let sin_phi = phi.sin();
        let cos_phi = phi.cos();
        let tan_phi = phi.tan();
        let n = WGS84_A / (1.0 - e2 * sin_phi * sin_phi).sqrt();
        let t = tan_phi * tan_phi;
        let c = ep2 * cos_phi * cos_phi;
        let a = cos_phi * (lon_deg.to_radians() - lon0);
        let m = meridian_arc(phi);

        let easting = UTM_K0
            * n
            * (a + (1.0 - t + c) * a.powi(3) / 6.0
                + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a.powi(5) / 120.0)
            + FALSE_EASTING;
        let mut northing = UTM_K0
            * (m + n
                * tan_phi
                * (a * a / 2.0
                    + (5.0 - t + 9.0 * c + 4.0 * c * c) * a.powi(4) / 24.0
                    + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a.powi(6) / 720.0));
        let northern = lat_deg >= 0.0;
        if !northern {
            northing += FALSE_NORTHING_SOUTH;
        }
        Self {
            easting,
            northing,
            zone,
            northern,
        }
    }

    /// Inverse projection to (latitude, longitude) in degrees.
    pub fn to_wgs84(&self) -> (f64, f64) {
        let (e2, ep2) = (e2(), ep2());
        let x = self.easting - FALSE_EASTING;
        let y = if self.northern {
            self.northing
        } else {
            self.northing - FALSE_NORTHING_SOUTH
        };

        let m = y / UTM_K0;
        let mu = m / (WGS84_A * (1.0 - e2 / 4.0 - 3.0 * e2 * e2 / 64.0 - 5.0 * e2.powi(3) / 256.0));
        let sq = (1.0 - e2).sqrt();
        let e1 = (1.0 - sq) / (1.0 + sq);
        let phi1 = mu
            + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
            + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
            + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
            + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

        let sin1 = phi1.sin();
        let cos1 = phi1.cos();
        let tan1 = phi1.tan();
        let c1 = ep2 * cos1 * cos1;
        let t1 = tan1 * tan1;
        let w = 1.0 - e2 * sin1 * sin1;
        let n1 = WGS84_A / w.sqrt();
        let r1 = WGS84_A * (1.0 - e2) / w.powf(1.5);
        let d = x / (n1 * UTM_K0);

        let lat = phi1
            - (n1 * tan1 / r1)
                * (d * d / 2.0
                    - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d.powi(4) / 24.0
                    + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                        * d.powi(6)
                        / 720.0);
        let lon = (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
            + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1) * d.powi(5)
                / 120.0)
            / cos1;

        (
            lat.to_degrees(),
            central_meridian_deg(self.zone) + lon.to_degrees(),
        )
    }

    /// Point scale factor: grid distance divided by ground distance here.
    pub fn scale_factor(&self) -> f64 {
        let (lat, lon) = self.to_wgs84();
        let phi = lat.to_radians();
        let ep2 = ep2();
        let cos_phi = phi.cos();
        let t = phi.tan().powi(2);
        let c = ep2 * cos_phi * cos_phi;
        let a = cos_phi * (lon - central_meridian_deg(self.zone)).to_radians();
        UTM_K0
            * (1.0
                + (1.0 + c) * a * a / 2.0
                + (5.0 - 4.0 * t + 42.0 * c + 13.0 * c * c - 28.0 * ep2) * a.powi(4) / 24.0
                + (61.0 - 148.0 * t + 16.0 * t * t) * a.powi(6) / 720.0)
    }
}

pub fn zone_for_longitude(lon_deg: f64) -> u8 {
    let zone = ((lon_deg + 180.0) / 6.0).floor() as i64 + 1;
    zone.clamp(1, 60) as u8
}

fn central_meridian_deg(zone: u8) -> f64 {
    (zone as f64 - 1.0) * 6.0 - 180.0 + 3.0
}

fn meridian_arc(phi: f64) -> f64 {
    let e2 = e2();
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    WGS84_A
        * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
            - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
            + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
            - (35.0 * e6 / 3072.0) * (6.0 * phi).sin())
}

/// Ellipsoidal distance between two nearby points (metres).
///
/// Uses the meridional and prime-vertical radii at the mid latitude, which
/// is accurate to well under a millimetre for the sub-metre steps of a
/// velodrome table.
pub fn local_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let e2 = e2();
    let phi = ((lat1 + lat2) / 2.0).to_radians();
    let w = 1.0 - e2 * phi.sin().powi(2);
    let prime_vertical = WGS84_A / w.sqrt();
    let meridional = WGS84_A * (1.0 - e2) / w.powf(1.5);
    let dy = (lat2 - lat1).to_radians() * meridional;
    let dx = (lon2 - lon1).to_radians() * prime_vertical * phi.cos();
    dx.hypot(dy)
}
