//! Great-circle distance and bearing on a spherical Earth
//!
//! Both functions are stateless and deterministic. Distances use the
//! haversine formula with a mean Earth radius, which is well below a meter of
//! error at the ranges a LoRa link covers.

use crate::core::EARTH_RADIUS_M;

/// Haversine distance between two points (meters)
pub fn distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (dlon / 2.0).sin().powi(2);
    // Rounding can push `a` a hair outside [0, 1] for antipodal points
    let a = a.clamp(0.0, 1.0);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Initial bearing from point 1 to point 2 (degrees, [0, 360))
///
/// Identical points have no defined course; 0 is returned.
pub fn bearing(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let y = dlon.sin() * lat2_rad.cos();
    let x = lat1_rad.cos() * lat2_rad.sin() - lat1_rad.sin() * lat2_rad.cos() * dlon.cos();

    if y == 0.0 && x == 0.0 {
        return 0.0;
    }

    let degrees = (y.atan2(x).to_degrees() + 360.0) % 360.0;
    // -0.0 + 360 can round to exactly 360
    if degrees >= 360.0 {
        0.0
    } else {
        degrees
    }
}

/// 16-point compass label for a bearing
pub fn cardinal_direction(bearing_deg: f64) -> &'static str {
    const POINTS: [&str; 16] = [
        "N", "NNE", "NE", "ENE", "E", "ESE", "SE", "SSE", "S", "SSW", "SW", "WSW", "W", "WNW",
        "NW", "NNW",
    ];
    let index = (bearing_deg.rem_euclid(360.0) / 22.5).round() as usize % 16;
    POINTS[index]
}

/// Output style for [`format_coordinates`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateFormat {
    /// `51.507400, -0.127800`
    Decimal,
    /// `51° 30' 26.64" N, 0° 7' 40.08" W`
    DegreesMinutesSeconds,
}

/// Render a coordinate pair for logs and status output
pub fn format_coordinates(lat: f64, lon: f64, format: CoordinateFormat) -> String {
    match format {
        CoordinateFormat::Decimal => format!("{:.6}, {:.6}", lat, lon),
        CoordinateFormat::DegreesMinutesSeconds => {
            let lat_dir = if lat >= 0.0 { "N" } else { "S" };
            let lon_dir = if lon >= 0.0 { "E" } else { "W" };
            format!("{} {}, {} {}", to_dms(lat), lat_dir, to_dms(lon), lon_dir)
        }
    }
}

fn to_dms(coord: f64) -> String {
    let abs = coord.abs();
    let degrees = abs.trunc();
    let minutes_float = (abs - degrees) * 60.0;
    let minutes = minutes_float.trunc();
    let seconds = (minutes_float - minutes) * 60.0;
    format!("{}° {}' {:.2}\"", degrees as u32, minutes as u32, seconds)
}
