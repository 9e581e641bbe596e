pub mod polyline;

pub use polyline::decode_polyline;

use crate::types::GeoPoint;

/// Mean Earth radius used for all great-circle distances (meters)
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two coordinates in meters (haversine).
pub fn haversine_distance(a: GeoPoint, b: GeoPoint) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).max(0.0).sqrt());
    EARTH_RADIUS_M * c
}

/// Sum of consecutive-point distances along a path.
pub fn path_length(points: &[GeoPoint]) -> f64 {
    points
        .windows(2)
        .map(|pair| haversine_distance(pair[0], pair[1]))
        .sum()
}

/// Linear interpolation between two coordinates, `t` in [0, 1].
pub fn lerp(a: GeoPoint, b: GeoPoint, t: f64) -> GeoPoint {
    let t = t.clamp(0.0, 1.0);
    GeoPoint::new(a.lat + (b.lat - a.lat) * t, a.lng + (b.lng - a.lng) * t)
}

/// Position along a route for a progress fraction.
///
/// The bounding segment index is `floor(progress * (n - 1))`; the position is
/// interpolated linearly inside that segment. This is index-based, not
/// distance-based, so uneven segment lengths yield uneven speeds.
pub fn interpolate_route(points: &[GeoPoint], progress: f64) -> Option<GeoPoint> {
    match points.len() {
        0 => None,
        1 => Some(points[0]),
        n => {
            let scaled = progress.clamp(0.0, 1.0) * (n - 1) as f64;
            let index = (scaled.floor() as usize).min(n - 2);
            let local = scaled - index as f64;
            Some(lerp(points[index], points[index + 1], local))
        }
    }
}
