//! # Geographic Utilities
//!
//! Distance primitives used by live tracking and route resolution.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_meters`] | Great-circle distance between two samples |
//! | [`haversine_points`] | Same, for bare coordinates |
//! | [`accumulate`] | Running total over a recorded route |
//! | [`compute_bounds`] | Bounding box of a coordinate list |
//! | [`round_coordinate`] | Snap a coordinate to ~1 m precision |
//!
//! ## Haversine Formula
//!
//! Distances assume a spherical Earth of radius 6,371,000 m. This is accurate to
//! within about 0.3% for GPS-scale trajectories, which is well inside the noise of
//! consumer receivers.
//!
//! All functions expect WGS84 coordinates in degrees.

use geo::{BoundingRect, Coord, LineString};

use crate::{Bounds, GpsPoint, LocationSample};

/// Earth radius used for all great-circle distances.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Decimal places kept when keying coordinates (~1.1 m at the equator).
pub const COORDINATE_PRECISION: i32 = 5;

/// Address recorded for synthesized samples.
pub const PLACEHOLDER_ADDRESS: &str = "Location unavailable";

// =============================================================================
// Distance Functions
// =============================================================================

/// Great-circle distance in meters between two samples.
///
/// Symmetric, and zero when both samples share a position.
///
/// ```rust
/// use route_tracker::{geo_utils, LocationSample};
/// use chrono::Utc;
///
/// let now = Utc::now();
/// let a = LocationSample::new(28.6139, 77.2090, now);
/// let b = LocationSample::new(28.7041, 77.1025, now);
/// let d = geo_utils::haversine_meters(&a, &b);
/// assert!((d - 14_442.0).abs() < 145.0); // within 1%
/// ```
#[inline]
pub fn haversine_meters(a: &LocationSample, b: &LocationSample) -> f64 {
    haversine_points(&a.point(), &b.point())
}

/// Great-circle distance in meters between two coordinates.
#[inline]
pub fn haversine_points(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let lat1 = p1.latitude.to_radians();
    let lat2 = p2.latitude.to_radians();
    let dlat = (p2.latitude - p1.latitude).to_radians();
    let dlng = (p2.longitude - p1.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);

    // Clamp guards against h drifting past 1.0 for antipodal points
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Sum of pairwise distances over consecutive samples.
///
/// Empty and single-sample routes are 0.
pub fn accumulate(history: &[LocationSample]) -> f64 {
    history
        .windows(2)
        .map(|w| haversine_meters(&w[0], &w[1]))
        .sum()
}

/// Total length of a coordinate polyline in meters.
pub fn polyline_length(points: &[GpsPoint]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_points(&w[0], &w[1]))
        .sum()
}

// =============================================================================
// Bounds and Keys
// =============================================================================

/// Bounding box of a coordinate list, `None` when empty.
pub fn compute_bounds(points: &[GpsPoint]) -> Option<Bounds> {
    let line: LineString<f64> = points
        .iter()
        .map(|p| Coord {
            x: p.longitude,
            y: p.latitude,
        })
        .collect();

    line.bounding_rect().map(|rect| Bounds {
        min_lat: rect.min().y,
        max_lat: rect.max().y,
        min_lng: rect.min().x,
        max_lng: rect.max().x,
    })
}

/// Fixed-point representation of a coordinate at [`COORDINATE_PRECISION`].
///
/// Two coordinates that differ by less than ~1 m map to the same value.
#[inline]
pub fn round_coordinate(value: f64) -> i64 {
    (value * 10f64.powi(COORDINATE_PRECISION)).round() as i64
}

/// Human-readable fallback address for a raw coordinate.
pub fn coordinate_address(lat: f64, lng: f64) -> String {
    format!("{:.5}, {:.5}", lat, lng)
}
