//! Geo and Trip Statistics Computation
//!
//! This module contains the distance and averaging functions used when a trip
//! is finalized.

use crate::core::constants::EARTH_RADIUS_KM;
use log::trace;
use nalgebra::DVector;

/// Whether `[latitude, longitude]` is a finite coordinate within ±90/±180 degrees.
pub fn is_valid_position([latitude, longitude]: [f64; 2]) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && latitude.abs() <= 90.0
        && longitude.abs() <= 180.0
}

/// `haversine_km` function.
///
/// Calculates the great-circle distance between two coordinates.
///
/// # Arguments
/// - `from`: `[latitude, longitude]` in degrees.
/// - `to`: `[latitude, longitude]` in degrees.
///
/// # Returns
/// Distance in kilometres.
pub fn haversine_km(from: [f64; 2], to: [f64; 2]) -> f64 {
    let d_lat = (to[0] - from[0]).to_radians();
    let d_lon = (to[1] - from[1]).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + from[0].to_radians().cos() * to[0].to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// `path_length_km` function.
///
/// Sums the great-circle distances between consecutive points.
pub fn path_length_km(points: &[[f64; 2]]) -> f64 {
    let total = points
        .windows(2)
        .map(|pair| haversine_km(pair[0], pair[1]))
        .sum();
    trace!("Path of {} points is {} km long", points.len(), total);
    total
}

/// `mean` function.
///
/// Arithmetic mean of the values, `0.0` for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    DVector::from_row_slice(values).mean()
}
