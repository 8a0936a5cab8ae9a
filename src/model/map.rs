//! Map Model
//!
//! Data handed to the external map layer: coloured polyline nodes, one per
//! trip sample.

use serde::{Deserialize, Serialize};

/// Colour of a track segment, derived from the fuel consumption at its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorTag {
    Green,
    Yellow,
    Red,
    Black,
}

impl ColorTag {
    /// Classifies a consumption value in L/100 km.
    pub fn for_fuel_consumption(l_per_100km: f64) -> Self {
        if l_per_100km <= 6.0 {
            ColorTag::Green
        } else if l_per_100km <= 12.0 {
            ColorTag::Yellow
        } else if l_per_100km <= 20.0 {
            ColorTag::Red
        } else {
            ColorTag::Black
        }
    }
}

/// One point of a map track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolylineNode {
    color: ColorTag,
    latitude: f64,
    longitude: f64,
    fuel_consumption: f64,
}

impl PolylineNode {
    pub(crate) fn new(color: ColorTag, latitude: f64, longitude: f64, fuel_consumption: f64) -> Self {
        Self {
            color,
            latitude,
            longitude,
            fuel_consumption,
        }
    }

    pub fn color(&self) -> ColorTag {
        self.color
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn fuel_consumption(&self) -> f64 {
        self.fuel_consumption
    }
}

/// A drawable line between two consecutive nodes, coloured by the first one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrackSegment {
    pub color: ColorTag,
    pub from: [f64; 2],
    pub to: [f64; 2],
}
