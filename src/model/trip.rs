//! Trip Model
//!
//! This module defines the samples collected while driving and the immutable
//! trip record produced when a recording ends.

use crate::math::geo::{mean, path_length_km};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// One reading taken while a trip is active.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: OffsetDateTime,
    pub latitude: f64,
    pub longitude: f64,
    /// Fuel consumption in L/100 km.
    pub fuel_consumption: f64,
    /// Vehicle speed in km/h.
    pub speed: f64,
    /// Engine speed in 1/min.
    pub rpm: f64,
    /// Coolant temperature in °C, when the vehicle reports it.
    #[serde(default)]
    pub coolant_temperature: Option<f64>,
    /// Throttle position in percent.
    #[serde(default)]
    pub throttle_position: Option<f64>,
    /// Calculated engine load in percent.
    #[serde(default)]
    pub engine_load: Option<f64>,
}

impl Sample {
    pub fn new(
        timestamp: OffsetDateTime,
        latitude: f64,
        longitude: f64,
        fuel_consumption: f64,
        speed: f64,
        rpm: f64,
    ) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
            fuel_consumption,
            speed,
            rpm,
            coolant_temperature: None,
            throttle_position: None,
            engine_load: None,
        }
    }

    /// Attaches the optional engine readings.
    pub fn with_engine_state(
        mut self,
        coolant_temperature: Option<f64>,
        throttle_position: Option<f64>,
        engine_load: Option<f64>,
    ) -> Self {
        self.coolant_temperature = coolant_temperature;
        self.throttle_position = throttle_position;
        self.engine_load = engine_load;
        self
    }

    pub fn position(&self) -> [f64; 2] {
        [self.latitude, self.longitude]
    }
}

/// Summary values derived from a trip's samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TripStatistics {
    /// Total distance in km.
    pub distance_km: f64,
    /// Time between the first and the last sample.
    pub elapsed: Duration,
    /// Distance divided by elapsed time, km/h.
    pub avg_speed_kmh: f64,
    pub avg_rpm: f64,
    /// Mean consumption in L/100 km.
    pub avg_fuel_consumption: f64,
}

impl TripStatistics {
    /// Computes the statistics of a time-ordered sample sequence.
    pub fn from_samples(samples: &[Sample]) -> Self {
        let positions: Vec<[f64; 2]> = samples.iter().map(Sample::position).collect();
        let distance_km = path_length_km(&positions);
        let elapsed = match (samples.first(), samples.last()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp,
            _ => Duration::ZERO,
        };
        let hours = elapsed.as_seconds_f64() / 3600.0;
        let avg_speed_kmh = if hours > 0.0 { distance_km / hours } else { 0.0 };
        let rpms: Vec<f64> = samples.iter().map(|s| s.rpm).collect();
        let fuel: Vec<f64> = samples.iter().map(|s| s.fuel_consumption).collect();

        Self {
            distance_km,
            elapsed,
            avg_speed_kmh,
            avg_rpm: mean(&rpms),
            avg_fuel_consumption: mean(&fuel),
        }
    }
}

/// Scoring rule turning trip statistics into eco-points.
///
/// The rule is a business decision made outside this crate. Implementations
/// must be monotonic: more distance at equal efficiency, or better efficiency
/// at equal distance, never yields fewer points.
pub trait EcoPointsFormula: Send + Sync {
    fn score(&self, stats: &TripStatistics) -> f64;
}

impl<F> EcoPointsFormula for F
where
    F: Fn(&TripStatistics) -> f64 + Send + Sync,
{
    fn score(&self, stats: &TripStatistics) -> f64 {
        self(stats)
    }
}

/// Formula used until the scoring rule is supplied: every trip earns zero points.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEcoPoints;

impl EcoPointsFormula for NoEcoPoints {
    fn score(&self, _stats: &TripStatistics) -> f64 {
        0.0
    }
}

/// A finished trip. Read-only once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    id: Uuid,
    started_at: OffsetDateTime,
    samples: Vec<Sample>,
    statistics: TripStatistics,
    eco_points: f64,
}

impl Trip {
    pub(crate) fn finalize(
        id: Uuid,
        started_at: OffsetDateTime,
        samples: Vec<Sample>,
        formula: &dyn EcoPointsFormula,
    ) -> Self {
        let statistics = TripStatistics::from_samples(&samples);
        let eco_points = formula.score(&statistics);
        Self {
            id,
            started_at,
            samples,
            statistics,
            eco_points,
        }
    }

    pub fn id(&self) -> &Uuid {
        &self.id
    }

    pub fn started_at(&self) -> &OffsetDateTime {
        &self.started_at
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn statistics(&self) -> &TripStatistics {
        &self.statistics
    }

    pub fn distance_km(&self) -> f64 {
        self.statistics.distance_km
    }

    pub fn avg_speed_kmh(&self) -> f64 {
        self.statistics.avg_speed_kmh
    }

    pub fn avg_rpm(&self) -> f64 {
        self.statistics.avg_rpm
    }

    pub fn eco_points(&self) -> f64 {
        self.eco_points
    }
}
