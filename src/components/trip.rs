use crate::{
    api::model::TripModelApi,
    core::{error::TripError, events::AppEvent},
    model::trip::{EcoPointsFormula, NoEcoPoints, Sample, Trip},
};
use log::{info, trace};
use std::{fmt, sync::Arc};
use time::OffsetDateTime;
use tokio::sync::broadcast::Sender;
use uuid::Uuid;

/// The trip currently being recorded.
#[derive(Debug)]
struct ActiveTrip {
    id: Uuid,
    started_at: OffsetDateTime,
    samples: Vec<Sample>,
}

/// Collects samples into trips and finalizes them.
pub struct TripAggregator {
    event_bus: Sender<AppEvent>,
    formula: Arc<dyn EcoPointsFormula>,
    active: Option<ActiveTrip>,
    last_trip: Option<Arc<Trip>>,
}

impl fmt::Debug for TripAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TripAggregator")
            .field("active", &self.active)
            .field("last_trip", &self.last_trip.as_ref().map(|t| *t.id()))
            .finish()
    }
}

impl TripAggregator {
    /// Creates an aggregator that awards no eco-points until a formula is set.
    pub fn new(event_bus: Sender<AppEvent>) -> Self {
        Self::with_formula(event_bus, Arc::new(NoEcoPoints))
    }

    pub fn with_formula(event_bus: Sender<AppEvent>, formula: Arc<dyn EcoPointsFormula>) -> Self {
        Self {
            event_bus,
            formula,
            active: None,
            last_trip: None,
        }
    }

    /// Begins a new trip.
    pub fn start(&mut self) -> Result<(), TripError> {
        if self.active.is_some() {
            return Err(TripError::AlreadyRecording);
        }
        let trip = ActiveTrip {
            id: Uuid::new_v4(),
            started_at: OffsetDateTime::now_utc(),
            samples: Vec::new(),
        };
        info!("Trip {} started", trip.id);
        self.active = Some(trip);
        Ok(())
    }

    /// Appends a sample to the active trip.
    ///
    /// Samples must arrive in non-decreasing timestamp order.
    pub fn add_sample(&mut self, sample: Sample) -> Result<(), TripError> {
        let trip = self.active.as_mut().ok_or(TripError::NotRecording)?;
        if let Some(previous) = trip.samples.last() {
            if sample.timestamp < previous.timestamp {
                return Err(TripError::OutOfOrder);
            }
        }
        trace!("Sample {:?}", sample);
        trip.samples.push(sample);
        let _ = self.event_bus.send(AppEvent::SampleRecorded(sample));
        Ok(())
    }

    /// Finalizes the active trip. The returned record is immutable.
    pub fn stop(&mut self) -> Result<Arc<Trip>, TripError> {
        let active = self.active.take().ok_or(TripError::NotRecording)?;
        let trip = Arc::new(Trip::finalize(
            active.id,
            active.started_at,
            active.samples,
            self.formula.as_ref(),
        ));
        info!(
            "Trip {} finished: {} samples, {:.3} km, {:.1} eco-points",
            trip.id(),
            trip.samples().len(),
            trip.distance_km(),
            trip.eco_points()
        );
        self.last_trip = Some(trip.clone());
        let _ = self.event_bus.send(AppEvent::TripFinished(trip.clone()));
        Ok(trip)
    }
}

impl TripModelApi for TripAggregator {
    fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    fn get_samples(&self) -> &[Sample] {
        self.active
            .as_ref()
            .map(|trip| trip.samples.as_slice())
            .unwrap_or_default()
    }

    fn get_last_trip(&self) -> Option<Arc<Trip>> {
        self.last_trip.clone()
    }
}
