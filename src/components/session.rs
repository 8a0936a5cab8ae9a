//! Trip Session
//!
//! Wires the link, the dispatcher, the trip aggregator and the map track into
//! one recording loop. Samples are polled from the adapter on a fixed
//! interval; the aggregator and the track are written only from here.
use crate::{
    api::{
        controller::{LinkOpener, PositionSource, RecordingApi},
        model::{ModelHandle, TripModelApi},
    },
    components::{
        connection::ConnectionManager, dispatcher::CommandDispatcher, track::MapTrackBuilder,
        trip::TripAggregator,
    },
    core::{config::AppConfig, error::TripError, events::AppEvent},
    math::geo::{haversine_km, is_valid_position},
    model::{
        map::ColorTag,
        obd::{consumption_per_100km, fuel_rate_from_maf, DeviceDescriptor, Pid},
        trip::{EcoPointsFormula, Sample, Trip},
        user::User,
    },
};
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::{future::Future, sync::Arc, time::Duration};
use time::OffsetDateTime;
use tokio::sync::{broadcast::Sender, RwLock};
use tokio::time::MissedTickBehavior;

/// Position source for setups without a GNSS receiver: always reports the
/// same coordinate.
#[derive(Debug, Clone, Copy)]
pub struct FixedPosition(pub [f64; 2]);

#[async_trait]
impl PositionSource for FixedPosition {
    async fn current_position(&mut self) -> Option<[f64; 2]> {
        Some(self.0)
    }
}

pub struct TripSession<O: LinkOpener, P: PositionSource> {
    event_bus: Sender<AppEvent>,
    connection: Arc<ConnectionManager<O>>,
    dispatcher: Arc<CommandDispatcher>,
    trips: ModelHandle<TripAggregator>,
    track: ModelHandle<MapTrackBuilder>,
    user: ModelHandle<User>,
    positions: P,
    last_position: [f64; 2],
    min_track_distance_m: f64,
    /// `0100` support mask, zero until read.
    supported_pids: u32,
    fuel_rate_supported: bool,
}

impl<O: LinkOpener, P: PositionSource> TripSession<O, P> {
    pub fn new(
        opener: O,
        positions: P,
        user: User,
        event_bus: Sender<AppEvent>,
        config: &AppConfig,
    ) -> Self {
        let connection = Arc::new(ConnectionManager::new(
            opener,
            event_bus.clone(),
            config.connect_timeout(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            connection.as_ref(),
            config.command_timeout(),
        ));
        Self {
            trips: Arc::new(RwLock::new(TripAggregator::new(event_bus.clone()))),
            event_bus,
            connection,
            dispatcher,
            track: Arc::new(RwLock::new(MapTrackBuilder::new())),
            user: Arc::new(RwLock::new(user)),
            positions,
            last_position: [config.start_latitude, config.start_longitude],
            min_track_distance_m: config.min_track_distance_m,
            supported_pids: 0,
            fuel_rate_supported: false,
        }
    }

    /// Replaces the scoring rule used for trips finished from now on.
    #[allow(dead_code)]
    pub fn with_eco_points_formula(mut self, formula: Arc<dyn EcoPointsFormula>) -> Self {
        self.trips = Arc::new(RwLock::new(TripAggregator::with_formula(
            self.event_bus.clone(),
            formula,
        )));
        self
    }

    pub fn connection(&self) -> &Arc<ConnectionManager<O>> {
        &self.connection
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn trips(&self) -> &ModelHandle<TripAggregator> {
        &self.trips
    }

    pub fn track(&self) -> &ModelHandle<MapTrackBuilder> {
        &self.track
    }

    pub fn user(&self) -> &ModelHandle<User> {
        &self.user
    }

    /// Connects to `device` and brings the adapter into a known state.
    pub async fn connect(&mut self, device: DeviceDescriptor) -> Result<()> {
        self.connection.connect(device).await?;
        self.dispatcher.initialize_adapter().await?;
        if let Some(version) = self.dispatcher.result("ATZ").await {
            info!("Adapter: {}", version);
        }
        self.supported_pids = match self.dispatcher.supported_pids().await {
            Ok(mask) => {
                for pid in [Pid::EngineRpm, Pid::VehicleSpeed, Pid::MafAirFlow] {
                    if !pid.is_supported_by(mask) {
                        warn!("{} is not supported by the vehicle", pid);
                    }
                }
                mask
            }
            Err(e) => {
                warn!("Reading supported PIDs failed: {}", e);
                0
            }
        };
        self.fuel_rate_supported = self.dispatcher.query(Pid::EngineFuelRate).await.is_ok();
        info!(
            "Fuel flow source: {}",
            if self.fuel_rate_supported {
                "fuel rate"
            } else {
                "mass air flow"
            }
        );
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Reads one sample from the adapter and records it.
    ///
    /// A position fix that is not a valid coordinate is ignored and the last
    /// known position is used instead, so trip and track stay consistent.
    pub async fn poll_once(&mut self) -> Result<Sample> {
        if !self.trips.read().await.is_recording() {
            return Err(TripError::NotRecording.into());
        }
        let rpm = self.dispatcher.query(Pid::EngineRpm).await?;
        let speed = self.dispatcher.query(Pid::VehicleSpeed).await?;
        let fuel_rate = if self.fuel_rate_supported {
            self.dispatcher.query(Pid::EngineFuelRate).await?
        } else {
            fuel_rate_from_maf(self.dispatcher.query(Pid::MafAirFlow).await?)
        };
        let coolant = self.query_supported(Pid::CoolantTemperature).await;
        let throttle = self.query_supported(Pid::ThrottlePosition).await;
        let load = self.query_supported(Pid::EngineLoad).await;
        match self.positions.current_position().await {
            Some(position) if is_valid_position(position) => self.last_position = position,
            Some([latitude, longitude]) => {
                warn!("Ignoring invalid position ({}, {})", latitude, longitude)
            }
            None => {}
        }
        let [latitude, longitude] = self.last_position;
        let sample = Sample::new(
            OffsetDateTime::now_utc(),
            latitude,
            longitude,
            consumption_per_100km(fuel_rate, speed),
            speed,
            rpm,
        )
        .with_engine_state(coolant, throttle, load);
        self.trips.write().await.add_sample(sample)?;
        self.extend_track(&sample).await?;
        Ok(sample)
    }

    /// Reads an optional parameter if the vehicle flags it as supported.
    async fn query_supported(&self, pid: Pid) -> Option<f64> {
        if !pid.is_supported_by(self.supported_pids) {
            return None;
        }
        match self.dispatcher.query(pid).await {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Reading {} failed: {}", pid, e);
                None
            }
        }
    }

    async fn extend_track(&self, sample: &Sample) -> Result<()> {
        let mut track = self.track.write().await;
        let moved = track
            .last_position()
            .map(|last| haversine_km(last, sample.position()) * 1000.0 >= self.min_track_distance_m)
            .unwrap_or(true);
        if moved {
            track.append(
                sample.latitude,
                sample.longitude,
                sample.fuel_consumption,
                ColorTag::for_fuel_consumption(sample.fuel_consumption),
            )?;
        }
        Ok(())
    }

    /// Records a trip, polling every `interval` until `shutdown` resolves.
    ///
    /// Sampling errors are logged and the loop carries on; the caller
    /// decides whether to reconnect after a lost link.
    pub async fn run<F>(&mut self, interval: Duration, shutdown: F) -> Result<Arc<Trip>>
    where
        F: Future<Output = ()>,
    {
        self.start_recording().await?;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => match self.poll_once().await {
                    Ok(sample) => {
                        let recorded = self.trips.read().await.get_samples().len();
                        debug!(
                            "#{}: {:.0} rpm, {:.0} km/h, {:.1} l/100km",
                            recorded, sample.rpm, sample.speed, sample.fuel_consumption
                        );
                    }
                    Err(e) => warn!("Sampling failed: {:#}", e),
                },
            }
        }
        self.stop_recording().await
    }
}

#[async_trait]
impl<O: LinkOpener, P: PositionSource> RecordingApi for TripSession<O, P> {
    async fn start_recording(&mut self) -> Result<()> {
        self.track.write().await.clear();
        self.trips.write().await.start()?;
        Ok(())
    }

    async fn stop_recording(&mut self) -> Result<Arc<Trip>> {
        let trip = self.trips.write().await.stop()?;
        self.user.write().await.record_trip(&trip);
        Ok(trip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::controller::MockPositionSource;
    use crate::api::model::{ConnectionModelApi, TrackModelApi, TripModelApi};
    use crate::components::simulator::{SimulatedAdapter, SimulatedElm327, VehicleProfile};
    use crate::core::error::{CommandError, TripError};
    use crate::model::obd::ConnectionState;
    use crate::model::trip::TripStatistics;
    use tokio::sync::broadcast;

    fn steady_adapter() -> SimulatedAdapter {
        SimulatedAdapter::new(SimulatedElm327::new(VehicleProfile {
            jitter: 0.0,
            ..Default::default()
        }))
    }

    fn positions(fixes: Vec<[f64; 2]>) -> MockPositionSource {
        let mut fixes = fixes.into_iter();
        let mut source = MockPositionSource::new();
        source
            .expect_current_position()
            .returning(move || fixes.next());
        source
    }

    fn session(
        fixes: Vec<[f64; 2]>,
    ) -> TripSession<SimulatedAdapter, MockPositionSource> {
        let (tx, _rx) = broadcast::channel(256);
        TripSession::new(
            steady_adapter(),
            positions(fixes),
            User::new(1, "driver", "secret", 0.0),
            tx,
            &AppConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_recorded_trip() {
        let mut session = session(vec![[48.2, 16.3], [48.21, 16.31]]);
        session.connect(SimulatedAdapter::device()).await.unwrap();
        session.start_recording().await.unwrap();

        let first = session.poll_once().await.unwrap();
        let second = session.poll_once().await.unwrap();
        assert_eq!(first.rpm, 1900.0);
        assert_eq!(first.speed, 45.0);
        let expected = consumption_per_100km(fuel_rate_from_maf(7.5), 45.0);
        assert!((first.fuel_consumption - expected).abs() < 1e-9);
        assert!(second.timestamp >= first.timestamp);
        assert_eq!(session.track().read().await.get_nodes().len(), 2);

        let trip = session.stop_recording().await.unwrap();
        assert_eq!(trip.samples().len(), 2);
        assert!(trip.distance_km() > 1.0);
        assert_eq!(trip.avg_rpm(), 1900.0);

        let user = session.user().read().await;
        assert_eq!(user.stats.trips, 1);
        assert!((user.stats.distance_km - trip.distance_km()).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_standing_still_adds_one_node() {
        let mut session = session(vec![[48.2, 16.3], [48.2, 16.3], [48.2, 16.3]]);
        session.connect(SimulatedAdapter::device()).await.unwrap();
        session.start_recording().await.unwrap();
        for _ in 0..3 {
            session.poll_once().await.unwrap();
        }
        assert_eq!(session.trips().read().await.get_samples().len(), 3);
        assert_eq!(session.track().read().await.get_nodes().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_fix_reuses_last_position() {
        let mut session = session(vec![]);
        session.connect(SimulatedAdapter::device()).await.unwrap();
        session.start_recording().await.unwrap();
        let sample = session.poll_once().await.unwrap();
        let config = AppConfig::default();
        assert_eq!(
            sample.position(),
            [config.start_latitude, config.start_longitude]
        );
    }

    #[tokio::test]
    async fn test_invalid_fix_keeps_trip_and_track_consistent() {
        let mut session = session(vec![[48.2, 16.3], [f64::NAN, 16.3], [95.0, 16.3]]);
        session.connect(SimulatedAdapter::device()).await.unwrap();
        session.start_recording().await.unwrap();

        for _ in 0..3 {
            let sample = session.poll_once().await.unwrap();
            assert_eq!(sample.position(), [48.2, 16.3]);
        }
        assert_eq!(session.track().read().await.get_nodes().len(), 1);

        let trip = session.stop_recording().await.unwrap();
        assert_eq!(trip.samples().len(), 3);
        assert_eq!(trip.distance_km(), 0.0);
        let user = session.user().read().await;
        assert!(user.stats.distance_km.is_finite());
        assert!(user.stats.avg_speed_kmh.is_finite());
    }

    #[tokio::test]
    async fn test_sample_carries_supported_engine_state() {
        let mut session = session(vec![[48.2, 16.3]]);
        session.connect(SimulatedAdapter::device()).await.unwrap();
        session.start_recording().await.unwrap();

        let sample = session.poll_once().await.unwrap();
        assert_eq!(sample.coolant_temperature, Some(88.0));
        let throttle = sample.throttle_position.unwrap();
        assert!((throttle - 18.0).abs() < 0.5, "throttle was {}", throttle);
        let load = sample.engine_load.unwrap();
        assert!((load - 35.0).abs() < 0.5, "load was {}", load);
    }

    #[tokio::test]
    async fn test_unsupported_engine_state_is_not_queried() {
        let elm = SimulatedElm327::new(VehicleProfile {
            jitter: 0.0,
            ..Default::default()
        })
        .with_response("0100", "41 00 00 19 00 00")
        .with_silent("0105")
        .with_silent("0111")
        .with_silent("0104");
        let (tx, _rx) = broadcast::channel(256);
        let mut session = TripSession::new(
            SimulatedAdapter::new(elm),
            positions(vec![[48.2, 16.3]]),
            User::new(1, "driver", "secret", 0.0),
            tx,
            &AppConfig::default(),
        );
        session.connect(SimulatedAdapter::device()).await.unwrap();
        session.start_recording().await.unwrap();

        let started = tokio::time::Instant::now();
        let sample = session.poll_once().await.unwrap();
        assert_eq!(sample.coolant_temperature, None);
        assert_eq!(sample.throttle_position, None);
        assert_eq!(sample.engine_load, None);
        // silent requests would have cost a command timeout each
        assert!(started.elapsed() < AppConfig::default().command_timeout());
    }

    #[tokio::test]
    async fn test_poll_without_trip() {
        let mut session = session(vec![[48.2, 16.3]]);
        session.connect(SimulatedAdapter::device()).await.unwrap();
        let err = session.poll_once().await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<TripError>(),
            Some(&TripError::NotRecording)
        );
    }

    #[tokio::test]
    async fn test_samples_survive_link_loss() {
        let mut session = session(vec![[48.2, 16.3], [48.21, 16.31]]);
        session.connect(SimulatedAdapter::device()).await.unwrap();
        session.start_recording().await.unwrap();
        session.poll_once().await.unwrap();

        session.disconnect().await;
        assert_eq!(
            session.connection().get_state(),
            ConnectionState::Disconnected
        );
        let err = session.poll_once().await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<CommandError>(),
            Some(&CommandError::NotConnected)
        );

        let trip = session.stop_recording().await.unwrap();
        assert_eq!(trip.samples().len(), 1);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let fixes = (0..100).map(|i| [48.2 + i as f64 * 0.0001, 16.3]).collect();
        let mut session = session(fixes)
            .with_eco_points_formula(Arc::new(|stats: &TripStatistics| stats.distance_km));
        session.connect(SimulatedAdapter::device()).await.unwrap();

        let trip = session
            .run(
                Duration::from_millis(10),
                tokio::time::sleep(Duration::from_millis(60)),
            )
            .await
            .unwrap();
        assert!(!trip.samples().is_empty());
        assert_eq!(trip.eco_points(), trip.distance_km());
        assert!(!session.trips().read().await.is_recording());
        assert_eq!(session.user().read().await.eco_points, trip.eco_points());
    }

    #[tokio::test]
    async fn test_fuel_rate_preferred_over_maf() {
        let elm = SimulatedElm327::new(VehicleProfile {
            jitter: 0.0,
            ..Default::default()
        })
        .with_response("015E", "41 5E 00 64")
        .with_silent("0110");
        let (tx, _rx) = broadcast::channel(256);
        let mut session = TripSession::new(
            SimulatedAdapter::new(elm),
            positions(vec![[48.2, 16.3]]),
            User::new(1, "driver", "secret", 0.0),
            tx,
            &AppConfig::default(),
        );
        session.connect(SimulatedAdapter::device()).await.unwrap();
        session.start_recording().await.unwrap();

        let sample = session.poll_once().await.unwrap();
        assert!((sample.fuel_consumption - 5.0 * 100.0 / 45.0).abs() < 1e-9);
    }
}
