//! EcoPoints Trip Recorder
//!
//! Connects to an ELM327 OBD adapter, polls engine and vehicle data while
//! driving and turns the readings into trips with distance, averages and
//! eco-points, plus a fuel-colored map track.

use crate::api::controller::{LinkOpener, PositionSource};
use crate::api::model::{ConnectionModelApi, TrackModelApi, TripModelApi};
use crate::components::session::TripSession;
use crate::core::{config::AppConfig, events::AppEvent};
use crate::model::{
    obd::{ConnectionState, DeviceDescriptor},
    user::User,
};
use anyhow::{anyhow, Result};
use env_logger::Env;
use log::{debug, error, info, trace, warn};
use tokio::runtime::Runtime;
use tokio::sync::broadcast::{self, error::RecvError};

/// Traits at the seams between components.
mod api {
    /// Mutating APIs and transport traits.
    pub mod controller;
    /// Read only model APIs.
    pub mod model;
}

/// Stateful building blocks of the trip core.
mod components {
    /// BLE adapter discovery and link opening.
    pub mod bluetooth;
    /// Adapter link lifecycle.
    pub mod connection;
    /// Command/response exchange with the adapter.
    pub mod dispatcher;
    /// Recording loop wiring all components.
    pub mod session;
    /// Emulated adapter and route.
    #[cfg(any(test, feature = "mock"))]
    pub mod simulator;
    /// Map track of the active trip.
    pub mod track;
    /// Trip recording and finalization.
    pub mod trip;
}

/// Core utilities used throughout the application.
mod core {
    /// Application configuration.
    pub mod config;
    /// Application-wide constants.
    pub mod constants;
    /// Error types.
    pub mod error;
    /// Event system for inter-module communication.
    pub mod events;
}

/// Geo math and statistics.
mod math {
    pub mod geo;
}

/// Data models representing the application's domain.
mod model {
    /// Map track nodes and colors.
    pub mod map;
    /// Adapter protocol: devices, commands, responses.
    pub mod obd;
    /// Samples and trips.
    pub mod trip;
    /// User profile and ranking cards.
    pub mod user;
}

/// Capacity of the application event bus.
const EVENT_BUS_CAPACITY: usize = 256;

/// Main entry point of the application.
///
/// Initializes logging, loads the configuration and records one trip on a
/// Tokio runtime.
fn main() {
    env_logger::Builder::from_env(
        Env::default()
            .filter_or("ECOPOINTS_LOG_LEVEL", "info")
            .write_style_or("ECOPOINTS_LOG_STYLE", "always"),
    )
    .init();

    let rt = Runtime::new().expect("Unable to create Runtime");
    if let Err(e) = rt.block_on(run()) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = AppConfig::load()?;
    let (event_bus, _) = broadcast::channel(EVENT_BUS_CAPACITY);
    tokio::spawn(log_events(event_bus.subscribe()));
    record_with_transport(&config, event_bus).await
}

/// Records a trip against the emulated adapter on a random route.
#[cfg(feature = "mock")]
async fn record_with_transport(
    config: &AppConfig,
    event_bus: broadcast::Sender<AppEvent>,
) -> Result<()> {
    use crate::components::simulator::{SimulatedAdapter, SimulatedRoute};

    let start = [config.start_latitude, config.start_longitude];
    record(
        config,
        SimulatedAdapter::default(),
        SimulatedRoute::new(start, 12.0),
        SimulatedAdapter::device(),
        event_bus,
    )
    .await
}

/// Records a trip against the first BLE OBD adapter found on the first
/// Bluetooth adapter.
#[cfg(not(feature = "mock"))]
async fn record_with_transport(
    config: &AppConfig,
    event_bus: broadcast::Sender<AppEvent>,
) -> Result<()> {
    use crate::api::controller::BluetoothApi;
    use crate::api::model::BluetoothModelApi;
    use crate::components::{bluetooth::BluetoothComponent, session::FixedPosition};
    use btleplug::platform::Adapter;

    let mut bluetooth = BluetoothComponent::<Adapter>::new(&config.device_name_filter);
    bluetooth.discover_adapters().await?;
    let adapter = bluetooth
        .get_adapters()
        .first()
        .cloned()
        .ok_or(anyhow!("no bluetooth adapter found"))?;
    bluetooth.select_adapter(adapter).await?;
    if let Some(selected) = bluetooth.get_selected_adapter() {
        info!("Scanning for '{}' on {}", config.device_name_filter, selected.get_name());
    }

    let deadline = tokio::time::Instant::now() + config.connect_timeout();
    let device = loop {
        if let Some(device) = bluetooth.get_devices().read().await.first().cloned() {
            break device;
        }
        if !bluetooth.is_scanning() || tokio::time::Instant::now() >= deadline {
            return Err(anyhow!(
                "no device matching '{}' found",
                config.device_name_filter
            ));
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    };
    bluetooth.stop_scan().await?;

    let positions = FixedPosition([config.start_latitude, config.start_longitude]);
    record(config, bluetooth.link_opener()?, positions, device, event_bus).await
}

/// Records one trip on `device` until it is stopped or the link fails.
async fn record<O: LinkOpener, P: PositionSource>(
    config: &AppConfig,
    opener: O,
    positions: P,
    device: DeviceDescriptor,
    event_bus: broadcast::Sender<AppEvent>,
) -> Result<()> {
    let mut session = TripSession::new(
        opener,
        positions,
        User::new(0, "local", "", 0.0),
        event_bus,
        config,
    );
    session.connect(device).await?;

    let trip_duration = config.trip_duration();
    let mut states = session.connection().subscribe();
    let shutdown = async move {
        let elapsed = async {
            match trip_duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };
        // no automatic reconnect: a failed link ends the trip
        let link_failed = async {
            if states
                .wait_for(|state| *state == ConnectionState::Failed)
                .await
                .is_err()
            {
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Stopping on Ctrl-C"),
            _ = elapsed => info!("Trip duration reached"),
            _ = link_failed => warn!("Link to the adapter failed, finishing the trip"),
        }
    };
    info!("Recording, press Ctrl-C to stop");
    session.run(config.poll_interval(), shutdown).await?;
    debug!("Adapter responses: {:?}", session.dispatcher().results().await);
    let link_state = session.connection().get_state();
    session.disconnect().await;

    let trip = session
        .trips()
        .read()
        .await
        .get_last_trip()
        .ok_or_else(|| anyhow!("no trip was recorded"))?;
    info!(
        "Trip {} started at {} (link {})",
        trip.id(),
        trip.started_at(),
        link_state
    );
    info!(
        "Trip statistics: {}",
        serde_json::to_string_pretty(trip.statistics())?
    );
    {
        let track = session.track().read().await;
        let peak = track
            .get_nodes()
            .iter()
            .map(|node| node.fuel_consumption())
            .fold(0.0, f64::max);
        info!(
            "Map track: {} nodes, {} segments, peak {:.1} l/100km",
            track.get_nodes().len(),
            track.get_segments().len(),
            peak
        );
    }
    for group in session.user().read().await.ranking_cards() {
        let [first, second] = &group.cards;
        info!(
            "{:?}: {} {} | {} {}",
            group.category, first.label, first.value, second.label, second.value
        );
    }
    Ok(())
}

/// Logs application events until the bus closes.
async fn log_events(mut events: broadcast::Receiver<AppEvent>) {
    loop {
        match events.recv().await {
            Ok(AppEvent::ConnectionChanged { state, device }) => match device {
                Some(device) => info!("{}: {}", device, state),
                None => info!("{}", state),
            },
            Ok(AppEvent::CommandCompleted { id, response }) => trace!("'{}' -> '{}'", id, response),
            Ok(AppEvent::CommandFailed { id, error }) => debug!("'{}' failed: {}", id, error),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!("Event log skipped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}
