//! This module defines the read only API for observing the trip core.
//! It provides interfaces for the link state, the active trip and the map track.
use std::{fmt::Debug, sync::Arc};
use tokio::sync::{watch, RwLock};

use crate::model::{
    map::{PolylineNode, TrackSegment},
    obd::{AdapterDescriptor, ConnectionState, DeviceDescriptor},
    trip::{Sample, Trip},
};

/// `ConnectionModelApi` trait.
///
/// Read access to the adapter link state. Subscribers always see every
/// transition in the order it happened.
pub trait ConnectionModelApi: Send + Sync {
    /// Current link state.
    fn get_state(&self) -> ConnectionState;

    /// A receiver that is notified on every state change.
    fn subscribe(&self) -> watch::Receiver<ConnectionState>;
}

/// `TripModelApi` trait.
///
/// Read access to the trip being recorded and the most recently finished one.
pub trait TripModelApi: Debug + Send + Sync {
    fn is_recording(&self) -> bool;

    /// Samples of the active trip, empty while idle.
    fn get_samples(&self) -> &[Sample];

    fn get_last_trip(&self) -> Option<Arc<Trip>>;
}

/// `TrackModelApi` trait.
///
/// Read access to the colored polyline of the active trip.
pub trait TrackModelApi: Debug + Send + Sync {
    /// Nodes in insertion order.
    fn get_nodes(&self) -> &[PolylineNode];

    /// Consecutive node pairs, colored by the first node of each pair.
    fn get_segments(&self) -> Vec<TrackSegment>;
}

/// `BluetoothModelApi` trait.
///
/// Read access to the discovered adapters and the OBD peripherals found while scanning.
pub trait BluetoothModelApi: Debug + Send + Sync {
    fn get_adapters(&self) -> &[AdapterDescriptor];

    fn get_selected_adapter(&self) -> Option<AdapterDescriptor>;

    /// Peripherals whose name passes the device filter, refreshed while scanning.
    fn get_devices(&self) -> &ModelHandle<Vec<DeviceDescriptor>>;

    fn is_scanning(&self) -> bool;
}

pub type ModelHandle<T> = Arc<RwLock<T>>;
