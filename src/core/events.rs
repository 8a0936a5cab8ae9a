//! Core Events
//!
//! This module defines events used for communication between the components of
//! the trip core. Events are published on a `tokio::sync::broadcast` bus so
//! that observers never block the publishing side.
use std::sync::Arc;

use crate::core::error::CommandError;
use crate::model::{
    obd::{ConnectionState, DeviceDescriptor},
    trip::{Sample, Trip},
};

/// Enumeration of all application-level events.
#[derive(Clone, Debug)]
pub enum AppEvent {
    /// The adapter link changed its state.
    ConnectionChanged {
        state: ConnectionState,
        device: Option<DeviceDescriptor>,
    },

    /// A command received a matching response.
    CommandCompleted { id: String, response: String },

    /// A command failed (timeout, malformed response, cancellation).
    CommandFailed { id: String, error: CommandError },

    /// A sample was appended to the active trip.
    SampleRecorded(Sample),

    /// A trip was finalized.
    TripFinished(Arc<Trip>),
}
