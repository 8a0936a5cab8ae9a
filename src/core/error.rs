//! Error Taxonomy
//!
//! Typed errors for every component of the trip core. Connection and command
//! errors are surfaced to callers and observers; none of them is fatal to the
//! process.

use crate::model::obd::ConnectionState;
use thiserror::Error;

/// Errors raised while opening, holding or closing the adapter link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("device unreachable: {0}")]
    Unreachable(String),

    #[error("bluetooth permission denied")]
    PermissionDenied,

    #[error("connection attempt timed out")]
    Timeout,

    #[error("link to the adapter was lost")]
    LinkLost,

    #[error("operation cancelled by disconnect")]
    Cancelled,

    #[error("already connected or connecting")]
    AlreadyConnected,

    #[error("transition not allowed while {0}")]
    InvalidTransition(ConnectionState),
}

/// Errors raised by the command dispatcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("not connected to an adapter")]
    NotConnected,

    #[error("no response within {0} ms")]
    Timeout(u64),

    #[error("malformed response: '{0}'")]
    MalformedResponse(String),

    #[error("'{0}' is still waiting for its response")]
    Busy(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Errors raised by the trip aggregator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TripError {
    #[error("a trip is already being recorded")]
    AlreadyRecording,

    #[error("no trip is being recorded")]
    NotRecording,

    #[error("sample timestamp precedes the previous sample")]
    OutOfOrder,
}

/// Errors raised when validating externally supplied values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("invalid coordinate ({latitude}, {longitude})")]
    InvalidCoordinate { latitude: f64, longitude: f64 },
}
