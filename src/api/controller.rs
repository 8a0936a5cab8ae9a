//! Controller Module
//!
//! This module defines the traits and structures at the seams of the trip core:
//! opening the adapter link, reading positions, recording trips and
//! Bluetooth adapter discovery.
use crate::core::error::ConnectionError;
use crate::api::model::BluetoothModelApi;
use crate::model::obd::{AdapterDescriptor, DeviceDescriptor};
use anyhow::Result;
use async_trait::async_trait;
use btleplug::api::Central;
use futures::stream::BoxStream;
use std::{io, sync::Arc};

#[cfg(any(test, feature = "mock"))]
use futures::stream::{self, StreamExt};
#[cfg(any(test, feature = "mock"))]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[cfg(test)]
use mockall::automock;

use crate::model::trip::Trip;

/// Size of a single read from an I/O backed link.
#[cfg(any(test, feature = "mock"))]
const READ_CHUNK_SIZE: usize = 256;

/// Outbound half of an adapter link.
#[async_trait]
pub trait LinkWriter: Send {
    /// Writes all bytes to the adapter.
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Releases the underlying transport.
    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An opened duplex byte stream to an adapter.
///
/// The inbound stream yields raw byte chunks in arrival order; it ends when the
/// transport closes and yields an error when reading fails.
pub struct Link {
    pub inbound: BoxStream<'static, io::Result<Vec<u8>>>,
    pub outbound: Box<dyn LinkWriter>,
}

#[cfg(any(test, feature = "mock"))]
impl Link {
    /// Builds a link from tokio I/O halves, e.g. the emulator's duplex pipe.
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let inbound = stream::unfold(Some(reader), |reader| async move {
            let mut reader = reader?;
            let mut buffer = vec![0u8; READ_CHUNK_SIZE];
            match reader.read(&mut buffer).await {
                Ok(0) => None,
                Ok(n) => {
                    buffer.truncate(n);
                    Some((Ok(buffer), Some(reader)))
                }
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed();
        Self {
            inbound,
            outbound: Box::new(IoWriter(writer)),
        }
    }
}

#[cfg(any(test, feature = "mock"))]
struct IoWriter<W>(W);

#[cfg(any(test, feature = "mock"))]
#[async_trait]
impl<W: AsyncWrite + Unpin + Send> LinkWriter for IoWriter<W> {
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0.write_all(bytes).await?;
        self.0.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.0.shutdown().await
    }
}

/// LinkOpener trait
///
/// Opens a serial-style session to a selected device. Discovery and pairing
/// happen before; the opener only turns a device into a [`Link`].
#[async_trait]
pub trait LinkOpener: Send + Sync {
    async fn open(&self, device: &DeviceDescriptor) -> Result<Link, ConnectionError>;
}

#[async_trait]
impl<T: LinkOpener + ?Sized> LinkOpener for Arc<T> {
    async fn open(&self, device: &DeviceDescriptor) -> Result<Link, ConnectionError> {
        (**self).open(device).await
    }
}

/// PositionSource trait
///
/// Supplies the vehicle position while a trip is recorded.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PositionSource: Send {
    /// Latest `[latitude, longitude]` fix, `None` while no fix is available.
    async fn current_position(&mut self) -> Option<[f64; 2]>;
}

/// RecordingApi trait
///
/// This trait defines the asynchronous API for managing the recording process in the application.
/// It provides methods to start and stop the recording process.
#[async_trait]
pub trait RecordingApi {
    /// start the recording process
    async fn start_recording(&mut self) -> Result<()>;
    /// stop the recording process and hand out the finished trip
    async fn stop_recording(&mut self) -> Result<Arc<Trip>>;
}

/// BluetoothApi trait
///
/// This trait extends the `BluetoothModelApi` trait and defines the asynchronous APIs
/// for finding OBD adapters: discovering local adapters, selecting one and scanning
/// for peripherals.
#[async_trait]
pub trait BluetoothApi: BluetoothModelApi + Send + Sync {
    /// Discover Bluetooth adapters.
    async fn discover_adapters(&mut self) -> Result<()>;

    /// Select a Bluetooth adapter and start scanning on it.
    ///
    /// # Arguments
    ///
    /// * `adapter` - An `AdapterDescriptor` of a previously discovered adapter.
    async fn select_adapter(&mut self, adapter: AdapterDescriptor) -> Result<()>;

    /// Start scanning for Bluetooth devices.
    async fn start_scan(&mut self) -> Result<()>;

    /// Stop scanning for Bluetooth devices.
    async fn stop_scan(&mut self) -> Result<()>;
}

/// AdapterDiscovery trait
///
/// This trait defines the asynchronous API for discovering Bluetooth adapters in the application.
///
/// # Type Parameters
///
/// * `A` - A type that implements the `Central` and `DisplayName` traits.
#[async_trait]
pub trait AdapterDiscovery<A: Central + DisplayName> {
    /// Discover Bluetooth adapters.
    async fn discover_adapters() -> Result<Vec<A>>;
}

/// DisplayName trait
///
/// Retrieves the display name of an adapter or peripheral.
#[async_trait]
pub trait DisplayName {
    async fn get_name(&self) -> Result<String>;
}
