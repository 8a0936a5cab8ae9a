//! Bluetooth Component
//!
//! Finds BLE OBD adapters and opens their serial emulation service as a link.
//! ELM327 clones expose a notify characteristic carrying the adapter output
//! and a write characteristic accepting commands.
use crate::api::controller::{
    AdapterDiscovery, BluetoothApi, DisplayName, Link, LinkOpener, LinkWriter,
};
use crate::api::model::{BluetoothModelApi, ModelHandle};
use crate::core::constants::{
    OBD_NOTIFY_CHARACTERISTIC_UUID, OBD_SERIAL_SERVICE_UUID, OBD_WRITE_CHARACTERISTIC_UUID,
};
use crate::core::error::ConnectionError;
use crate::model::obd::{AdapterDescriptor, DeviceDescriptor};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral, ScanFilter, WriteType};
use btleplug::{
    api::{Central, Manager as _},
    platform::{Adapter, Manager},
};
use futures::{future, StreamExt};
use log::{debug, info, trace};
use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

const PERIPHERAL_REFRESH_INTERVAL: Duration = Duration::from_secs(2);

/// Manages adapter discovery and the scan for OBD peripherals.
///
/// # Type Parameters
/// - `A`: Bluetooth adapter type that implements required traits
///
/// # Fields
/// - `device_filter`: name fragment identifying OBD adapters
/// - `peri_updater_handle`: Task handle for peripheral list updates
/// - `adapter_descriptors`: List of available Bluetooth adapters as their descriptors
/// - `adapters`: Map of adapter UUIDs to adapter instances
/// - `selected_adapter`: Currently selected adapter and its descriptor
/// - `devices`: Thread-safe list of discovered OBD devices
/// - `scanning`: Indicates if device scanning is active
#[derive(Debug)]
pub struct BluetoothComponent<A: Central + DisplayName + AdapterDiscovery<A> + 'static>
where
    A::Peripheral: DisplayName,
{
    device_filter: String,
    peri_updater_handle: Option<JoinHandle<Result<()>>>,
    adapter_descriptors: Vec<AdapterDescriptor>,
    adapters: HashMap<Uuid, A>,
    selected_adapter: Option<(AdapterDescriptor, A)>,
    devices: ModelHandle<Vec<DeviceDescriptor>>,
    scanning: bool,
}

impl<A: DisplayName + Central + AdapterDiscovery<A>> Drop for BluetoothComponent<A>
where
    <A as Central>::Peripheral: DisplayName,
{
    fn drop(&mut self) {
        if let Some(handle) = &self.peri_updater_handle {
            handle.abort();
        }
    }
}

impl<A: DisplayName + Central + AdapterDiscovery<A>> BluetoothComponent<A>
where
    <A as Central>::Peripheral: DisplayName,
{
    /// Creates a component that lists peripherals whose name contains `device_filter`.
    pub fn new(device_filter: &str) -> Self {
        Self {
            device_filter: device_filter.to_owned(),
            peri_updater_handle: None,
            adapter_descriptors: Vec::new(),
            adapters: HashMap::new(),
            selected_adapter: None,
            devices: Arc::new(RwLock::new(Vec::new())),
            scanning: false,
        }
    }

    /// A link opener on the selected adapter.
    pub fn link_opener(&self) -> Result<BleLinkOpener<A>> {
        let (_, adapter) = self
            .selected_adapter
            .as_ref()
            .ok_or(anyhow!("no selected adapter!"))?;
        Ok(BleLinkOpener::new(adapter.clone()))
    }

    async fn list_obd_devices(adapter: &A, filter: &str) -> Result<Vec<DeviceDescriptor>> {
        let mut descriptors = Vec::new();
        for peripheral in adapter.peripherals().await? {
            if let Ok(name) = peripheral.get_name().await {
                let descriptor = DeviceDescriptor {
                    name,
                    address: peripheral.address(),
                };
                if descriptor.is_obd_adapter(filter) {
                    descriptors.push(descriptor);
                }
            }
        }
        descriptors.sort();
        Ok(descriptors)
    }
}

#[async_trait]
impl<A: Central + DisplayName + AdapterDiscovery<A> + Debug + 'static> BluetoothApi
    for BluetoothComponent<A>
where
    A::Peripheral: DisplayName,
{
    async fn discover_adapters(&mut self) -> Result<()> {
        for adapter in A::discover_adapters().await? {
            let name = adapter.get_name().await?;
            let desc = AdapterDescriptor::new(name);
            self.adapter_descriptors.push(desc.clone());
            self.adapters.insert(*desc.get_uuid(), adapter);
        }
        self.adapter_descriptors
            .sort_by(|a, b| a.get_name().cmp(b.get_name()));
        Ok(())
    }

    async fn select_adapter(&mut self, adapter: AdapterDescriptor) -> Result<()> {
        let handle = self
            .adapters
            .get(adapter.get_uuid())
            .ok_or(anyhow!("Adapter not found"))?;
        self.selected_adapter = Some((adapter, handle.clone()));
        self.start_scan().await
    }

    async fn start_scan(&mut self) -> Result<()> {
        if self.scanning {
            return Err(anyhow!("Already scanning"));
        }
        let adapter = self
            .selected_adapter
            .as_ref()
            .ok_or(anyhow!("no selected adapter!"))?
            .1
            .clone();
        adapter.start_scan(ScanFilter::default()).await?;
        info!("Scanning started on adapter {}.", adapter.get_name().await?);
        self.scanning = true;

        let devices = self.devices.clone();
        let filter = self.device_filter.clone();
        if self.peri_updater_handle.is_none() {
            self.peri_updater_handle = Some(tokio::spawn(async move {
                loop {
                    let found = Self::list_obd_devices(&adapter, &filter).await?;
                    trace!("{} OBD adapters in range", found.len());
                    *devices.write().await = found;
                    tokio::time::sleep(PERIPHERAL_REFRESH_INTERVAL).await;
                }
            }));
        }
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<()> {
        if !self.scanning {
            return Err(anyhow!("stop scan requested but no scan active"));
        }
        let (_, adapter) = self
            .selected_adapter
            .as_ref()
            .ok_or(anyhow!("no selected adapter!"))?;
        adapter.stop_scan().await?;
        trace!("Stopped scanning on adapter {}.", adapter.get_name().await?);
        if let Some(updater_handle) = self.peri_updater_handle.take() {
            updater_handle.abort();
        }
        self.scanning = false;
        Ok(())
    }
}

impl<A: Central + DisplayName + AdapterDiscovery<A> + Debug + 'static> BluetoothModelApi
    for BluetoothComponent<A>
where
    A::Peripheral: DisplayName,
{
    fn get_adapters(&self) -> &[AdapterDescriptor] {
        self.adapter_descriptors.as_slice()
    }

    fn get_selected_adapter(&self) -> Option<AdapterDescriptor> {
        self.selected_adapter.as_ref().map(|(desc, _)| desc.clone())
    }

    fn get_devices(&self) -> &ModelHandle<Vec<DeviceDescriptor>> {
        &self.devices
    }

    fn is_scanning(&self) -> bool {
        self.scanning
    }
}

/// Opens the serial emulation service of a BLE OBD adapter.
pub struct BleLinkOpener<A: Central> {
    adapter: A,
}

impl<A: Central> BleLinkOpener<A> {
    pub fn new(adapter: A) -> Self {
        Self { adapter }
    }
}

fn connection_error(error: btleplug::Error) -> ConnectionError {
    match error {
        btleplug::Error::PermissionDenied => ConnectionError::PermissionDenied,
        btleplug::Error::TimedOut(_) => ConnectionError::Timeout,
        other => ConnectionError::Unreachable(other.to_string()),
    }
}

/// Looks up `uuid` within the serial emulation service.
fn find_characteristic(
    characteristics: &std::collections::BTreeSet<Characteristic>,
    uuid: Uuid,
) -> Result<Characteristic, ConnectionError> {
    characteristics
        .iter()
        .find(|c| c.service_uuid == OBD_SERIAL_SERVICE_UUID && c.uuid == uuid)
        .cloned()
        .ok_or_else(|| {
            ConnectionError::Unreachable(format!(
                "no characteristic {} in service {}",
                uuid, OBD_SERIAL_SERVICE_UUID
            ))
        })
}

#[async_trait]
impl<A: Central + 'static> LinkOpener for BleLinkOpener<A> {
    async fn open(&self, device: &DeviceDescriptor) -> Result<Link, ConnectionError> {
        let peripheral = self
            .adapter
            .peripherals()
            .await
            .map_err(connection_error)?
            .into_iter()
            .find(|p| p.address() == device.address)
            .ok_or_else(|| ConnectionError::Unreachable(format!("{} not in range", device)))?;
        peripheral.connect().await.map_err(connection_error)?;
        peripheral
            .discover_services()
            .await
            .map_err(connection_error)?;

        let characteristics = peripheral.characteristics();
        let notify = find_characteristic(&characteristics, OBD_NOTIFY_CHARACTERISTIC_UUID)?;
        let write = find_characteristic(&characteristics, OBD_WRITE_CHARACTERISTIC_UUID)?;
        peripheral
            .subscribe(&notify)
            .await
            .map_err(connection_error)?;
        debug!("Subscribed to {} on {}", notify.uuid, device);

        let inbound = peripheral
            .notifications()
            .await
            .map_err(connection_error)?
            .filter(|n| future::ready(n.uuid == OBD_NOTIFY_CHARACTERISTIC_UUID))
            .map(|n| Ok(n.value))
            .boxed();
        Ok(Link {
            inbound,
            outbound: Box::new(BleWriter {
                peripheral,
                characteristic: write,
            }),
        })
    }
}

/// Writes commands to the adapter's write characteristic.
struct BleWriter<P: Peripheral> {
    peripheral: P,
    characteristic: Characteristic,
}

#[async_trait]
impl<P: Peripheral + 'static> LinkWriter for BleWriter<P> {
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.peripheral
            .write(&self.characteristic, bytes, WriteType::WithoutResponse)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
    }

    async fn close(&mut self) -> io::Result<()> {
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

#[async_trait]
impl DisplayName for Adapter {
    async fn get_name(&self) -> Result<String> {
        Ok(self.adapter_info().await?)
    }
}

#[async_trait]
impl AdapterDiscovery<Adapter> for Adapter {
    async fn discover_adapters() -> Result<Vec<Adapter>> {
        let manager = Manager::new().await?;
        Ok(manager.adapters().await?)
    }
}

#[async_trait]
impl DisplayName for btleplug::platform::Peripheral {
    async fn get_name(&self) -> Result<String> {
        if let Some(props) = self.properties().await? {
            if let Some(name) = props.local_name {
                return Ok(name);
            }
        }
        Err(anyhow!("No name found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use btleplug::{
        api::{
            bleuuid::uuid_from_u16, BDAddr, CentralEvent, CentralState, CharPropFlags, Descriptor,
            PeripheralProperties, Service, ValueNotification,
        },
        platform::PeripheralId,
    };
    use futures::stream::Stream;
    use mockall::mock;
    use std::{collections::BTreeSet, pin::Pin};

    mock! {
        Peripheral{}

        impl Clone for Peripheral {
            fn clone(&self) -> Self;
        }

        impl std::fmt::Debug for Peripheral {
            fn fmt<'a>(&self, f: &mut std::fmt::Formatter<'a>) -> std::fmt::Result;
        }

        #[async_trait]
        impl Peripheral for Peripheral {
            fn id(&self) -> PeripheralId;
            fn address(&self) -> BDAddr;
            async fn properties(&self) -> btleplug::Result<Option<PeripheralProperties>>;
            fn services(&self) -> BTreeSet<Service>;
            fn characteristics(&self) -> BTreeSet<Characteristic> {
                self.services()
                    .iter()
                    .flat_map(|service| service.characteristics.clone().into_iter())
                    .collect()
            }
            async fn is_connected(&self) -> btleplug::Result<bool>;
            async fn connect(&self) -> btleplug::Result<()>;
            async fn disconnect(&self) -> btleplug::Result<()>;
            async fn discover_services(&self) -> btleplug::Result<()>;
            async fn write(
                &self,
                characteristic: &Characteristic,
                data: &[u8],
                write_type: WriteType,
            ) -> btleplug::Result<()>;
            async fn read(&self, characteristic: &Characteristic) -> btleplug::Result<Vec<u8>>;
            async fn subscribe(&self, characteristic: &Characteristic) -> btleplug::Result<()>;
            async fn unsubscribe(&self, characteristic: &Characteristic) -> btleplug::Result<()>;
            async fn notifications(&self) -> btleplug::Result<Pin<Box<dyn Stream<Item = ValueNotification> + Send>>>;
            async fn write_descriptor(&self, descriptor: &Descriptor, data: &[u8]) -> btleplug::Result<()>;
            async fn read_descriptor(&self, descriptor: &Descriptor) -> btleplug::Result<Vec<u8>>;
        }
        #[async_trait]
        impl DisplayName for Peripheral {
            async fn get_name(&self) -> Result<String>;
        }
    }

    mock! {
        Adapter{}
        impl Clone for Adapter {
            fn clone(&self) -> Self;
        }

        impl std::fmt::Debug for Adapter {
            fn fmt<'a>(&self, f: &mut std::fmt::Formatter<'a>) -> std::fmt::Result;
        }

        #[async_trait]
        impl DisplayName for Adapter {
            async fn get_name(&self) -> Result<String>;
        }

        #[async_trait]
        impl AdapterDiscovery<MockAdapter> for Adapter {
            async fn discover_adapters() -> Result<Vec<MockAdapter>>;
        }

        #[async_trait]
        impl Central for Adapter {
            type Peripheral = MockPeripheral;

            async fn events(&self) -> btleplug::Result<Pin<Box<dyn Stream<Item = CentralEvent> + Send>>>;

            async fn start_scan(&self, filter: ScanFilter) -> btleplug::Result<()>;

            async fn stop_scan(&self) -> btleplug::Result<()>;

            async fn peripherals(&self) -> btleplug::Result<Vec<MockPeripheral>>;

            async fn peripheral(&self, id: &PeripheralId) -> btleplug::Result<MockPeripheral>;

            async fn add_peripheral(&self, address: &PeripheralId) -> btleplug::Result<MockPeripheral>;

            async fn adapter_info(&self) -> btleplug::Result<String>;

            async fn adapter_state(&self) -> btleplug::Result<CentralState>;
        }
    }

    const OBD_ADDRESS: [u8; 6] = [0x00, 0x1D, 0xA5, 0x68, 0x98, 0x8B];

    fn characteristic(uuid: Uuid) -> Characteristic {
        characteristic_in(OBD_SERIAL_SERVICE_UUID, uuid)
    }

    fn characteristic_in(service_uuid: Uuid, uuid: Uuid) -> Characteristic {
        Characteristic {
            uuid,
            service_uuid,
            descriptors: BTreeSet::new(),
            properties: CharPropFlags::default(),
        }
    }

    fn named_peripheral(name: &'static str, address: [u8; 6]) -> MockPeripheral {
        let mut peripheral = MockPeripheral::default();
        peripheral
            .expect_address()
            .returning(move || BDAddr::from(address));
        peripheral
            .expect_get_name()
            .returning(move || Ok(name.to_string()));
        peripheral
    }

    /// A peripheral exposing the serial service and answering every write
    /// with `OK>` on the notify characteristic.
    fn obd_peripheral(characteristics: Vec<Uuid>) -> MockPeripheral {
        let mut peripheral = MockPeripheral::default();
        peripheral
            .expect_address()
            .returning(|| BDAddr::from(OBD_ADDRESS));
        peripheral.expect_connect().returning(|| Ok(()));
        peripheral.expect_discover_services().returning(|| Ok(()));
        peripheral
            .expect_characteristics()
            .returning(move || characteristics.iter().copied().map(characteristic).collect());
        peripheral.expect_subscribe().returning(|_| Ok(()));
        peripheral.expect_notifications().returning(|| {
            Ok(Box::pin(futures::stream::iter(vec![
                ValueNotification {
                    uuid: Uuid::nil(),
                    value: b"ignored".to_vec(),
                },
                ValueNotification {
                    uuid: OBD_NOTIFY_CHARACTERISTIC_UUID,
                    value: b"OK\r\r>".to_vec(),
                },
            ])))
        });
        peripheral
            .expect_write()
            .withf(|c, data, write_type| {
                c.uuid == OBD_WRITE_CHARACTERISTIC_UUID
                    && data.to_vec() == b"ATZ\r".to_vec()
                    && matches!(write_type, WriteType::WithoutResponse)
            })
            .returning(|_, _, _| Ok(()));
        peripheral
    }

    fn obd_device() -> DeviceDescriptor {
        DeviceDescriptor {
            name: "OBDII".to_string(),
            address: BDAddr::from(OBD_ADDRESS),
        }
    }

    #[tokio::test]
    async fn test_new_bluetooth_component() {
        let component = BluetoothComponent::<MockAdapter>::new("obd");
        assert!(component.selected_adapter.is_none());
        assert!(component.devices.read().await.is_empty());
        assert!(!component.is_scanning());
        assert!(component.link_opener().is_err());
    }

    #[tokio::test]
    async fn test_discover_adapters() {
        let mut component = BluetoothComponent::<MockAdapter>::new("obd");
        let _da_ctx = MockAdapter::discover_adapters_context();
        _da_ctx.expect().times(1).returning(|| {
            let mut adapter = MockAdapter::default();
            adapter
                .expect_get_name()
                .once()
                .returning(|| Ok("MockAdapter".to_string()));
            Ok(vec![adapter])
        });
        assert!(component.discover_adapters().await.is_ok());
        assert_eq!(component.get_adapters().len(), 1);
        assert_eq!(component.get_adapters()[0].get_name(), "MockAdapter");
    }

    /// An adapter whose clones keep answering scan requests.
    fn scanning_adapter() -> MockAdapter {
        let mut adapter = MockAdapter::default();
        adapter
            .expect_get_name()
            .returning(|| Ok("MockAdapter".to_string()));
        adapter.expect_start_scan().returning(|_| Ok(()));
        adapter.expect_peripherals().returning(|| Ok(vec![]));
        adapter.expect_clone().returning(scanning_adapter);
        adapter
    }

    #[tokio::test]
    async fn test_select_adapter_starts_scan() {
        let mut component = BluetoothComponent::<MockAdapter>::new("obd");
        let desc = AdapterDescriptor::new("MockAdapter".to_string());
        component.adapter_descriptors.push(desc.clone());
        component
            .adapters
            .insert(*desc.get_uuid(), scanning_adapter());

        assert!(component.select_adapter(desc.clone()).await.is_ok());
        assert_eq!(component.get_selected_adapter(), Some(desc));
        assert!(component.is_scanning());
        assert!(component.start_scan().await.is_err());
        assert!(component.link_opener().is_ok());
    }

    #[tokio::test]
    async fn test_device_list_is_filtered() {
        let mut adapter = MockAdapter::default();
        adapter.expect_peripherals().returning(|| {
            Ok(vec![
                named_peripheral("Polar H10", [1, 2, 3, 4, 5, 6]),
                named_peripheral("OBDII", OBD_ADDRESS),
                named_peripheral("vLinker obd", [6, 5, 4, 3, 2, 1]),
            ])
        });
        let devices = BluetoothComponent::<MockAdapter>::list_obd_devices(&adapter, "obd")
            .await
            .unwrap();
        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["OBDII", "vLinker obd"]);
    }

    #[tokio::test]
    async fn test_stop_scan() {
        let mut component = BluetoothComponent::<MockAdapter>::new("obd");
        let mut adapter = MockAdapter::default();
        adapter.expect_stop_scan().returning(|| Ok(()));
        adapter
            .expect_get_name()
            .returning(|| Ok("MockAdapter".to_string()));

        component.scanning = true;
        component.selected_adapter =
            Some((AdapterDescriptor::new("MockAdapter".to_string()), adapter));

        assert!(component.stop_scan().await.is_ok());
        assert!(!component.is_scanning());
        assert!(component.stop_scan().await.is_err());
    }

    #[tokio::test]
    async fn test_open_link() {
        let mut adapter = MockAdapter::default();
        adapter.expect_peripherals().returning(|| {
            Ok(vec![obd_peripheral(vec![
                OBD_NOTIFY_CHARACTERISTIC_UUID,
                OBD_WRITE_CHARACTERISTIC_UUID,
            ])])
        });
        let opener = BleLinkOpener::new(adapter);
        let mut link = opener.open(&obd_device()).await.unwrap();

        link.outbound.write_all(b"ATZ\r").await.unwrap();
        let chunk = link.inbound.next().await.unwrap().unwrap();
        assert_eq!(chunk, b"OK\r\r>".to_vec());
        assert!(link.inbound.next().await.is_none());
    }

    #[tokio::test]
    async fn test_open_without_serial_service() {
        let mut adapter = MockAdapter::default();
        adapter
            .expect_peripherals()
            .returning(|| Ok(vec![obd_peripheral(vec![OBD_NOTIFY_CHARACTERISTIC_UUID])]));
        let opener = BleLinkOpener::new(adapter);
        assert!(matches!(
            opener.open(&obd_device()).await,
            Err(ConnectionError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_open_ignores_characteristics_of_other_services() {
        let mut adapter = MockAdapter::default();
        adapter.expect_peripherals().returning(|| {
            let mut peripheral = MockPeripheral::default();
            peripheral
                .expect_address()
                .returning(|| BDAddr::from(OBD_ADDRESS));
            peripheral.expect_connect().returning(|| Ok(()));
            peripheral.expect_discover_services().returning(|| Ok(()));
            peripheral.expect_characteristics().returning(|| {
                [OBD_NOTIFY_CHARACTERISTIC_UUID, OBD_WRITE_CHARACTERISTIC_UUID]
                    .into_iter()
                    .map(|uuid| characteristic_in(uuid_from_u16(0x180A), uuid))
                    .collect()
            });
            Ok(vec![peripheral])
        });
        let opener = BleLinkOpener::new(adapter);
        assert!(matches!(
            opener.open(&obd_device()).await,
            Err(ConnectionError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_open_unknown_device() {
        let mut adapter = MockAdapter::default();
        adapter.expect_peripherals().returning(|| Ok(vec![]));
        let opener = BleLinkOpener::new(adapter);
        assert!(matches!(
            opener.open(&obd_device()).await,
            Err(ConnectionError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_permission_denied_is_reported() {
        let mut adapter = MockAdapter::default();
        adapter
            .expect_peripherals()
            .returning(|| Err(btleplug::Error::PermissionDenied));
        let opener = BleLinkOpener::new(adapter);
        assert!(matches!(
            opener.open(&obd_device()).await,
            Err(ConnectionError::PermissionDenied)
        ));
    }
}
