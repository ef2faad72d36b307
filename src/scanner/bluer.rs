//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.
//!
//! BlueZ does not expose raw advertising bytes, so observations carry an AD
//! sequence rebuilt from the device's name and manufacturer data.

use super::{
    AddressType, OBSERVATION_CHANNEL_BUFFER_SIZE, Observation, ScanError, ScanFuture, ScanParams,
    ScanProvider, scan_deadline,
};
use crate::advertising::Advertisement;
use crate::mac_address::MacAddress;
use bluer::adv::{Advertisement as BluezAdvertisement, AdvertisementHandle, Type};
use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session, Uuid};
use futures::StreamExt;
use log::{debug, trace};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Bluetooth base UUID, into which 16-bit UUIDs are placed at bits 96..112.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

impl From<bluer::AddressType> for AddressType {
    fn from(kind: bluer::AddressType) -> Self {
        match kind {
            bluer::AddressType::LeRandom => AddressType::Random,
            _ => AddressType::Public,
        }
    }
}

/// Expand a 16-bit service UUID to its 128-bit form.
pub fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | (u128::from(short) << 96))
}

/// Convert to a BlueZ advertisement.
fn to_bluez(advertisement: &Advertisement, interval: Duration) -> BluezAdvertisement {
    let manufacturer_data: BTreeMap<u16, Vec<u8>> = advertisement
        .manufacturer()
        .map(|(id, body)| (id, body.to_vec()))
        .into_iter()
        .collect();
    let service_uuids: BTreeSet<Uuid> = advertisement
        .service_uuids
        .iter()
        .copied()
        .map(uuid16)
        .collect();

    BluezAdvertisement {
        advertisement_type: Type::Peripheral,
        local_name: Some(advertisement.name.clone()).filter(|n| !n.is_empty()),
        service_uuids,
        manufacturer_data,
        discoverable: Some(true),
        min_interval: Some(interval),
        max_interval: Some(interval),
        ..Default::default()
    }
}

/// Scan provider backed by BlueZ.
pub struct BluerScanner {
    // Keep the D-Bus session alive for the adapter
    _session: Session,
    adapter: Adapter,
    discovery: Option<JoinHandle<()>>,
    advertising: Option<AdvertisementHandle>,
}

impl BluerScanner {
    /// Connect to BlueZ and power on the default adapter.
    pub async fn open() -> Result<Self, ScanError> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        debug!("using adapter {}", adapter.name());

        Ok(Self {
            _session: session,
            adapter,
            discovery: None,
            advertising: None,
        })
    }

    async fn start(
        &mut self,
        params: ScanParams,
    ) -> Result<mpsc::Receiver<Observation>, ScanError> {
        self.abort_discovery();
        let deadline = scan_deadline(params.duration)?;

        // BlueZ picks its own interval and window; ask for every report.
        let filter = DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            duplicate_data: true,
            ..Default::default()
        };
        self.adapter.set_discovery_filter(filter).await?;
        let mut events = Box::pin(self.adapter.discover_devices_with_changes().await?);

        let (tx, rx) = mpsc::channel(OBSERVATION_CHANNEL_BUFFER_SIZE);
        let adapter = self.adapter.clone();

        // The stream keeps discovery running; dropping it stops discovery.
        self.discovery = Some(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.next() => event,
                    _ = tokio::time::sleep_until(deadline) => None,
                };
                let Some(event) = event else { break };

                if let AdapterEvent::DeviceAdded(address) = event {
                    match observe_device(&adapter, address).await {
                        Ok(Some(observation)) => {
                            if tx.send(observation).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => trace!("skipping {address}: {e}"),
                    }
                }
            }
        }));

        Ok(rx)
    }

    fn abort_discovery(&mut self) {
        if let Some(task) = self.discovery.take() {
            task.abort();
        }
    }
}

/// Read the current RSSI and advertising fields of a discovered device.
///
/// Returns `Ok(None)` for devices without an RSSI, i.e. ones BlueZ remembers
/// but has not heard during this discovery.
async fn observe_device(
    adapter: &Adapter,
    address: Address,
) -> Result<Option<Observation>, ScanError> {
    let device = adapter.device(address)?;
    let Some(rssi) = device.rssi().await? else {
        return Ok(None);
    };

    let manufacturer_data = device
        .manufacturer_data()
        .await?
        .and_then(|data| data.into_iter().next())
        .map(|(id, body)| {
            let mut bytes = id.to_le_bytes().to_vec();
            bytes.extend(body);
            bytes
        })
        .unwrap_or_default();
    let rebuilt = Advertisement {
        name: device.name().await?.unwrap_or_default(),
        service_uuids: Vec::new(),
        manufacturer_data,
    };

    Ok(Some(Observation {
        address_type: device.address_type().await?.into(),
        address: MacAddress::from(address),
        adv_data: rebuilt.payload(),
        rssi,
        is_scan_response: false,
    }))
}

impl ScanProvider for BluerScanner {
    fn begin_scan(&mut self, params: ScanParams) -> ScanFuture<'_, mpsc::Receiver<Observation>> {
        Box::pin(self.start(params))
    }

    fn stop_scan(&mut self) -> ScanFuture<'_, ()> {
        Box::pin(async move {
            self.abort_discovery();
            Ok(())
        })
    }

    fn begin_advertise<'a>(
        &'a mut self,
        interval: Duration,
        advertisement: &'a Advertisement,
    ) -> ScanFuture<'a, ()> {
        Box::pin(async move {
            // Dropping the previous handle unregisters it
            self.advertising = None;
            let handle = self
                .adapter
                .advertise(to_bluez(advertisement, interval))
                .await?;
            self.advertising = Some(handle);
            Ok(())
        })
    }

    fn stop_advertise(&mut self) -> ScanFuture<'_, ()> {
        Box::pin(async move {
            self.advertising = None;
            Ok(())
        })
    }
}

impl Drop for BluerScanner {
    fn drop(&mut self) {
        self.abort_discovery();
    }
}
