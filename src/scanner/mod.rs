//! BLE scan provider abstraction.
//!
//! A [`ScanProvider`] owns the radio. Starting a scan hands back a channel
//! receiver that yields one [`Observation`] per received advertisement;
//! dropping the receiver deregisters the sink. Backends:
//!
//! - `bluer`: BlueZ over D-Bus (requires `bluetoothd`)
//! - `hci`: raw HCI socket (requires `CAP_NET_RAW` and `CAP_NET_ADMIN`)

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::advertising::Advertisement;
use crate::aggregator::Rssi;
use crate::mac_address::MacAddress;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// Scan or advertising parameters the radio cannot represent
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

/// Channel buffer size for observations.
pub const OBSERVATION_CHANNEL_BUFFER_SIZE: usize = 256;

/// BLE timing unit used by scan and advertising parameters.
pub const BLE_TIME_UNIT: Duration = Duration::from_micros(625);

/// Instant at which a scan of `duration` started now ends.
pub fn scan_deadline(duration: Duration) -> Result<tokio::time::Instant, ScanError> {
    tokio::time::Instant::now()
        .checked_add(duration)
        .ok_or_else(|| {
            ScanError::InvalidParameters(format!("scan duration {duration:?} is too long"))
        })
}

/// Convert a duration to 0.625 ms radio units, rejecting values outside
/// `min..=max` units.
pub fn to_ble_units(value: Duration, min: u16, max: u16) -> Result<u16, ScanError> {
    let units = value.as_micros() / BLE_TIME_UNIT.as_micros();
    u16::try_from(units)
        .ok()
        .filter(|u| (min..=max).contains(u))
        .ok_or_else(|| {
            ScanError::InvalidParameters(format!(
                "{value:?} is outside {:?}..={:?}",
                BLE_TIME_UNIT * u32::from(min),
                BLE_TIME_UNIT * u32::from(max)
            ))
        })
}

/// Advertiser address type as reported by the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressType {
    #[default]
    Public,
    Random,
    PublicIdentity,
    RandomIdentity,
    Unknown(u8),
}

impl From<u8> for AddressType {
    fn from(raw: u8) -> Self {
        match raw {
            0x00 => AddressType::Public,
            0x01 => AddressType::Random,
            0x02 => AddressType::PublicIdentity,
            0x03 => AddressType::RandomIdentity,
            other => AddressType::Unknown(other),
        }
    }
}

/// One received advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub address_type: AddressType,
    pub address: MacAddress,
    /// Raw AD structures, empty if the backend does not expose them
    pub adv_data: Vec<u8>,
    pub rssi: Rssi,
    pub is_scan_response: bool,
}

/// Radio scan timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParams {
    /// How long the scan should run
    pub duration: Duration,
    /// Time between the starts of consecutive receive windows
    pub interval: Duration,
    /// Receive window length, at most `interval`
    pub window: Duration,
}

/// Boxed future returned by [`ScanProvider`] methods.
pub type ScanFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ScanError>> + Send + 'a>>;

/// Radio abstraction to enable deterministic unit tests without Bluetooth hardware.
pub trait ScanProvider: Send {
    /// Start scanning. Observations arrive on the returned receiver until
    /// [`ScanProvider::stop_scan`] is called or the receiver is dropped.
    fn begin_scan(&mut self, params: ScanParams) -> ScanFuture<'_, mpsc::Receiver<Observation>>;

    /// Stop scanning. Stopping an idle radio is not an error.
    fn stop_scan(&mut self) -> ScanFuture<'_, ()>;

    /// Start advertising `advertisement` every `interval`.
    fn begin_advertise<'a>(
        &'a mut self,
        interval: Duration,
        advertisement: &'a Advertisement,
    ) -> ScanFuture<'a, ()>;

    /// Stop advertising. Stopping an idle radio is not an error.
    fn stop_advertise(&mut self) -> ScanFuture<'_, ()>;
}

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    #[value(alias = "bluez")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    #[value(alias = "raw")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

/// Open the radio through the selected backend.
///
/// # Errors
/// Returns `ScanError::Bluetooth` if the adapter cannot be opened.
pub async fn open(backend: Backend) -> Result<Box<dyn ScanProvider>, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => Ok(Box::new(bluer::BluerScanner::open().await?)),
        #[cfg(feature = "hci")]
        Backend::Hci => Ok(Box::new(hci::HciScanner::open(0)?)),
    }
}
