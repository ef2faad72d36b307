use crate::advertising::Advertisement;
use crate::mac_address::MacAddress;
use crate::scanner::{AddressType, Observation, ScanError, ScanFuture, ScanParams, ScanProvider};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Build an observation with an empty advertisement.
pub fn observation(address: MacAddress, rssi: i16) -> Observation {
    Observation {
        address_type: AddressType::Public,
        address,
        adv_data: Vec::new(),
        rssi,
        is_scan_response: false,
    }
}

/// Radio calls made against a [`FakeScanner`], in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    BeginScan(ScanParams),
    StopScan,
    BeginAdvertise(Duration, Advertisement),
    StopAdvertise,
}

/// Scan provider replaying one scripted batch of observations per scan.
///
/// Windows beyond the script see no advertisements. A `None` window makes
/// `begin_scan` fail.
#[derive(Debug, Clone, Default)]
pub struct FakeScanner {
    windows: Arc<Mutex<VecDeque<Option<Vec<Observation>>>>>,
    pub calls: Arc<Mutex<Vec<RadioCall>>>,
}

impl FakeScanner {
    pub fn new(windows: Vec<Vec<Observation>>) -> Self {
        Self::with_failures(windows.into_iter().map(Some).collect())
    }

    pub fn with_failures(windows: Vec<Option<Vec<Observation>>>) -> Self {
        Self {
            windows: Arc::new(Mutex::new(windows.into())),
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: RadioCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ScanProvider for FakeScanner {
    fn begin_scan(&mut self, params: ScanParams) -> ScanFuture<'_, mpsc::Receiver<Observation>> {
        self.record(RadioCall::BeginScan(params));
        let window = self.windows.lock().unwrap().pop_front().unwrap_or(Some(Vec::new()));
        Box::pin(async move {
            let observations =
                window.ok_or_else(|| ScanError::Bluetooth("scripted failure".into()))?;
            let (tx, rx) = mpsc::channel(observations.len().max(1));
            tokio::spawn(async move {
                for o in observations {
                    let _ = tx.send(o).await;
                }
                // Hold the sender open for the rest of the window like a real radio
                tokio::time::sleep(params.duration).await;
            });
            Ok(rx)
        })
    }

    fn stop_scan(&mut self) -> ScanFuture<'_, ()> {
        self.record(RadioCall::StopScan);
        Box::pin(async { Ok(()) })
    }

    fn begin_advertise<'a>(
        &'a mut self,
        interval: Duration,
        advertisement: &'a Advertisement,
    ) -> ScanFuture<'a, ()> {
        self.record(RadioCall::BeginAdvertise(interval, advertisement.clone()));
        Box::pin(async { Ok(()) })
    }

    fn stop_advertise(&mut self) -> ScanFuture<'_, ()> {
        self.record(RadioCall::StopAdvertise);
        Box::pin(async { Ok(()) })
    }
}
