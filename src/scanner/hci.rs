//! Raw HCI socket backend.
//!
//! This backend drives the controller directly with LE HCI commands and
//! reads advertising reports from a raw socket, without the BlueZ daemon.
//! It requires CAP_NET_RAW and CAP_NET_ADMIN capabilities or root privileges.

use super::{
    AddressType, OBSERVATION_CHANNEL_BUFFER_SIZE, Observation, ScanError, ScanFuture, ScanParams,
    ScanProvider, scan_deadline, to_ble_units,
};
use crate::advertising::{Advertisement, MAX_LEGACY_PAYLOAD};
use crate::mac_address::MacAddress;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use log::{debug, trace, warn};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const HCI_FILTER: c_int = 2;

// HCI packet types
const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta event sub-events
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_ADVERTISING_PARAMETERS: u16 = 0x0006;
const OCF_LE_SET_ADVERTISING_DATA: u16 = 0x0008;
const OCF_LE_SET_ADVERTISE_ENABLE: u16 = 0x000A;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Scan types
const LE_SCAN_PASSIVE: u8 = 0x00;

// Own address type
const LE_PUBLIC_ADDRESS: u8 = 0x00;

// Filter policy
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

// Advertising report event types
const ADV_REPORT_SCAN_RSP: u8 = 0x04;

// Connectable undirected advertising
const ADV_IND: u8 = 0x00;

// All three primary advertising channels
const ADV_CHANNEL_ALL: u8 = 0x07;

/// RSSI value meaning "not available" in advertising reports.
const RSSI_UNAVAILABLE: i8 = 127;

// Parameter ranges in 0.625 ms units
const SCAN_UNITS_MIN: u16 = 0x0004;
const SCAN_UNITS_MAX: u16 = 0x4000;
const ADV_UNITS_MIN: u16 = 0x0020;
const ADV_UNITS_MAX: u16 = 0x4000;

/// Fixed part of one advertising report: event type, address type,
/// address and data length.
const REPORT_HEADER_LEN: usize = 9;

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// LE Set Scan Parameters command
#[repr(C, packed)]
struct LeSetScanParametersCmd {
    scan_type: u8,
    interval: u16,
    window: u16,
    own_address_type: u8,
    filter_policy: u8,
}

/// LE Set Scan Enable command
#[repr(C, packed)]
struct LeSetScanEnableCmd {
    enable: u8,
    filter_dup: u8,
}

/// LE Set Advertising Parameters command
#[repr(C, packed)]
struct LeSetAdvertisingParametersCmd {
    min_interval: u16,
    max_interval: u16,
    advtype: u8,
    own_address_type: u8,
    direct_address_type: u8,
    direct_address: [u8; 6],
    channel_map: u8,
    filter_policy: u8,
}

/// LE Set Advertising Data command
#[repr(C, packed)]
struct LeSetAdvertisingDataCmd {
    length: u8,
    data: [u8; MAX_LEGACY_PAYLOAD],
}

/// View a packed command struct as its wire bytes.
fn as_bytes<T>(cmd: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(cmd as *const T as *const u8, mem::size_of::<T>()) }
}

/// Create an HCI command packet
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.push((opcode & 0xFF) as u8);
    packet.push((opcode >> 8) as u8);
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// Open a raw HCI socket
fn open_hci_socket() -> Result<OwnedFd, ScanError> {
    // SOCK_NONBLOCK is required for AsyncFd to work properly
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            BTPROTO_HCI,
        )
    };

    if fd < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to create HCI socket: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bind HCI socket to a device
fn bind_hci_socket(fd: &OwnedFd, dev_id: u16) -> Result<(), ScanError> {
    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: 0, // HCI_CHANNEL_RAW
    };

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const sockaddr,
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to bind HCI socket to hci{dev_id}: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Set HCI socket filter
fn set_hci_filter(fd: &OwnedFd) -> Result<(), ScanError> {
    let mut filter = HciFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_LE_META_EVENT);

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            0, // SOL_HCI
            HCI_FILTER,
            &filter as *const HciFilter as *const c_void,
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to set HCI filter: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Send an LE controller command
fn send_le_command(fd: &OwnedFd, ocf: u16, params: &[u8]) -> Result<(), ScanError> {
    let packet = hci_command_packet(OGF_LE_CTL, ocf, params);
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            packet.as_ptr() as *const c_void,
            packet.len(),
        )
    };

    if ret < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to send HCI command {ocf:#06x}: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

fn set_scan_enable(fd: &OwnedFd, enable: bool) -> Result<(), ScanError> {
    let cmd = LeSetScanEnableCmd {
        enable: u8::from(enable),
        filter_dup: 0x00, // Report every advertisement, the strongest one matters
    };
    send_le_command(fd, OCF_LE_SET_SCAN_ENABLE, as_bytes(&cmd))
}

fn set_advertise_enable(fd: &OwnedFd, enable: bool) -> Result<(), ScanError> {
    send_le_command(fd, OCF_LE_SET_ADVERTISE_ENABLE, &[u8::from(enable)])
}

/// Build the LE Set Scan Parameters command for `params`.
fn scan_parameters(params: &ScanParams) -> Result<LeSetScanParametersCmd, ScanError> {
    let interval = to_ble_units(params.interval, SCAN_UNITS_MIN, SCAN_UNITS_MAX)?;
    let window = to_ble_units(params.window, SCAN_UNITS_MIN, SCAN_UNITS_MAX)?;
    if window > interval {
        return Err(ScanError::InvalidParameters(format!(
            "scan window {:?} is longer than scan interval {:?}",
            params.window, params.interval
        )));
    }

    Ok(LeSetScanParametersCmd {
        scan_type: LE_SCAN_PASSIVE,
        interval: interval.to_le(),
        window: window.to_le(),
        own_address_type: LE_PUBLIC_ADDRESS,
        filter_policy: FILTER_POLICY_ACCEPT_ALL,
    })
}

/// Parse an LE advertising report event into observations.
///
/// `data` is the whole event packet starting with the packet type byte.
/// Reports are laid out one after another; parsing stops at the first
/// truncated report.
fn parse_advertising_report(data: &[u8]) -> Vec<Observation> {
    let mut observations = Vec::new();

    // Skip HCI header (packet type, event code, param len, subevent)
    let Some(report) = data.get(4..) else {
        return observations;
    };
    let Some((&num_reports, mut rest)) = report.split_first() else {
        return observations;
    };

    for _ in 0..num_reports {
        if rest.len() < REPORT_HEADER_LEN {
            break;
        }
        let event_type = rest[0];
        let address_type = AddressType::from(rest[1]);

        // HCI uses little-endian addresses
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&rest[2..8]);
        addr.reverse();

        let data_len = rest[8] as usize;
        let end = REPORT_HEADER_LEN + data_len;
        if rest.len() < end + 1 {
            break;
        }
        let adv_data = rest[REPORT_HEADER_LEN..end].to_vec();
        let rssi = rest[end] as i8;
        rest = &rest[end + 1..];

        if rssi == RSSI_UNAVAILABLE {
            continue;
        }

        observations.push(Observation {
            address_type,
            address: MacAddress(addr),
            adv_data,
            rssi: i16::from(rssi),
            is_scan_response: event_type == ADV_REPORT_SCAN_RSP,
        });
    }

    observations
}

/// Read advertising reports from `async_fd` into `tx` until `deadline`, a
/// read error, or the receiver is dropped.
async fn read_reports(
    async_fd: AsyncFd<OwnedFd>,
    tx: mpsc::Sender<Observation>,
    deadline: tokio::time::Instant,
) {
    let mut buf = [0u8; 258]; // Max HCI event size

    loop {
        // Wait for the socket to be readable
        let mut guard = tokio::select! {
            ready = async_fd.readable() => match ready {
                Ok(guard) => guard,
                Err(_) => break,
            },
            _ = tokio::time::sleep_until(deadline) => break,
        };

        // Drain all available packets before waiting again
        loop {
            let n = match guard.try_io(|inner| {
                let ret = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut c_void,
                        buf.len(),
                    )
                };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            }) {
                Ok(Ok(n)) if n > 0 => n,
                Ok(Ok(_)) => return,   // EOF
                Ok(Err(_)) => return,  // Read error
                Err(_would_block) => break,
            };

            if n >= 4
                && buf[0] == HCI_EVENT_PKT
                && buf[1] == EVT_LE_META_EVENT
                && buf[3] == EVT_LE_ADVERTISING_REPORT
            {
                for observation in parse_advertising_report(&buf[..n]) {
                    trace!("hci report {:?}", observation);
                    if tx.send(observation).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Scan provider on a raw HCI socket.
pub struct HciScanner {
    dev_id: u16,
    cmd_fd: OwnedFd,
    reader: Option<JoinHandle<()>>,
}

impl HciScanner {
    /// Open the command socket for `hci<dev_id>`.
    pub fn open(dev_id: u16) -> Result<Self, ScanError> {
        let cmd_fd = open_hci_socket()?;
        bind_hci_socket(&cmd_fd, dev_id)?;
        Ok(Self {
            dev_id,
            cmd_fd,
            reader: None,
        })
    }

    fn start(&mut self, params: ScanParams) -> Result<mpsc::Receiver<Observation>, ScanError> {
        let cmd = scan_parameters(&params)?;
        let deadline = scan_deadline(params.duration)?;

        // Open and configure a second socket for receiving events
        let fd = open_hci_socket()?;
        bind_hci_socket(&fd, self.dev_id)?;
        set_hci_filter(&fd)?;
        let async_fd = AsyncFd::new(fd)
            .map_err(|e| ScanError::Bluetooth(format!("Failed to create async fd: {}", e)))?;

        // Parameters cannot change while a scan is running
        self.abort_reader();
        set_scan_enable(&self.cmd_fd, false)?;
        send_le_command(&self.cmd_fd, OCF_LE_SET_SCAN_PARAMETERS, as_bytes(&cmd))?;
        set_scan_enable(&self.cmd_fd, true)?;

        let (tx, rx) = mpsc::channel(OBSERVATION_CHANNEL_BUFFER_SIZE);
        self.reader = Some(tokio::spawn(read_reports(async_fd, tx, deadline)));
        debug!("hci{} scanning for {:?}", self.dev_id, params.duration);

        Ok(rx)
    }

    fn advertise(
        &self,
        interval: Duration,
        advertisement: &Advertisement,
    ) -> Result<(), ScanError> {
        let payload = advertisement.payload();
        if payload.len() > MAX_LEGACY_PAYLOAD {
            return Err(ScanError::InvalidParameters(format!(
                "advertising payload is {} bytes, at most {MAX_LEGACY_PAYLOAD} fit",
                payload.len()
            )));
        }
        let units = to_ble_units(interval, ADV_UNITS_MIN, ADV_UNITS_MAX)?;

        let params = LeSetAdvertisingParametersCmd {
            min_interval: units.to_le(),
            max_interval: units.to_le(),
            advtype: ADV_IND,
            own_address_type: LE_PUBLIC_ADDRESS,
            direct_address_type: LE_PUBLIC_ADDRESS,
            direct_address: [0; 6],
            channel_map: ADV_CHANNEL_ALL,
            filter_policy: FILTER_POLICY_ACCEPT_ALL,
        };
        let mut data = LeSetAdvertisingDataCmd {
            length: payload.len() as u8,
            data: [0; MAX_LEGACY_PAYLOAD],
        };
        data.data[..payload.len()].copy_from_slice(&payload);

        set_advertise_enable(&self.cmd_fd, false)?;
        send_le_command(
            &self.cmd_fd,
            OCF_LE_SET_ADVERTISING_PARAMETERS,
            as_bytes(&params),
        )?;
        send_le_command(&self.cmd_fd, OCF_LE_SET_ADVERTISING_DATA, as_bytes(&data))?;
        set_advertise_enable(&self.cmd_fd, true)
    }

    fn abort_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl ScanProvider for HciScanner {
    fn begin_scan(&mut self, params: ScanParams) -> ScanFuture<'_, mpsc::Receiver<Observation>> {
        Box::pin(async move { self.start(params) })
    }

    fn stop_scan(&mut self) -> ScanFuture<'_, ()> {
        Box::pin(async move {
            self.abort_reader();
            set_scan_enable(&self.cmd_fd, false)
        })
    }

    fn begin_advertise<'a>(
        &'a mut self,
        interval: Duration,
        advertisement: &'a Advertisement,
    ) -> ScanFuture<'a, ()> {
        Box::pin(async move { self.advertise(interval, advertisement) })
    }

    fn stop_advertise(&mut self) -> ScanFuture<'_, ()> {
        Box::pin(async move { set_advertise_enable(&self.cmd_fd, false) })
    }
}

impl Drop for HciScanner {
    fn drop(&mut self) {
        self.abort_reader();
        // Leave the controller quiet even if the owner forgot to stop it
        if let Err(e) = set_scan_enable(&self.cmd_fd, false) {
            warn!("{e}");
        }
        if let Err(e) = set_advertise_enable(&self.cmd_fd, false) {
            warn!("{e}");
        }
    }
}
