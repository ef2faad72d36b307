//! One line of the record log.

use crate::aggregator::Rssi;
use crate::mac_address::MacAddress;
use time::PrimitiveDateTime;

/// The strongest signal heard from one device during one scan window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalRecord {
    /// Device address
    pub mac: MacAddress,
    /// Strongest RSSI of the window in dBm
    pub rssi: Rssi,
    /// Real-time clock reading at flush time
    pub timestamp: PrimitiveDateTime,
}
