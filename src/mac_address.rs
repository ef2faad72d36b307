//! Device address type for BLE advertisers.
//!
//! Addresses are stored as a compact 6-byte array and rendered in the
//! canonical uppercase colon-separated form (`AA:BB:CC:DD:EE:FF`) for
//! whitelist matching and for the record log.

use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use thiserror::Error;

/// Length of the canonical string form, `AA:BB:CC:DD:EE:FF`.
pub const CANONICAL_LEN: usize = 17;

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// A Bluetooth device address stored as a compact 6-byte array.
///
/// Ordering follows the byte order, which is also the lexicographic order of
/// the canonical string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Character at `index` of the canonical string form, if in range.
    fn canonical_char(&self, index: usize) -> Option<u8> {
        if index >= CANONICAL_LEN {
            return None;
        }
        let byte = self.0[index / 3];
        Some(match index % 3 {
            0 => HEX_DIGITS[(byte >> 4) as usize],
            1 => HEX_DIGITS[(byte & 0x0F) as usize],
            _ => b':',
        })
    }

    /// Returns `true` if the canonical string form starts with `prefix`.
    ///
    /// Compares without allocating. The prefix must already be in canonical
    /// (uppercase) form; `"aa:bb"` never matches.
    ///
    /// # Example
    /// ```
    /// use rssi_logger::MacAddress;
    ///
    /// let mac = MacAddress([0xE4, 0xB3, 0x23, 0x01, 0x02, 0x03]);
    /// assert!(mac.starts_with("E4:B3:23"));
    /// assert!(!mac.starts_with("E4:B3:24"));
    /// ```
    pub fn starts_with(&self, prefix: &str) -> bool {
        prefix
            .bytes()
            .enumerate()
            .all(|(i, c)| self.canonical_char(i) == Some(c))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Errors returned when parsing a MAC address string.
#[derive(Error, Debug, PartialEq)]
pub enum ParseMacError {
    #[error("invalid MAC address: expected 6 parts, got {0}")]
    InvalidLength(usize),
    #[error("invalid MAC address: part {0} has wrong length")]
    InvalidPartLength(usize),
    #[error("invalid MAC address: '{0}' is not valid hex")]
    InvalidHex(String),
}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(ParseMacError::InvalidLength(parts.len()));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(ParseMacError::InvalidPartLength(i));
            }
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| ParseMacError::InvalidHex(part.to_string()))?;
        }

        Ok(MacAddress(bytes))
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for MacAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}
