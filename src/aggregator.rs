//! Strongest-signal aggregation for one scan window.

use crate::mac_address::MacAddress;
use crate::whitelist::{Whitelist, WhitelistMode, is_eligible};
use std::collections::BTreeMap;

/// Signal strength in dBm. Larger (closer to zero) is stronger.
pub type Rssi = i16;

/// Strongest observed RSSI per device address within the current window.
///
/// Entries map to `None` until the device is heard. A present value is only
/// ever replaced by a strictly stronger one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalAggregator {
    table: BTreeMap<MacAddress, Option<Rssi>>,
}

impl SignalAggregator {
    /// Create an aggregator already reset for `whitelist` and `mode`.
    pub fn new(whitelist: &Whitelist, mode: WhitelistMode) -> Self {
        let mut aggregator = Self::default();
        aggregator.reset(whitelist, mode);
        aggregator
    }

    /// Start a new window.
    ///
    /// In whitelist mode every whitelist entry that names a full address is
    /// pre-populated as unobserved; prefix entries cannot be keys and are
    /// matched on observe instead. Otherwise the table is emptied.
    pub fn reset(&mut self, whitelist: &Whitelist, mode: WhitelistMode) {
        self.table.clear();
        if mode == WhitelistMode::Enabled {
            self.table
                .extend(whitelist.full_addresses().map(|addr| (addr, None)));
        }
    }

    /// Record one advertisement.
    ///
    /// Returns `true` if the stored value changed.
    pub fn observe(
        &mut self,
        addr: MacAddress,
        rssi: Rssi,
        whitelist: &Whitelist,
        mode: WhitelistMode,
    ) -> bool {
        if !is_eligible(&addr, whitelist, mode) {
            return false;
        }

        let slot = self.table.entry(addr).or_insert(None);
        match *slot {
            Some(current) if rssi <= current => false,
            _ => {
                *slot = Some(rssi);
                true
            }
        }
    }

    /// Observed entries in address order. Does not clear the table.
    pub fn drain(&self) -> Vec<(MacAddress, Rssi)> {
        self.table
            .iter()
            .filter_map(|(addr, rssi)| rssi.map(|r| (*addr, r)))
            .collect()
    }

    /// Number of keys, observed or not.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACKED: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0x11, 0x22, 0x33]);
    const STRANGER: MacAddress = MacAddress([0xDD, 0xEE, 0xFF, 0x00, 0x00, 0x00]);

    fn prefix_whitelist() -> Whitelist {
        Whitelist::parse("AA:BB:CC")
    }

    #[test]
    fn test_keeps_strongest_of_window() {
        let whitelist = prefix_whitelist();
        let mode = WhitelistMode::Enabled;
        let mut aggregator = SignalAggregator::new(&whitelist, mode);

        aggregator.observe(TRACKED, -70, &whitelist, mode);
        aggregator.observe(TRACKED, -60, &whitelist, mode);
        aggregator.observe(STRANGER, -40, &whitelist, mode);

        assert_eq!(aggregator.drain(), vec![(TRACKED, -60)]);
    }

    #[test]
    fn test_weaker_and_equal_values_do_not_replace() {
        let whitelist = Whitelist::default();
        let mode = WhitelistMode::Disabled;
        let mut aggregator = SignalAggregator::new(&whitelist, mode);

        assert!(aggregator.observe(TRACKED, -50, &whitelist, mode));
        assert!(!aggregator.observe(TRACKED, -50, &whitelist, mode));
        assert!(!aggregator.observe(TRACKED, -90, &whitelist, mode));
        assert_eq!(aggregator.drain(), vec![(TRACKED, -50)]);
    }

    #[test]
    fn test_final_value_is_maximum_of_sequence() {
        let whitelist = Whitelist::default();
        let mode = WhitelistMode::Disabled;
        let sequences: [&[Rssi]; 4] = [
            &[-80, -75, -90, -60, -61],
            &[-30],
            &[-100, -100, -99],
            &[0, -1, -127],
        ];

        for seq in sequences {
            let mut aggregator = SignalAggregator::new(&whitelist, mode);
            for &rssi in seq {
                aggregator.observe(TRACKED, rssi, &whitelist, mode);
            }
            let max = seq.iter().copied().max().unwrap();
            assert_eq!(aggregator.drain(), vec![(TRACKED, max)], "{seq:?}");
        }
    }

    #[test]
    fn test_whitelist_full_addresses_prepopulated_but_not_drained() {
        let whitelist = Whitelist::parse("AA:BB:CC:11:22:33\nE4:B3:23");
        let mode = WhitelistMode::Enabled;
        let aggregator = SignalAggregator::new(&whitelist, mode);

        assert_eq!(aggregator.len(), 1);
        assert!(aggregator.drain().is_empty());
    }

    #[test]
    fn test_disabled_mode_starts_empty() {
        let whitelist = Whitelist::parse("AA:BB:CC:11:22:33");
        let aggregator = SignalAggregator::new(&whitelist, WhitelistMode::Disabled);
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_empty_whitelist_rejects_all() {
        let whitelist = Whitelist::default();
        let mode = WhitelistMode::Enabled;
        let mut aggregator = SignalAggregator::new(&whitelist, mode);

        assert!(!aggregator.observe(TRACKED, -10, &whitelist, mode));
        assert!(aggregator.is_empty());
        assert!(aggregator.drain().is_empty());
    }

    #[test]
    fn test_drain_does_not_mutate() {
        let whitelist = Whitelist::default();
        let mode = WhitelistMode::Disabled;
        let mut aggregator = SignalAggregator::new(&whitelist, mode);
        aggregator.observe(STRANGER, -40, &whitelist, mode);
        aggregator.observe(TRACKED, -45, &whitelist, mode);

        let first = aggregator.drain();
        assert_eq!(first, aggregator.drain());
        assert_eq!(first, vec![(TRACKED, -45), (STRANGER, -40)]);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let whitelist = Whitelist::parse("AA:BB:CC:11:22:33\nDD");
        let mode = WhitelistMode::Enabled;
        let mut aggregator = SignalAggregator::new(&whitelist, mode);
        aggregator.observe(STRANGER, -40, &whitelist, mode);

        aggregator.reset(&whitelist, mode);
        let once = aggregator.clone();
        aggregator.reset(&whitelist, mode);

        assert_eq!(aggregator, once);
        assert_eq!(once, SignalAggregator::new(&whitelist, mode));
    }
}
