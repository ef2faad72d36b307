//! Record log line format: `ADDR,RSSI,YYMMDDHHMMSS`.

use crate::output::OutputFormatter;
use crate::record::SignalRecord;
use std::fmt;
use time::PrimitiveDateTime;

/// Fixed-width `YYMMDDHHMMSS` rendering of a clock reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactTimestamp(pub PrimitiveDateTime);

impl fmt::Display for CompactTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dt = self.0;
        write!(
            f,
            "{:02}{:02}{:02}{:02}{:02}{:02}",
            dt.year().rem_euclid(100),
            u8::from(dt.month()),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second()
        )
    }
}

/// Comma-separated record formatter. No header, no escaping.
#[derive(Debug, Default, Clone, Copy)]
pub struct CsvFormatter;

impl OutputFormatter for CsvFormatter {
    fn format(&self, record: &SignalRecord) -> String {
        format!(
            "{},{},{}",
            record.mac,
            record.rssi,
            CompactTimestamp(record.timestamp)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TEST_MAC;
    use time::macros::datetime;

    #[test]
    fn test_compact_timestamp() {
        let ts = CompactTimestamp(datetime!(2025-01-02 03:04:05));
        assert_eq!(ts.to_string(), "250102030405");
    }

    #[test]
    fn test_compact_timestamp_century_rollover() {
        assert_eq!(
            CompactTimestamp(datetime!(2000-12-31 23:59:59)).to_string(),
            "001231235959"
        );
        assert_eq!(
            CompactTimestamp(datetime!(2107-07-07 07:07:07)).to_string(),
            "070707070707"
        );
    }

    #[test]
    fn test_csv_formatter() {
        let record = SignalRecord {
            mac: TEST_MAC,
            rssi: -67,
            timestamp: datetime!(2025-06-15 12:00:30),
        };
        assert_eq!(
            CsvFormatter.format(&record),
            "AA:BB:CC:DD:EE:FF,-67,250615120030"
        );
    }

    #[test]
    fn test_csv_formatter_positive_rssi() {
        let record = SignalRecord {
            mac: TEST_MAC,
            rssi: 4,
            timestamp: datetime!(2025-06-15 12:00:30),
        };
        assert!(CsvFormatter.format(&record).contains(",4,"));
    }
}
