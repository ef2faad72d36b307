//! `rssi-logger` library.
//!
//! The binary (`src/main.rs`) is responsible for logging setup, signal handling,
//! suspends and process exit codes. The scan cycle itself lives in
//! [`crate::app`] where it can be tested deterministically with an injected
//! scan provider and time source.

pub mod advertising;
pub mod aggregator;
pub mod app;
pub mod clock;
pub mod duration;
pub mod mac_address;
pub mod output;
pub mod power;
pub mod record;
pub mod scanner;
pub mod storage;
pub mod time_source;
pub mod whitelist;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use advertising::{Advertisement, parse_local_name};
pub use aggregator::{Rssi, SignalAggregator};
pub use app::{Controller, CycleState, Exit, Options, RunError};
pub use clock::Rtc;
pub use duration::parse_duration;
pub use mac_address::MacAddress;
pub use output::{LogWriter, OutputFormatter};
pub use power::{ResetCause, Suspender};
pub use record::SignalRecord;
pub use scanner::{Backend, Observation, ScanError, ScanParams, ScanProvider};
pub use time_source::{SntpTimeSource, TimeSource, TimeSyncError};
pub use whitelist::{Whitelist, WhitelistMode};
