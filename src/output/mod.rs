//! Output formatting and the append-only record log.
//!
//! A formatter turns a [`SignalRecord`] into one line of text; the
//! [`LogWriter`] appends those lines durably to the record log.

pub mod csv;
pub mod log_file;

pub use log_file::LogWriter;

use crate::record::SignalRecord;

/// Trait for formatting records into output lines.
pub trait OutputFormatter: Send + Sync {
    /// Format a record as a single line without the trailing newline.
    fn format(&self, record: &SignalRecord) -> String;
}
