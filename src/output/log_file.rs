//! Append-only record log.

use crate::output::OutputFormatter;
use crate::output::csv::CsvFormatter;
use crate::record::SignalRecord;
use crate::storage::{self, StorageError};
use std::path::{Path, PathBuf};

/// Appends one formatted line per record to a file.
///
/// Every append opens the file, writes, syncs and closes it again, so a
/// record that was reported as written survives a power cut.
pub struct LogWriter {
    path: PathBuf,
    formatter: Box<dyn OutputFormatter>,
}

impl LogWriter {
    /// Create a writer using the standard `ADDR,RSSI,YYMMDDHHMMSS` format.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_formatter(path, Box::new(CsvFormatter))
    }

    pub fn with_formatter(path: impl Into<PathBuf>, formatter: Box<dyn OutputFormatter>) -> Self {
        Self {
            path: path.into(),
            formatter,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record.
    ///
    /// # Errors
    /// Returns a `StorageError` if the file cannot be opened or written.
    pub fn append(&self, record: &SignalRecord) -> Result<(), StorageError> {
        let line = self.formatter.format(record);
        storage::append_line(&self.path, &line)
    }
}
