//! Durable file primitives shared by the clock, whitelist and record log.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// A file could not be opened, read or written.
#[derive(Error, Debug)]
#[error("storage error on {}: {source}", path.display())]
pub struct StorageError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl StorageError {
    fn new(path: &Path, source: io::Error) -> Self {
        Self {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Returns `true` if the underlying cause is a missing file.
    pub fn is_not_found(&self) -> bool {
        self.source.kind() == io::ErrorKind::NotFound
    }
}

/// Read a whole file as UTF-8.
pub fn read_to_string(path: &Path) -> Result<String, StorageError> {
    fs::read_to_string(path).map_err(|e| StorageError::new(path, e))
}

/// Read a whole file, mapping a missing file to `None`.
pub fn read_optional(path: &Path) -> Result<Option<String>, StorageError> {
    match read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Replace the contents of `path` and sync it to disk before returning.
///
/// The new contents go to a sibling temporary file which is then renamed over
/// the target, so a power cut leaves either the old or the new value.
pub fn replace(path: &Path, contents: &str) -> Result<(), StorageError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let write = || -> io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| StorageError::new(path, e))
}

/// Append one line to `path`, creating it if needed, and sync before returning.
pub fn append_line(path: &Path, line: &str) -> Result<(), StorageError> {
    let append = || -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_data()
    };
    append().map_err(|e| StorageError::new(path, e))
}

/// Time since `path` was last modified. A timestamp in the future counts as zero.
pub fn age(path: &Path) -> Result<Duration, StorageError> {
    let modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| StorageError::new(path, e))?;
    Ok(modified.elapsed().unwrap_or_default())
}

/// Remove `path`, returning whether it existed.
pub fn remove_if_exists(path: &Path) -> Result<bool, StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::new(path, e)),
    }
}
