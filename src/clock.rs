//! Real-time clock and its persistence across restarts.
//!
//! The clock lives in memory and is lost on every restart or suspend. Its
//! value can be saved to a file as epoch seconds and loaded again at startup,
//! and corrected from a [`TimeSource`] when one is reachable.

use crate::storage::{self, StorageError};
use crate::time_source::{TimeSource, TimeSyncError};
use log::{debug, info, warn};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use time::macros::datetime;
use time::{OffsetDateTime, PrimitiveDateTime};
use tokio::time::Instant;

/// Clock value used before anything better is known.
pub const DEFAULT_DATETIME: PrimitiveDateTime = datetime!(2000-01-01 0:00);

/// Errors from clock persistence.
#[derive(Error, Debug)]
pub enum ClockError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("invalid epoch value in clock file: {0:?}")]
    Format(String),
}

/// In-memory real-time clock.
///
/// Holds a calendar date-time and the monotonic instant it was set at; the
/// reading advances with monotonic time from there.
#[derive(Debug, Clone, Copy)]
pub struct Rtc {
    base: PrimitiveDateTime,
    set_at: Instant,
}

impl Default for Rtc {
    fn default() -> Self {
        Self::new(DEFAULT_DATETIME)
    }
}

impl Rtc {
    pub fn new(now: PrimitiveDateTime) -> Self {
        Self {
            base: now,
            set_at: Instant::now(),
        }
    }

    /// Overwrite the clock.
    pub fn set(&mut self, now: PrimitiveDateTime) {
        *self = Self::new(now);
    }

    /// Move the clock forward by time that passed while it was not running.
    pub fn advance(&mut self, by: Duration) {
        self.base += by;
    }

    /// Current reading.
    pub fn now(&self) -> PrimitiveDateTime {
        self.base + self.set_at.elapsed()
    }
}

/// Convert a wall-clock reading to epoch seconds, treating it as UTC.
pub fn to_epoch(dt: PrimitiveDateTime) -> i64 {
    dt.assume_utc().unix_timestamp()
}

/// Convert epoch seconds back to a wall-clock reading.
pub fn from_epoch(epoch: i64) -> Option<PrimitiveDateTime> {
    OffsetDateTime::from_unix_timestamp(epoch)
        .ok()
        .map(|t| PrimitiveDateTime::new(t.date(), t.time()))
}

/// Persist the current clock reading as epoch seconds.
///
/// # Errors
/// Returns `ClockError::Storage` if the file cannot be written.
pub fn save(rtc: &Rtc, path: &Path) -> Result<i64, ClockError> {
    let epoch = to_epoch(rtc.now());
    storage::replace(path, &epoch.to_string())?;
    debug!("saved clock to {}: {epoch}", path.display());
    Ok(epoch)
}

/// Load a persisted clock reading.
///
/// Returns `Ok(None)` if the file does not exist.
///
/// # Errors
/// `ClockError::Format` if the contents are not an epoch integer in range,
/// `ClockError::Storage` if the file exists but cannot be read.
pub fn load(path: &Path) -> Result<Option<PrimitiveDateTime>, ClockError> {
    let Some(text) = storage::read_optional(path)? else {
        return Ok(None);
    };
    let trimmed = text.trim();
    trimmed
        .parse::<i64>()
        .ok()
        .and_then(from_epoch)
        .map(Some)
        .ok_or_else(|| ClockError::Format(trimmed.to_string()))
}

/// Seed `rtc` from the clock file, keeping its current value if the file is
/// missing or unusable.
///
/// Returns `true` if a persisted value was applied.
pub fn restore(rtc: &mut Rtc, path: &Path) -> bool {
    match load(path) {
        Ok(Some(dt)) => {
            rtc.set(dt);
            info!("loaded clock from {}: {dt}", path.display());
            true
        }
        Ok(None) => {
            info!("no saved clock at {}, using {}", path.display(), rtc.now());
            false
        }
        Err(e) => {
            warn!("{e}, using {}", rtc.now());
            false
        }
    }
}

/// Query `source` and, on success, overwrite `rtc` with the result.
///
/// The source is always disconnected afterwards. On failure the clock is left
/// untouched.
///
/// # Errors
/// Returns the `TimeSyncError` of the failing step, or `Timeout` if connect
/// and query together take longer than `timeout`.
pub async fn set_from_time_source(
    rtc: &mut Rtc,
    source: &mut dyn TimeSource,
    timeout: Duration,
) -> Result<PrimitiveDateTime, TimeSyncError> {
    let result = tokio::time::timeout(timeout, async {
        source.connect().await?;
        source.query_time().await
    })
    .await
    .unwrap_or(Err(TimeSyncError::Timeout));
    source.disconnect();

    let now = result?;
    rtc.set(now);
    Ok(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_source::TimeFuture;

    struct FakeTimeSource {
        answer: Option<PrimitiveDateTime>,
        hang: bool,
        disconnected: bool,
    }

    impl FakeTimeSource {
        fn new(answer: Option<PrimitiveDateTime>) -> Self {
            Self {
                answer,
                hang: false,
                disconnected: false,
            }
        }
    }

    impl TimeSource for FakeTimeSource {
        fn connect(&mut self) -> TimeFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn query_time(&mut self) -> TimeFuture<'_, PrimitiveDateTime> {
            Box::pin(async move {
                if self.hang {
                    std::future::pending::<()>().await;
                }
                self.answer
                    .ok_or_else(|| TimeSyncError::Query("unreachable".into()))
            })
        }

        fn disconnect(&mut self) {
            self.disconnected = true;
        }
    }

    #[test]
    fn test_epoch_round_trip() {
        for dt in [
            DEFAULT_DATETIME,
            datetime!(2025-01-01 12:00:00),
            datetime!(2038-01-19 03:14:08),
            datetime!(1999-12-31 23:59:59),
        ] {
            assert_eq!(from_epoch(to_epoch(dt)), Some(dt));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtc_advances_with_monotonic_time() {
        let rtc = Rtc::new(datetime!(2025-01-01 12:00:00));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(rtc.now(), datetime!(2025-01-01 12:01:01));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtc_advance_adds_time_spent_stopped() {
        let mut rtc = Rtc::new(datetime!(2025-01-01 12:00:05));
        rtc.advance(Duration::from_secs(55));
        assert_eq!(rtc.now(), datetime!(2025-01-01 12:01:00));
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtc_time.txt");
        let rtc = Rtc::new(datetime!(2025-03-04 05:06:07));

        let epoch = save(&rtc, &path).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), epoch.to_string());
        assert_eq!(load(&path).unwrap(), Some(datetime!(2025-03-04 05:06:07)));
    }

    #[test]
    fn test_load_missing_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("rtc_time.txt")).unwrap().is_none());
    }

    #[test]
    fn test_load_tolerates_surrounding_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtc_time.txt");
        std::fs::write(&path, " 1735732800\n").unwrap();
        assert_eq!(load(&path).unwrap(), Some(datetime!(2025-01-01 12:00:00)));
    }

    #[test]
    fn test_load_not_a_number_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtc_time.txt");
        std::fs::write(&path, "not-a-number").unwrap();
        assert!(matches!(load(&path), Err(ClockError::Format(s)) if s == "not-a-number"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_falls_back_to_current_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtc_time.txt");
        std::fs::write(&path, "not-a-number").unwrap();

        let mut rtc = Rtc::default();
        assert!(!restore(&mut rtc, &path));
        assert_eq!(rtc.now(), DEFAULT_DATETIME);
    }

    #[test]
    fn test_save_to_unwritable_path_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("rtc_time.txt");
        assert!(matches!(
            save(&Rtc::default(), &path),
            Err(ClockError::Storage(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_success_sets_clock() {
        let mut rtc = Rtc::default();
        let mut source = FakeTimeSource::new(Some(datetime!(2025-01-01 12:00:00)));

        let now = set_from_time_source(&mut rtc, &mut source, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(now, datetime!(2025-01-01 12:00:00));
        assert_eq!(rtc.now(), now);
        assert!(source.disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_failure_leaves_clock() {
        let mut rtc = Rtc::new(datetime!(2024-05-05 05:05:05));
        let mut source = FakeTimeSource::new(None);

        let result = set_from_time_source(&mut rtc, &mut source, Duration::from_secs(5)).await;

        assert!(matches!(result, Err(TimeSyncError::Query(_))));
        assert_eq!(rtc.now(), datetime!(2024-05-05 05:05:05));
        assert!(source.disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_timeout() {
        let mut rtc = Rtc::default();
        let mut source = FakeTimeSource::new(Some(datetime!(2025-01-01 12:00:00)));
        source.hang = true;

        let result = set_from_time_source(&mut rtc, &mut source, Duration::from_secs(5)).await;

        assert!(matches!(result, Err(TimeSyncError::Timeout)));
        assert!(source.disconnected);
    }
}
