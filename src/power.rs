//! Suspending sleep.
//!
//! A suspend throws away all process memory: the process waits out the
//! interval and then re-executes itself from the top with the same
//! arguments. A marker file written just before records the length of the
//! suspend, which tells the next start that it is a resume rather than a
//! power-on and how far to move the restored clock forward.

use crate::storage::{self, StorageError};
use log::{info, warn};
use std::future::Future;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use thiserror::Error;

/// A marker older than the suspend it records plus this is left over from a
/// process that never came back, not from a suspend.
pub const RESUME_GRACE: Duration = Duration::from_secs(300);

/// Why the process is starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetCause {
    PowerOn,
    /// Restarted after a suspend that lasted `slept`.
    SuspendResume { slept: Duration },
}

/// A suspend could not be performed.
#[derive(Error, Debug)]
pub enum SuspendError {
    #[error("cannot arm resume marker: {0}")]
    Arm(#[from] StorageError),
    #[error("cannot locate own executable: {0}")]
    CurrentExe(#[source] io::Error),
    #[error("cannot restart after suspend: {0}")]
    Exec(#[source] io::Error),
}

/// Performs suspends and recognises the restart that follows one.
#[derive(Debug, Clone)]
pub struct Suspender {
    marker: PathBuf,
}

impl Suspender {
    pub fn new(marker: impl Into<PathBuf>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn marker(&self) -> &Path {
        &self.marker
    }

    /// Determine the reset cause and consume the resume marker.
    ///
    /// An unreadable or stale marker is reported as a power-on.
    pub fn detect_reset_cause(&self) -> ResetCause {
        let contents = match storage::read_optional(&self.marker) {
            Ok(Some(contents)) => contents,
            Ok(None) => return ResetCause::PowerOn,
            Err(e) => {
                warn!("{e}, assuming power-on");
                self.disarm();
                return ResetCause::PowerOn;
            }
        };
        let age = storage::age(&self.marker);
        self.disarm();

        let Ok(millis) = contents.trim().parse::<u64>() else {
            warn!("invalid resume marker {:?}, assuming power-on", contents.trim());
            return ResetCause::PowerOn;
        };
        let slept = Duration::from_millis(millis);

        match age {
            Ok(age) if age > slept.saturating_add(RESUME_GRACE) => {
                warn!("resume marker is {age:?} old, assuming power-on");
                ResetCause::PowerOn
            }
            _ => ResetCause::SuspendResume { slept },
        }
    }

    /// Write the resume marker for a suspend of `duration`.
    pub fn arm(&self, duration: Duration) -> Result<(), SuspendError> {
        storage::replace(&self.marker, &duration.as_millis().to_string())?;
        Ok(())
    }

    fn disarm(&self) {
        if let Err(e) = storage::remove_if_exists(&self.marker) {
            warn!("{e}");
        }
    }

    /// Suspend for `duration`, then restart the process.
    ///
    /// Returns `Ok(())` if `shutdown` completes first; the marker is removed
    /// and the caller should exit cleanly. Otherwise only returns if the
    /// restart fails, again with the marker removed so the next start is not
    /// mistaken for a resume.
    pub async fn suspend<F>(&self, duration: Duration, shutdown: F) -> Result<(), SuspendError>
    where
        F: Future<Output = ()>,
    {
        let exe = std::env::current_exe().map_err(SuspendError::CurrentExe)?;
        self.arm(duration)?;

        info!("suspending for {duration:?}");
        tokio::select! {
            biased;
            _ = shutdown => {
                info!("interrupted while suspended");
                self.disarm();
                return Ok(());
            }
            _ = tokio::time::sleep(duration) => {}
        }

        let err = Command::new(exe).args(std::env::args_os().skip(1)).exec();
        self.disarm();
        Err(SuspendError::Exec(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::SystemTime;
    use tokio::sync::oneshot;
    use tokio_test::{assert_pending, assert_ready, task};

    fn suspender(dir: &tempfile::TempDir) -> Suspender {
        Suspender::new(dir.path().join("suspended"))
    }

    #[test]
    fn test_power_on_without_marker() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(suspender(&dir).detect_reset_cause(), ResetCause::PowerOn);
    }

    #[test]
    fn test_resume_consumes_marker_and_reports_length() {
        let dir = tempfile::tempdir().unwrap();
        let suspender = suspender(&dir);

        suspender.arm(Duration::from_secs(55)).unwrap();
        assert!(suspender.marker().exists());

        assert_eq!(
            suspender.detect_reset_cause(),
            ResetCause::SuspendResume {
                slept: Duration::from_secs(55)
            }
        );
        assert!(!suspender.marker().exists());
        assert_eq!(suspender.detect_reset_cause(), ResetCause::PowerOn);
    }

    #[test]
    fn test_stale_marker_is_power_on() {
        let dir = tempfile::tempdir().unwrap();
        let suspender = suspender(&dir);
        suspender.arm(Duration::from_secs(55)).unwrap();

        let an_hour_ago = SystemTime::now() - Duration::from_secs(3600);
        File::options()
            .write(true)
            .open(suspender.marker())
            .unwrap()
            .set_modified(an_hour_ago)
            .unwrap();

        assert_eq!(suspender.detect_reset_cause(), ResetCause::PowerOn);
        assert!(!suspender.marker().exists());
    }

    #[test]
    fn test_garbled_marker_is_power_on() {
        let dir = tempfile::tempdir().unwrap();
        let suspender = suspender(&dir);
        std::fs::write(suspender.marker(), "soon").unwrap();

        assert_eq!(suspender.detect_reset_cause(), ResetCause::PowerOn);
        assert!(!suspender.marker().exists());
    }

    #[test]
    fn test_arm_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let suspender = Suspender::new(dir.path().join("missing").join("suspended"));
        assert!(matches!(
            suspender.arm(Duration::from_secs(1)),
            Err(SuspendError::Arm(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_while_suspended_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let suspender = suspender(&dir);
        let (stop, stopped) = oneshot::channel::<()>();

        let mut suspend = task::spawn(suspender.suspend(Duration::from_secs(55), async {
            let _ = stopped.await;
        }));
        assert_pending!(suspend.poll());
        assert!(suspender.marker().exists());

        stop.send(()).unwrap();
        assert!(suspend.is_woken());
        assert!(matches!(assert_ready!(suspend.poll()), Ok(())));
        assert!(!suspender.marker().exists());
    }
}
