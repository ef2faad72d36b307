//! Network time sources used to correct the real-time clock.

pub mod sntp;

pub use sntp::SntpTimeSource;

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use time::PrimitiveDateTime;

/// Why a time synchronisation attempt failed. Always recoverable.
#[derive(Error, Debug)]
pub enum TimeSyncError {
    #[error("time source unreachable: {0}")]
    Connect(String),
    #[error("time query failed: {0}")]
    Query(String),
    #[error("time sync timed out")]
    Timeout,
    #[error("invalid time response: {0}")]
    InvalidResponse(String),
}

/// Boxed future returned by [`TimeSource`] methods.
pub type TimeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TimeSyncError>> + Send + 'a>>;

/// Source of wall-clock time, e.g. an SNTP server.
///
/// Calls are made in the order `connect`, `query_time`, `disconnect`;
/// `disconnect` is called even when an earlier step failed.
pub trait TimeSource: Send {
    fn connect(&mut self) -> TimeFuture<'_, ()>;

    fn query_time(&mut self) -> TimeFuture<'_, PrimitiveDateTime>;

    fn disconnect(&mut self);
}
