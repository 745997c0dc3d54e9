use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the tracking and index engines.
#[derive(Debug, Error)]
pub enum Error {
    /// Rejected at construction time, never coerced.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("index is not trained")]
    NotTrained,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The device stream did not raise the completion flag in time.
    /// Always fatal to the calling operation; never retried internally.
    #[error("device {device_id} did not signal completion within {timeout:?}")]
    DeviceTimeout { device_id: u32, timeout: Duration },

    #[error("device stream is closed")]
    DeviceClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("snapshot codec: {0}")]
    Snapshot(String),
}

pub type Result<T> = std::result::Result<T, Error>;
