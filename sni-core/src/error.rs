//! Error types for the device layer.

use std::io;

use thiserror::Error;

use crate::capability::Capability;

/// Errors that can occur while talking to SNES devices.
#[derive(Error, Debug)]
pub enum SniError {
    #[error("no device found: {0}")]
    NoDevice(String),

    #[error("missing capability: {0:?}")]
    MissingCapability(Capability),

    #[error("driver not found: {0}")]
    DriverNotFound(String),

    #[error("invalid device locator: {0}")]
    InvalidLocator(String),

    #[error("address ${0:06X} has no mapping in the target address space")]
    UnmappedAddress(u32),

    #[error("no downstream device assigned")]
    NoDownstream,

    #[error("device connection closed")]
    Closed,

    #[error("operation timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("I/O error: {0}")]
    Io(io::Error),

    /// The caller's own reader or writer failed during a file transfer.
    #[error("local stream error: {0}")]
    Stream(io::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SniError {
    /// Whether this error means the backend connection can no longer be used.
    pub fn is_transport(&self) -> bool {
        matches!(self, SniError::Io(_) | SniError::Closed)
    }
}

impl From<io::Error> for SniError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => SniError::Timeout,
            io::ErrorKind::UnexpectedEof => SniError::Closed,
            _ => SniError::Io(e),
        }
    }
}

/// Result type for device operations.
pub type SniResult<T> = Result<T, SniError>;
