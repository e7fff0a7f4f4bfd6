//! Daemon error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned to IPC callers and propagated between subsystems.
///
/// Background workers (probe, housekeeping) log and swallow recoverable
/// variants; external operations return them to the caller verbatim.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum Error {
    /// The policy authority denied the request.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// The user dismissed the authentication dialog.
    #[error("not authorized (dismissed): {0}")]
    NotAuthorizedDismissed(String),

    /// Authorization could be obtained through an authentication challenge.
    #[error("not authorized (can obtain): {0}")]
    NotAuthorizedCanObtain(String),

    /// Operation does not apply to this object in its current state.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Caller asked for an option outside the permitted set.
    #[error("option not permitted: {0}")]
    OptionNotPermitted(String),

    /// Target still in use (mounted, unlocked, array running).
    #[error("device busy: {0}")]
    DeviceBusy(String),

    /// Housekeeping declined to wake a sleeping device.
    #[error("would wake up device: {0}")]
    WouldWakeUp(String),

    /// The cancel token fired.
    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl Error {
    /// Recoverable classes that housekeeping downgrades to info.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::WouldWakeUp(_) | Error::DeviceBusy(_) | Error::Cancelled
        )
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Error::Failed(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Failed(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Failed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Release-safe invariant check. Debug builds assert; release builds log
/// and continue.
#[macro_export]
macro_rules! anomaly_if {
    ($cond:expr, $($arg:tt)*) => {
        if $cond {
            debug_assert!(false, $($arg)*);
            tracing::warn!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_roundtrip() {
        let e = Error::DeviceBusy("/dev/sda1 is mounted".into());
        let json = serde_json::to_string(&e).unwrap();
        let back: Error = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Error::DeviceBusy(_)));
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::WouldWakeUp("sda".into()).is_recoverable());
        assert!(!Error::NotAuthorized("x".into()).is_recoverable());
    }
}
