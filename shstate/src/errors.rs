use std::{fmt, io};

/// Error type for the sync engine.
///
/// Construction errors are returned to the caller. Errors inside the
/// background workers are logged and swallowed; the workers only exit on
/// shutdown.
#[derive(Debug)]
pub enum ShstateError {
    /// The record type is not record-shaped: scalars and containers are
    /// rejected at engine construction. Carries the offending type name.
    InvalidType(String),
    /// Filesystem or mapping failure: open, truncate, map, flush, lock.
    Io(io::Error),
    /// The encoded payload plus the version header does not fit the region.
    /// The region is left untouched when this is returned.
    TooLarge { required: usize, available: usize },
    /// Record serialization failed.
    Encode(rmp_serde::encode::Error),
    /// Payload deserialization failed. On the subscribe path this is a
    /// transient condition; the next publish corrects it.
    Decode(rmp_serde::decode::Error),
    /// A record or callback mutex was poisoned by a panicking caller thread.
    PoisonedLock,
    /// The engine has been closed; publish and subscribe are no longer valid.
    Closed,
    /// Invalid configuration value.
    Config(String),
}

impl fmt::Display for ShstateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShstateError::InvalidType(name) => {
                write!(f, "invalid record type: {} is not a record-shaped struct", name)
            }
            ShstateError::Io(e) => write!(f, "I/O error: {}", e),
            ShstateError::TooLarge { required, available } => write!(
                f,
                "payload too large for region: required {}, available {}",
                required, available
            ),
            ShstateError::Encode(e) => write!(f, "encode error: {}", e),
            ShstateError::Decode(e) => write!(f, "decode error: {}", e),
            ShstateError::PoisonedLock => write!(f, "mutex was poisoned"),
            ShstateError::Closed => write!(f, "sync engine is closed"),
            ShstateError::Config(s) => write!(f, "invalid configuration: {}", s),
        }
    }
}

impl std::error::Error for ShstateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShstateError::Io(e) => Some(e),
            ShstateError::Encode(e) => Some(e),
            ShstateError::Decode(e) => Some(e),
            ShstateError::InvalidType(_)
            | ShstateError::TooLarge { .. }
            | ShstateError::PoisonedLock
            | ShstateError::Closed
            | ShstateError::Config(_) => None,
        }
    }
}

impl From<io::Error> for ShstateError {
    fn from(err: io::Error) -> Self {
        ShstateError::Io(err)
    }
}

impl From<rmp_serde::encode::Error> for ShstateError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ShstateError::Encode(err)
    }
}

impl From<rmp_serde::decode::Error> for ShstateError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ShstateError::Decode(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for ShstateError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        ShstateError::PoisonedLock
    }
}
