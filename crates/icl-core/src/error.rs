//! Error types for the listener, worker pool and registry

use std::io;

use thiserror::Error;

use crate::id::{ListenerId, WorkerId};

/// Result type for server-level operations
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors reported by a transport primitive
///
/// Receive and send failures carry the number of bytes already
/// transferred so the caller can resume where it stopped.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No (further) progress within the timeout
    #[error("timed out after {received} bytes")]
    Timeout { received: usize },

    /// Peer closed its side of the connection
    #[error("peer closed after {received} bytes")]
    PeerClosed { received: usize },

    /// Operation interrupted by an out-of-band wake
    #[error("interrupted after {received} bytes")]
    Interrupted { received: usize },

    /// Acceptor has been closed
    #[error("acceptor closed")]
    Closed,

    /// Peer aborted the connection during accept
    #[error("connection aborted during accept")]
    Aborted,

    /// Any other I/O failure
    #[error("transport failure: {0}")]
    Failed(#[from] io::Error),
}

impl TransportError {
    /// Bytes transferred before the error, if the error carries progress
    #[inline]
    pub fn received(&self) -> usize {
        match self {
            TransportError::Timeout { received }
            | TransportError::PeerClosed { received }
            | TransportError::Interrupted { received } => *received,
            _ => 0,
        }
    }

    /// Accept loop treats these as "try again"
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. }
                | TransportError::Interrupted { .. }
                | TransportError::Aborted
        )
    }
}

/// Framing violations detected on a request packet
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("bad protocol tag {found:#04x}")]
    BadTag { found: u8, declared_len: u32 },

    #[error("declared length {len} outside [{min}, {max}]")]
    LengthOutOfRange { len: u32, min: u32, max: u32 },

    #[error("packet truncated: have {have} of {need} bytes")]
    Truncated { have: usize, need: usize },
}

/// Shape violations in a pre-authentication request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("declared length {declared} does not match buffer length {actual}")]
    LengthMismatch { declared: u32, actual: usize },

    #[error("field {field}: negative length {len}")]
    NegativeLength { field: &'static str, len: i32 },

    #[error("field {field}: length {len} exceeds remaining {remaining} bytes")]
    Overrun { field: &'static str, len: usize, remaining: usize },

    #[error("field {field}: length {len} exceeds limit {limit}")]
    TooLarge { field: &'static str, len: usize, limit: usize },

    #[error("field {field}: missing")]
    Missing { field: &'static str },

    #[error("{extra} trailing bytes after last field")]
    TrailingBytes { extra: usize },

    #[error("task {0:#06x} is not a pre-authentication request")]
    NotPreAuth(u16),
}

/// Failure reported by the Dispatcher
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("dispatcher failure: {0}")]
    Internal(String),
}

/// Registry failures and internal invariant violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Descriptor ceiling reached and the reuse chain is empty
    #[error("descriptor ceiling {0} reached")]
    DescriptorCeiling(usize),

    /// Listener or descriptor is not active
    #[error("shutdown in progress")]
    ShuttingDown,

    /// Descriptor was expected on a chain but is not linked
    #[error("{id} is not on the {chain} chain")]
    NotLinked { id: WorkerId, chain: &'static str },

    /// Unknown descriptor id
    #[error("unknown descriptor {0}")]
    UnknownDescriptor(WorkerId),

    /// Unknown listener id
    #[error("unknown listener {0}")]
    UnknownListener(ListenerId),

    /// A chain failed its consistency check
    #[error("{chain} chain corrupted: {detail}")]
    ChainCorrupted { chain: &'static str, detail: String },

    /// Stored shutdown value does not decode
    #[error("invalid shutdown state value {0}")]
    InvalidShutdownValue(u8),

    /// Worker thread could not be started
    #[error("failed to spawn worker thread: {0}")]
    SpawnFailed(String),
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },

    #[error("{field} = {value} is below the minimum {min}")]
    TooSmall { field: &'static str, value: usize, min: usize },

    #[error("{lower} ({lo}) must not exceed {upper} ({hi})")]
    Inverted { lower: &'static str, lo: usize, upper: &'static str, hi: usize },

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("no network paths configured")]
    NoPaths,

    #[error("duplicate network path name {0}")]
    DuplicatePath(String),
}

/// Umbrella error for server construction and control
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("failed to spawn {name}: {source}")]
    Spawn { name: String, source: io::Error },

    #[error("server already started")]
    AlreadyStarted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = TransportError::Timeout { received: 3 };
        assert_eq!(e.to_string(), "timed out after 3 bytes");

        let e = RegistryError::NotLinked { id: WorkerId::new(4), chain: "free" };
        assert_eq!(e.to_string(), "w4 is not on the free chain");

        let e = ConfigError::Zero { field: "max_workers" };
        assert_eq!(format!("{}", e), "max_workers must be non-zero");
    }

    #[test]
    fn test_error_conversion() {
        let e: ServerError = RegistryError::DescriptorCeiling(8).into();
        assert!(matches!(e, ServerError::Registry(RegistryError::DescriptorCeiling(8))));

        let io = io::Error::new(io::ErrorKind::Other, "boom");
        let t: TransportError = io.into();
        assert!(matches!(t, TransportError::Failed(_)));
        assert_eq!(t.received(), 0);
        assert!(!t.is_transient());
    }

    #[test]
    fn test_transport_progress() {
        assert_eq!(TransportError::Interrupted { received: 5 }.received(), 5);
        assert!(TransportError::Interrupted { received: 0 }.is_transient());
        assert!(!TransportError::PeerClosed { received: 0 }.is_transient());
    }
}
