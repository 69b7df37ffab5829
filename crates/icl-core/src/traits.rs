//! Collaborator traits
//!
//! These traits define the interface between the listener/worker machinery
//! and the things it does not own: the network transport, the request
//! Dispatcher, and the management console.

use core::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{DispatchError, RegistryError, TransportError};
use crate::frame::TaskCode;
use crate::id::{ListenerId, WorkerId};
use crate::state::ShutdownState;

/// Timeout for each `send_within` step of a blocking `send`
const SEND_SLICE: Duration = Duration::from_secs(1);

/// Address of a connected peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Inet(SocketAddr),
    /// Non-IP transports (in-memory, local sockets)
    Local(String),
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Inet(addr) => write!(f, "{}", addr),
            PeerAddr::Local(name) => write!(f, "local:{}", name),
        }
    }
}

/// Connection-level options applied after accept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    NoDelay(bool),
    KeepAlive(bool),
    RecvBufferSize(usize),
    SendBufferSize(usize),
    Linger(Option<Duration>),
}

/// A newly accepted connection
pub struct Accepted {
    pub connection: Box<dyn Connection>,
    pub peer: PeerAddr,
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted").field("peer", &self.peer).finish_non_exhaustive()
    }
}

/// Accepts connections on one network path
pub trait Acceptor: Send {
    /// Wait up to `timeout` for a connection.
    ///
    /// `TransportError::Timeout` means nothing arrived; the caller polls
    /// its shutdown state and tries again.
    fn accept(&mut self, timeout: Duration) -> Result<Accepted, TransportError>;

    /// Stop accepting. Later `accept` calls return `TransportError::Closed`.
    fn close(&mut self);
}

/// One client connection
pub trait Connection: Send {
    /// Fill `buf` completely or fail.
    ///
    /// Errors that carry `received` leave the first `received` bytes of
    /// `buf` filled; the caller may resume with `&mut buf[received..]`.
    fn receive_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), TransportError>;

    /// Send from `buf` for at most `timeout`.
    ///
    /// Errors that carry progress count the bytes of `buf` already sent;
    /// the caller may resume with `&buf[sent..]`. An out-of-band wake
    /// ends a blocked send with `Interrupted`.
    fn send_within(&mut self, buf: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Send the whole buffer, waiting as long as the peer needs
    fn send(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        let mut sent = 0;
        loop {
            match self.send_within(&buf[sent..], SEND_SLICE) {
                Err(TransportError::Timeout { received }) => sent += received,
                other => return other,
            }
        }
    }

    fn set_option(&mut self, option: SocketOption) -> Result<(), TransportError>;

    /// Handle another thread can use to interrupt a blocked receive or send
    fn out_of_band(&self) -> Arc<dyn OutOfBand>;

    /// Close the connection. Idempotent.
    fn close(&mut self);
}

/// Out-of-band wake for a connection
pub trait OutOfBand: Send + Sync {
    /// Interrupt any blocked or future receive or send on the connection
    fn signal(&self);
}

/// Per-request context handed to the Dispatcher
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext<'a> {
    pub worker: WorkerId,
    pub listener: ListenerId,
    pub path: &'a str,
    pub client_sequence: u64,
    pub peer: &'a PeerAddr,
    pub task: TaskCode,
}

/// Outcome of a processed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep serving this client
    Continue,
    /// Client is done; close after sending the response
    Finished,
}

/// Database engine entry point
pub trait Dispatcher: Send + Sync {
    /// Process one complete request packet and write the response packet
    /// into `response` (cleared by the caller).
    fn process(
        &self,
        ctx: &DispatchContext<'_>,
        request: &[u8],
        response: &mut Vec<u8>,
    ) -> Result<Disposition, DispatchError>;
}

/// Management console collaborator
pub trait ManagementNotifier: Send + Sync {
    /// A listener finished its shutdown sequence
    fn listener_terminated(&self, listener: ListenerId, mode: ShutdownState);

    /// Last worker left the assigned chain during shutdown
    fn server_drained(&self);

    /// An internal invariant violation forced an immediate shutdown
    fn internal_fault(&self, err: &RegistryError);
}

/// Notifier that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl ManagementNotifier for NullNotifier {
    fn listener_terminated(&self, _listener: ListenerId, _mode: ShutdownState) {}
    fn server_drained(&self) {}
    fn internal_fault(&self, _err: &RegistryError) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_display() {
        let p = PeerAddr::Inet("127.0.0.1:4000".parse().unwrap());
        assert_eq!(p.to_string(), "127.0.0.1:4000");
        assert_eq!(PeerAddr::Local("c1".into()).to_string(), "local:c1");
    }

    #[test]
    fn test_null_notifier_object_safe() {
        let n: Arc<dyn ManagementNotifier> = Arc::new(NullNotifier);
        n.server_drained();
        n.listener_terminated(ListenerId::new(0), ShutdownState::Graceful);
    }
}
