//! Descriptor lifecycle, shutdown state and activity kinds

use core::fmt;

use crate::error::RegistryError;

/// Lifecycle state of a worker descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    /// Created or popped from a chain, not yet bound to a client
    Initializing = 0,

    /// Parked on the free chain waiting for the next client
    FreeUnassigned = 1,

    /// On the assigned chain, serving a client
    ClientAssigned = 2,

    /// Retired after a normal end of service
    Closed = 3,

    /// Retired because a graceful shutdown was directed
    ShuttingDownGraceful = 4,

    /// Retired because an immediate shutdown was directed
    ShuttingDownImmediate = 5,

    /// Retired after a fatal transport, framing or dispatch error
    DownedError = 6,
}

impl Lifecycle {
    /// Check if this is one of the retired states a reuse-chain member carries
    #[inline]
    pub const fn is_retired(&self) -> bool {
        matches!(
            self,
            Lifecycle::Closed
                | Lifecycle::ShuttingDownGraceful
                | Lifecycle::ShuttingDownImmediate
                | Lifecycle::DownedError
        )
    }

    /// Retired state matching a shutdown mode
    #[inline]
    pub const fn for_shutdown(mode: ShutdownState) -> Lifecycle {
        match mode {
            ShutdownState::Active => Lifecycle::Closed,
            ShutdownState::Graceful => Lifecycle::ShuttingDownGraceful,
            ShutdownState::Immediate => Lifecycle::ShuttingDownImmediate,
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Initializing => "initializing",
            Lifecycle::FreeUnassigned => "free",
            Lifecycle::ClientAssigned => "assigned",
            Lifecycle::Closed => "closed",
            Lifecycle::ShuttingDownGraceful => "shutting-down-graceful",
            Lifecycle::ShuttingDownImmediate => "shutting-down-immediate",
            Lifecycle::DownedError => "downed-error",
        };
        f.write_str(s)
    }
}

/// Shutdown state of the server, a listener, or a single descriptor
///
/// Values are ordered: a state may only be escalated
/// (`Active < Graceful < Immediate`), never relaxed, until the owner is
/// explicitly reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ShutdownState {
    /// Normal operation
    Active = 0,

    /// Finish the current client (or request) then terminate
    Graceful = 1,

    /// Terminate without finishing the current client
    Immediate = 2,
}

/// Per-descriptor shutdown directive. Same values as the listener state,
/// posted asynchronously by another actor.
pub type ShutdownDirective = ShutdownState;

impl ShutdownState {
    #[inline]
    pub const fn is_active(&self) -> bool {
        matches!(self, ShutdownState::Active)
    }

    #[inline]
    pub const fn is_shutting_down(&self) -> bool {
        !self.is_active()
    }

    #[inline]
    pub fn escalate(self, other: ShutdownState) -> ShutdownState {
        self.max(other)
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        ShutdownState::Active
    }
}

impl TryFrom<u8> for ShutdownState {
    type Error = RegistryError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(ShutdownState::Active),
            1 => Ok(ShutdownState::Graceful),
            2 => Ok(ShutdownState::Immediate),
            other => Err(RegistryError::InvalidShutdownValue(other)),
        }
    }
}

impl From<ShutdownState> for u8 {
    fn from(s: ShutdownState) -> u8 {
        s as u8
    }
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownState::Active => write!(f, "active"),
            ShutdownState::Graceful => write!(f, "graceful"),
            ShutdownState::Immediate => write!(f, "immediate"),
        }
    }
}

/// Kind of activity that owns a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActivityKind {
    Worker = 0,
    Listener = 1,
    ConsoleHandler = 2,
    SecurityMonitor = 3,
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityKind::Worker => write!(f, "WORKER"),
            ActivityKind::Listener => write!(f, "LISTENER"),
            ActivityKind::ConsoleHandler => write!(f, "CONSOLE"),
            ActivityKind::SecurityMonitor => write!(f, "SECURITY"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_ordering() {
        assert!(ShutdownState::Active < ShutdownState::Graceful);
        assert!(ShutdownState::Graceful < ShutdownState::Immediate);
        assert_eq!(
            ShutdownState::Immediate.escalate(ShutdownState::Graceful),
            ShutdownState::Immediate
        );
        assert_eq!(
            ShutdownState::Active.escalate(ShutdownState::Graceful),
            ShutdownState::Graceful
        );
    }

    #[test]
    fn test_shutdown_decode() {
        for s in [ShutdownState::Active, ShutdownState::Graceful, ShutdownState::Immediate] {
            assert_eq!(ShutdownState::try_from(u8::from(s)).unwrap(), s);
        }
        assert!(matches!(
            ShutdownState::try_from(7),
            Err(RegistryError::InvalidShutdownValue(7))
        ));
    }

    #[test]
    fn test_lifecycle_retired() {
        assert!(Lifecycle::Closed.is_retired());
        assert!(Lifecycle::DownedError.is_retired());
        assert!(!Lifecycle::FreeUnassigned.is_retired());
        assert!(!Lifecycle::ClientAssigned.is_retired());
        assert_eq!(
            Lifecycle::for_shutdown(ShutdownState::Immediate),
            Lifecycle::ShuttingDownImmediate
        );
    }
}
