//! Worker and listener identifier types

use core::fmt;

/// Identifier of a worker descriptor
///
/// This is the stable index of the descriptor in the registry arena.
/// Ids are never reused for a different descriptor; a retired descriptor
/// keeps its id when it is popped from the reuse chain.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct WorkerId(u32);

impl WorkerId {
    /// Create a new WorkerId from a raw value
    #[inline]
    pub const fn new(id: u32) -> Self {
        WorkerId(id)
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Get as usize for indexing link tables and the arena
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for WorkerId {
    #[inline]
    fn from(id: u32) -> Self {
        WorkerId(id)
    }
}

impl From<WorkerId> for u32 {
    #[inline]
    fn from(id: WorkerId) -> Self {
        id.0
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerId({})", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Identifier of a listener (one per configured network path)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ListenerId(u16);

impl ListenerId {
    #[inline]
    pub const fn new(id: u16) -> Self {
        ListenerId(id)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerId({})", self.0)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l{}", self.0)
    }
}
