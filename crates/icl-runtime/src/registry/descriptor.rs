//! Worker descriptor

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use icl_core::{
    ActivityKind, Connection, Lifecycle, ListenerId, OutOfBand, PeerAddr, RegistryError,
    ShutdownDirective, StandingBuffer, WorkerId,
};

use crate::shutdown::ShutdownCell;

/// Connection handed from a listener to a worker
pub struct Handoff {
    pub connection: Box<dyn Connection>,
    pub peer: PeerAddr,
    pub listener: ListenerId,
    pub path: Arc<str>,
    pub accepted_at: Instant,
}

impl fmt::Debug for Handoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handoff")
            .field("peer", &self.peer)
            .field("listener", &self.listener)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Network binding of a descriptor while it serves a client
#[derive(Clone)]
pub struct Binding {
    pub peer: PeerAddr,
    pub listener: ListenerId,
    pub path: Arc<str>,
    pub idle_timeout: Option<Duration>,
    pub oob: Arc<dyn OutOfBand>,
    pub connected_at: Instant,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("peer", &self.peer)
            .field("listener", &self.listener)
            .field("path", &self.path)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

/// State guarded by the descriptor lock
#[derive(Debug)]
pub struct DescriptorSlot {
    pub(crate) lifecycle: Lifecycle,
    pub(crate) listener: Option<ListenerId>,
    pub(crate) handoff: Option<Handoff>,
    pub(crate) binding: Option<Binding>,
    pub(crate) standing: Option<StandingBuffer>,
}

impl DescriptorSlot {
    #[inline]
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    #[inline]
    pub fn listener(&self) -> Option<ListenerId> {
        self.listener
    }

    #[inline]
    pub fn has_handoff(&self) -> bool {
        self.handoff.is_some()
    }

    #[inline]
    pub fn take_handoff(&mut self) -> Option<Handoff> {
        self.handoff.take()
    }
}

/// Sets a call flag for the lifetime of the guard
pub struct CallGuard<'a>(&'a AtomicBool);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Worker Description Entry
///
/// Shared by `Arc` between the registry arena, the worker thread that runs
/// it and any listener handing it a client. Fields read by other actors
/// without the lock are atomics; everything else lives in the slot.
pub struct Descriptor {
    id: WorkerId,
    kind: ActivityKind,
    directive: ShutdownCell,
    in_transport: AtomicBool,
    in_dispatcher: AtomicBool,
    client_sequence: AtomicU64,
    requests_served: AtomicU64,
    buffer_allocations: AtomicU32,
    slot: Mutex<DescriptorSlot>,
    pub(crate) wake: Condvar,
}

impl Descriptor {
    /// New worker descriptor with its standing buffer
    pub(crate) fn new_worker(id: WorkerId, standing_size: usize) -> Self {
        let d = Self::bare(id, ActivityKind::Worker);
        d.lock().standing = Some(StandingBuffer::new(standing_size));
        d.buffer_allocations.store(1, Ordering::Relaxed);
        d
    }

    /// Descriptor for a non-worker activity (never chained, no buffer)
    pub(crate) fn new_activity(id: WorkerId, kind: ActivityKind) -> Self {
        Self::bare(id, kind)
    }

    fn bare(id: WorkerId, kind: ActivityKind) -> Self {
        Self {
            id,
            kind,
            directive: ShutdownCell::new(),
            in_transport: AtomicBool::new(false),
            in_dispatcher: AtomicBool::new(false),
            client_sequence: AtomicU64::new(0),
            requests_served: AtomicU64::new(0),
            buffer_allocations: AtomicU32::new(0),
            slot: Mutex::new(DescriptorSlot {
                lifecycle: Lifecycle::Initializing,
                listener: None,
                handoff: None,
                binding: None,
                standing: None,
            }),
            wake: Condvar::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> ActivityKind {
        self.kind
    }

    /// Lock the slot, recovering from a poisoned lock
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, DescriptorSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[inline]
    pub fn directive(&self) -> ShutdownDirective {
        self.directive.load()
    }

    /// Directive, or `InvalidShutdownValue` once if the stored value is corrupt
    #[inline]
    pub fn check_directive(&self) -> Result<ShutdownDirective, RegistryError> {
        self.directive.check()
    }

    #[cfg(test)]
    pub(crate) fn corrupt_directive(&self, raw: u8) {
        self.directive.store_raw(raw);
    }

    #[cfg(test)]
    pub(crate) fn slot_locked(&self) -> bool {
        self.slot.try_lock().is_err()
    }

    /// Post a shutdown directive (escalate only)
    #[inline]
    pub fn direct(&self, mode: ShutdownDirective) {
        self.directive.escalate(mode);
    }

    /// Post a directive and wake the worker if it is parked.
    ///
    /// Taking the slot lock between the store and the notify closes the
    /// window where a parked worker has checked its predicate but not yet
    /// started waiting.
    pub fn direct_and_wake(&self, mode: ShutdownDirective) {
        self.direct(mode);
        drop(self.lock());
        self.wake.notify_all();
    }

    /// Hand a client to the parked worker and wake it
    pub fn deliver(&self, handoff: Handoff) {
        {
            let mut slot = self.lock();
            slot.handoff = Some(handoff);
        }
        self.wake.notify_all();
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lock().lifecycle
    }

    pub fn listener(&self) -> Option<ListenerId> {
        self.lock().listener
    }

    pub fn binding(&self) -> Option<Binding> {
        self.lock().binding.clone()
    }

    pub(crate) fn set_binding(&self, binding: Option<Binding>) {
        self.lock().binding = binding;
    }

    pub(crate) fn take_standing(&self) -> Option<StandingBuffer> {
        self.lock().standing.take()
    }

    /// Back to a fresh state for reuse; buffers and counters are kept
    pub(crate) fn reset_for_reuse(&self, slot: &mut DescriptorSlot) {
        self.directive.reset();
        slot.lifecycle = Lifecycle::Initializing;
        slot.listener = None;
        slot.handoff = None;
        slot.binding = None;
    }

    #[inline]
    pub fn enter_transport(&self) -> CallGuard<'_> {
        self.in_transport.store(true, Ordering::Release);
        CallGuard(&self.in_transport)
    }

    #[inline]
    pub fn enter_dispatcher(&self) -> CallGuard<'_> {
        self.in_dispatcher.store(true, Ordering::Release);
        CallGuard(&self.in_dispatcher)
    }

    #[inline]
    pub fn in_transport(&self) -> bool {
        self.in_transport.load(Ordering::Acquire)
    }

    #[inline]
    pub fn in_dispatcher(&self) -> bool {
        self.in_dispatcher.load(Ordering::Acquire)
    }

    /// Start a new client; returns its sequence number (1-based)
    #[inline]
    pub(crate) fn next_client(&self) -> u64 {
        self.client_sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn client_sequence(&self) -> u64 {
        self.client_sequence.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn count_request(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn requests_served(&self) -> u64 {
        self.requests_served.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn buffer_allocations(&self) -> u32 {
        self.buffer_allocations.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("directive", &self.directive())
            .field("client_sequence", &self.client_sequence())
            .field("requests_served", &self.requests_served())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icl_core::ShutdownState;

    #[test]
    fn test_new_worker_has_buffer() {
        let d = Descriptor::new_worker(WorkerId::new(0), 128);
        assert_eq!(d.buffer_allocations(), 1);
        assert_eq!(d.lifecycle(), Lifecycle::Initializing);
        let buf = d.take_standing().unwrap();
        assert_eq!(buf.len(), 128);
        assert!(d.take_standing().is_none());
    }

    #[test]
    fn test_call_guard_resets() {
        let d = Descriptor::new_activity(WorkerId::new(1), ActivityKind::Listener);
        {
            let _g = d.enter_transport();
            assert!(d.in_transport());
        }
        assert!(!d.in_transport());
        assert!(!d.in_dispatcher());
    }

    #[test]
    fn test_directive_reset_on_reuse() {
        let d = Descriptor::new_worker(WorkerId::new(2), 64);
        d.direct(ShutdownState::Immediate);
        d.direct(ShutdownState::Graceful);
        assert_eq!(d.directive(), ShutdownState::Immediate);
        let mut slot = d.lock();
        slot.lifecycle = Lifecycle::ShuttingDownImmediate;
        d.reset_for_reuse(&mut slot);
        assert_eq!(slot.lifecycle, Lifecycle::Initializing);
        drop(slot);
        assert_eq!(d.directive(), ShutdownState::Active);
    }

    #[test]
    fn test_client_sequence() {
        let d = Descriptor::new_worker(WorkerId::new(3), 64);
        assert_eq!(d.next_client(), 1);
        assert_eq!(d.next_client(), 2);
        assert_eq!(d.client_sequence(), 2);
    }
}
