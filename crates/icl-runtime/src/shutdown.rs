//! Shutdown coordination
//!
//! The server and each listener carry a shutdown state that only ever
//! escalates (`Active < Graceful < Immediate`). Listeners and workers poll
//! these states at every blocking boundary; nothing is interrupted except
//! through the per-connection out-of-band wake.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use icl_core::{ListenerId, ManagementNotifier, RegistryError, ShutdownState};
use tracing::{error, info};

/// Atomic escalate-only shutdown state
#[derive(Debug, Default)]
pub struct ShutdownCell(AtomicU8);

impl ShutdownCell {
    pub const fn new() -> Self {
        ShutdownCell(AtomicU8::new(ShutdownState::Active as u8))
    }

    /// Current state. A value that does not decode is treated as Immediate.
    #[inline]
    pub fn load(&self) -> ShutdownState {
        decode(self.0.load(Ordering::Acquire))
    }

    /// Current state, or `InvalidShutdownValue` if the stored value does
    /// not decode. The bad value is replaced with Immediate, so it is
    /// reported once.
    pub fn check(&self) -> Result<ShutdownState, RegistryError> {
        let raw = self.0.load(Ordering::Acquire);
        match ShutdownState::try_from(raw) {
            Ok(state) => Ok(state),
            Err(_) => {
                let bad = self.0.swap(ShutdownState::Immediate as u8, Ordering::AcqRel);
                match ShutdownState::try_from(bad) {
                    // Already repaired by another reader
                    Ok(state) => Ok(state),
                    Err(_) => Err(RegistryError::InvalidShutdownValue(bad)),
                }
            }
        }
    }

    /// Raise the state to at least `mode`; returns the previous state
    #[inline]
    pub fn escalate(&self, mode: ShutdownState) -> ShutdownState {
        decode(self.0.fetch_max(mode as u8, Ordering::AcqRel))
    }

    /// Back to Active. Only for a descriptor being reused.
    #[inline]
    pub fn reset(&self) {
        self.0.store(ShutdownState::Active as u8, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn store_raw(&self, raw: u8) {
        self.0.store(raw, Ordering::Release);
    }
}

fn decode(raw: u8) -> ShutdownState {
    match ShutdownState::try_from(raw) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "corrupt shutdown state, treating as immediate");
            ShutdownState::Immediate
        }
    }
}

#[derive(Debug)]
struct ListenerEntry {
    path: String,
    state: ShutdownCell,
    sequence_started: AtomicBool,
    terminal: AtomicBool,
}

/// Global and per-listener shutdown state
#[derive(Default)]
pub struct ShutdownCoordinator {
    global: ShutdownCell,
    listeners: RwLock<Vec<Arc<ListenerEntry>>>,
    notifier: OnceLock<Arc<dyn ManagementNotifier>>,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("global", &self.global)
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Where corrupt shutdown values are reported. The first call wins.
    pub fn attach_notifier(&self, notifier: Arc<dyn ManagementNotifier>) {
        let _ = self.notifier.set(notifier);
    }

    /// Read a cell; a corrupt value is an internal fault that stops the
    /// whole server
    pub(crate) fn read(&self, cell: &ShutdownCell) -> ShutdownState {
        match cell.check() {
            Ok(state) => state,
            Err(err) => {
                self.fault(&err);
                ShutdownState::Immediate
            }
        }
    }

    fn fault(&self, err: &RegistryError) {
        error!(error = %err, "internal fault, forcing immediate shutdown");
        if let Some(n) = self.notifier.get() {
            n.internal_fault(err);
        }
        self.post_global(ShutdownState::Immediate);
    }

    fn entry(&self, id: ListenerId) -> Option<Arc<ListenerEntry>> {
        let guard = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        guard.get(id.as_usize()).cloned()
    }

    /// Register a listener; it inherits the current global state
    pub fn register_listener(&self, path: &str) -> ListenerId {
        let mut guard = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let id = ListenerId::new(guard.len() as u16);
        let entry = Arc::new(ListenerEntry {
            path: path.to_string(),
            state: ShutdownCell::new(),
            sequence_started: AtomicBool::new(false),
            terminal: AtomicBool::new(false),
        });
        entry.state.escalate(self.global.load());
        guard.push(entry);
        id
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn path(&self, id: ListenerId) -> Option<String> {
        self.entry(id).map(|e| e.path.clone())
    }

    #[inline]
    pub fn global(&self) -> ShutdownState {
        self.read(&self.global)
    }

    /// Listener's own state; unknown listeners read as Immediate
    pub fn listener(&self, id: ListenerId) -> ShutdownState {
        match self.entry(id) {
            Some(e) => self.read(&e.state),
            None => ShutdownState::Immediate,
        }
    }

    /// State a worker owned by `id` must honor: max(listener, global)
    #[inline]
    pub fn effective(&self, id: ListenerId) -> ShutdownState {
        self.listener(id).escalate(self.global())
    }

    /// Escalate the whole server, and every listener with it
    pub fn post_global(&self, mode: ShutdownState) {
        let prev = self.global.escalate(mode);
        if prev < mode {
            info!(from = %prev, to = %mode, "global shutdown posted");
        }
        let guard = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        for entry in guard.iter() {
            entry.state.escalate(mode);
        }
    }

    /// Escalate a single listener
    pub fn post_listener(&self, id: ListenerId, mode: ShutdownState) -> Result<(), RegistryError> {
        let entry = self.entry(id).ok_or(RegistryError::UnknownListener(id))?;
        let prev = entry.state.escalate(mode);
        if prev < mode {
            info!(listener = %id, path = %entry.path, from = %prev, to = %mode, "listener shutdown posted");
        }
        Ok(())
    }

    /// Claim the listener's shutdown sequence. True only for the first caller.
    pub fn begin_sequence(&self, id: ListenerId) -> bool {
        match self.entry(id) {
            Some(e) => !e.sequence_started.swap(true, Ordering::AcqRel),
            None => false,
        }
    }

    pub fn mark_terminal(&self, id: ListenerId) {
        if let Some(e) = self.entry(id) {
            e.terminal.store(true, Ordering::Release);
        }
    }

    pub fn is_terminal(&self, id: ListenerId) -> bool {
        self.entry(id).map_or(true, |e| e.terminal.load(Ordering::Acquire))
    }

    pub fn all_terminal(&self) -> bool {
        let guard = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        guard.iter().all(|e| e.terminal.load(Ordering::Acquire))
    }

    /// Free workers are drained once no listener can hand them a client:
    /// the server is shutting down or every listener is stopping.
    pub fn free_drain_due(&self) -> bool {
        if self.global().is_shutting_down() {
            return true;
        }
        let entries: Vec<_> = self.listeners.read().unwrap_or_else(|e| e.into_inner()).clone();
        !entries.is_empty() && entries.iter().all(|e| self.read(&e.state).is_shutting_down())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{EventLog, ServerEvent};

    #[test]
    fn test_escalate_only() {
        let c = ShutdownCoordinator::new();
        let l = c.register_listener("tcp");
        c.post_listener(l, ShutdownState::Immediate).unwrap();
        c.post_listener(l, ShutdownState::Graceful).unwrap();
        assert_eq!(c.listener(l), ShutdownState::Immediate);
    }

    #[test]
    fn test_global_escalates_listeners() {
        let c = ShutdownCoordinator::new();
        let a = c.register_listener("a");
        let b = c.register_listener("b");
        c.post_listener(a, ShutdownState::Immediate).unwrap();
        c.post_global(ShutdownState::Graceful);
        assert_eq!(c.listener(a), ShutdownState::Immediate);
        assert_eq!(c.listener(b), ShutdownState::Graceful);
        assert_eq!(c.effective(b), ShutdownState::Graceful);
        assert!(c.free_drain_due());
    }

    #[test]
    fn test_late_listener_inherits_global() {
        let c = ShutdownCoordinator::new();
        c.post_global(ShutdownState::Graceful);
        let l = c.register_listener("late");
        assert_eq!(c.listener(l), ShutdownState::Graceful);
    }

    #[test]
    fn test_free_drain_due_per_listener() {
        let c = ShutdownCoordinator::new();
        assert!(!c.free_drain_due());
        let a = c.register_listener("a");
        let b = c.register_listener("b");
        c.post_listener(a, ShutdownState::Graceful).unwrap();
        assert!(!c.free_drain_due());
        assert_eq!(c.global(), ShutdownState::Active);
        c.post_listener(b, ShutdownState::Graceful).unwrap();
        assert!(c.free_drain_due());
    }

    #[test]
    fn test_sequence_once() {
        let c = ShutdownCoordinator::new();
        let l = c.register_listener("tcp");
        assert!(c.begin_sequence(l));
        assert!(!c.begin_sequence(l));
        assert!(!c.all_terminal());
        c.mark_terminal(l);
        assert!(c.is_terminal(l));
        assert!(c.all_terminal());
    }

    #[test]
    fn test_unknown_listener() {
        let c = ShutdownCoordinator::new();
        let ghost = ListenerId::new(9);
        assert_eq!(c.listener(ghost), ShutdownState::Immediate);
        assert_eq!(
            c.post_listener(ghost, ShutdownState::Graceful),
            Err(RegistryError::UnknownListener(ghost))
        );
        assert!(!c.begin_sequence(ghost));
    }

    #[test]
    fn test_corrupt_value_reads_immediate() {
        let cell = ShutdownCell::new();
        cell.store_raw(42);
        assert_eq!(cell.load(), ShutdownState::Immediate);
        cell.reset();
        assert_eq!(cell.load(), ShutdownState::Active);
    }

    #[test]
    fn test_check_repairs_corrupt_value() {
        let cell = ShutdownCell::new();
        assert_eq!(cell.check(), Ok(ShutdownState::Active));
        cell.store_raw(42);
        assert_eq!(cell.check(), Err(RegistryError::InvalidShutdownValue(42)));
        assert_eq!(cell.check(), Ok(ShutdownState::Immediate));
    }

    #[test]
    fn test_corrupt_listener_state_stops_server() {
        let c = ShutdownCoordinator::new();
        let log = Arc::new(EventLog::new());
        c.attach_notifier(log.clone());
        let a = c.register_listener("a");
        let b = c.register_listener("b");
        c.entry(a).unwrap().state.store_raw(7);

        assert_eq!(c.listener(a), ShutdownState::Immediate);
        assert_eq!(c.global(), ShutdownState::Immediate);
        assert_eq!(c.listener(b), ShutdownState::Immediate);
        assert_eq!(
            log.drain(),
            vec![ServerEvent::InternalFault(RegistryError::InvalidShutdownValue(7))]
        );
    }

    #[test]
    fn test_corrupt_global_state_reported_once() {
        let c = ShutdownCoordinator::new();
        let log = Arc::new(EventLog::new());
        c.attach_notifier(log.clone());
        let l = c.register_listener("tcp");
        c.global.store_raw(200);

        assert_eq!(c.effective(l), ShutdownState::Immediate);
        assert_eq!(c.global(), ShutdownState::Immediate);
        assert_eq!(c.listener(l), ShutdownState::Immediate);
        assert_eq!(log.len(), 1);
    }
}
