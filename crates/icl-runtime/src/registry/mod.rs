//! Worker registry
//!
//! The registry owns every descriptor (an arena indexed by `WorkerId`) and
//! three chains over them:
//!
//! - **free**: workers parked waiting for a client (singly linked, LIFO)
//! - **assigned**: workers serving a client (doubly linked)
//! - **reuse**: retired descriptors whose thread has exited (singly linked)
//!
//! # Lock order
//!
//! `reuse -> assigned -> free -> descriptor`. The arena lock is a leaf: it is
//! never held while acquiring another lock.

mod chain;
mod descriptor;

pub use chain::{DoublyLinked, SinglyLinked};
pub use descriptor::{Binding, CallGuard, Descriptor, DescriptorSlot, Handoff};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;

use crossbeam_queue::SegQueue;
use icl_core::{
    ActivityKind, Lifecycle, ListenerId, ManagementNotifier, OutOfBand, RegistryError,
    ShutdownState, StandingBuffer, WorkerId,
};
use tracing::{debug, error, info, trace};

use crate::config::ServerConfig;
use crate::shutdown::ShutdownCoordinator;

#[inline]
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Cumulative registry counters
#[derive(Debug, Default)]
pub struct RegistryStats {
    pub descriptors_created: AtomicU64,
    pub descriptors_reused: AtomicU64,
    pub buffers_allocated: AtomicU64,
    pub connections_admitted: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub requests_served: AtomicU64,
    pub oversized_allocations: AtomicU64,
    pub workers_retired: AtomicU64,
}

/// Point-in-time copy of `RegistryStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub descriptors_created: u64,
    pub descriptors_reused: u64,
    pub buffers_allocated: u64,
    pub connections_admitted: u64,
    pub connections_rejected: u64,
    pub requests_served: u64,
    pub oversized_allocations: u64,
    pub workers_retired: u64,
}

impl RegistryStats {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let r = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            descriptors_created: r(&self.descriptors_created),
            descriptors_reused: r(&self.descriptors_reused),
            buffers_allocated: r(&self.buffers_allocated),
            connections_admitted: r(&self.connections_admitted),
            connections_rejected: r(&self.connections_rejected),
            requests_served: r(&self.requests_served),
            oversized_allocations: r(&self.oversized_allocations),
            workers_retired: r(&self.workers_retired),
        }
    }
}

/// Chain membership at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainSnapshot {
    pub free: Vec<WorkerId>,
    pub assigned: Vec<WorkerId>,
    pub reuse: Vec<WorkerId>,
    pub worker_descriptors: usize,
}

/// Shared registry of worker descriptors
pub struct Registry {
    config: Arc<ServerConfig>,
    shutdown: Arc<ShutdownCoordinator>,
    notifier: Arc<dyn ManagementNotifier>,
    arena: RwLock<Vec<Arc<Descriptor>>>,
    free: Mutex<SinglyLinked>,
    assigned: Mutex<DoublyLinked>,
    reuse: Mutex<SinglyLinked>,
    /// Worker descriptors ever created; changed only under the reuse lock
    worker_descriptors: AtomicUsize,
    drained_announced: AtomicBool,
    stats: RegistryStats,
    threads: SegQueue<JoinHandle<()>>,
}

impl Registry {
    pub fn new(
        config: Arc<ServerConfig>,
        shutdown: Arc<ShutdownCoordinator>,
        notifier: Arc<dyn ManagementNotifier>,
    ) -> Self {
        shutdown.attach_notifier(Arc::clone(&notifier));
        Self {
            config,
            shutdown,
            notifier,
            arena: RwLock::new(Vec::new()),
            free: Mutex::new(SinglyLinked::new()),
            assigned: Mutex::new(DoublyLinked::new()),
            reuse: Mutex::new(SinglyLinked::new()),
            worker_descriptors: AtomicUsize::new(0),
            drained_announced: AtomicBool::new(false),
            stats: RegistryStats::default(),
            threads: SegQueue::new(),
        }
    }

    #[inline]
    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    #[inline]
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    #[inline]
    pub fn notifier(&self) -> &Arc<dyn ManagementNotifier> {
        &self.notifier
    }

    #[inline]
    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    /// Look up a descriptor (arena lock only)
    pub fn get(&self, id: WorkerId) -> Option<Arc<Descriptor>> {
        let arena = self.arena.read().unwrap_or_else(|e| e.into_inner());
        arena.get(id.as_usize()).cloned()
    }

    fn push_arena(&self, make: impl FnOnce(WorkerId) -> Descriptor) -> Arc<Descriptor> {
        let mut arena = self.arena.write().unwrap_or_else(|e| e.into_inner());
        let id = WorkerId::new(arena.len() as u32);
        let d = Arc::new(make(id));
        arena.push(Arc::clone(&d));
        d
    }

    /// Descriptor lookup from under a chain lock; a dangling id is corruption
    fn member(&self, id: WorkerId, chain: &'static str) -> Result<Arc<Descriptor>, RegistryError> {
        self.get(id).ok_or_else(|| RegistryError::ChainCorrupted {
            chain,
            detail: format!("{} is linked but not in the arena", id),
        })
    }

    pub fn assigned_count(&self) -> usize {
        lock(&self.assigned).len()
    }

    pub fn free_count(&self) -> usize {
        lock(&self.free).len()
    }

    pub fn reuse_count(&self) -> usize {
        lock(&self.reuse).len()
    }

    #[inline]
    pub fn worker_descriptors(&self) -> usize {
        self.worker_descriptors.load(Ordering::Acquire)
    }

    /// Descriptor for a listener activity; never chained, not counted
    /// against the descriptor ceiling
    pub fn register_listener_descriptor(&self, listener: ListenerId) -> Arc<Descriptor> {
        let d = self.push_arena(|id| Descriptor::new_activity(id, ActivityKind::Listener));
        d.lock().listener = Some(listener);
        debug!(descriptor = %d.id(), listener = %listener, "listener descriptor registered");
        d
    }

    /// Pop a parked worker for `listener`.
    ///
    /// Only the pop and the Initializing transition happen under the free
    /// lock. `None` means the caller must create a worker.
    pub fn acquire_free_worker(&self, listener: ListenerId) -> Option<Arc<Descriptor>> {
        let mut free = lock(&self.free);
        let id = free.pop()?;
        let d = match self.member(id, "free") {
            Ok(d) => d,
            Err(e) => {
                drop(free);
                self.fault(e);
                return None;
            }
        };
        {
            let mut slot = d.lock();
            slot.lifecycle = Lifecycle::Initializing;
            slot.listener = Some(listener);
        }
        drop(free);
        trace!(worker = %id, listener = %listener, "acquired free worker");
        Some(d)
    }

    /// Park `d` on the free chain.
    ///
    /// Refused with the blocking shutdown state if the descriptor has been
    /// directed or its listener (or the server) is shutting down; the worker
    /// must then retire. On success the descriptor lock is still held so the
    /// caller can wait on `Descriptor::wake` without missing a delivery.
    pub fn release_to_free<'d>(
        &self,
        d: &'d Descriptor,
    ) -> Result<MutexGuard<'d, DescriptorSlot>, ShutdownState> {
        let mut free = lock(&self.free);
        let directive = self.directive(d);
        if directive.is_shutting_down() {
            return Err(directive);
        }
        let mut slot = d.lock();
        let state = match slot.listener {
            Some(l) => self.shutdown.effective(l),
            None => self.shutdown.global(),
        };
        if state.is_shutting_down() {
            return Err(state);
        }
        free.push(d.id());
        slot.lifecycle = Lifecycle::FreeUnassigned;
        drop(free);
        trace!(worker = %d.id(), "released to free chain");
        Ok(slot)
    }

    /// Remove `id` from the free chain if it is still linked
    pub fn withdraw_from_free(&self, id: WorkerId) -> bool {
        let mut free = lock(&self.free);
        if !free.remove(id) {
            return false;
        }
        if let Some(d) = self.get(id) {
            d.lock().lifecycle = Lifecycle::Initializing;
        }
        debug!(worker = %id, "withdrew from free chain");
        true
    }

    /// Link `d` into the assigned chain for `listener`.
    ///
    /// Refused if the listener (or server) is shutting down or the
    /// descriptor has been directed.
    pub fn add_to_assigned(&self, d: &Descriptor, listener: ListenerId) -> Result<(), RegistryError> {
        let mut assigned = lock(&self.assigned);
        if self.shutdown.effective(listener).is_shutting_down() || self.directive(d).is_shutting_down() {
            return Err(RegistryError::ShuttingDown);
        }
        let mut slot = d.lock();
        if !assigned.push_front(d.id()) {
            return Err(RegistryError::ChainCorrupted {
                chain: "assigned",
                detail: format!("{} already linked", d.id()),
            });
        }
        slot.lifecycle = Lifecycle::ClientAssigned;
        slot.listener = Some(listener);
        Ok(())
    }

    /// Unlink `d` from the assigned chain.
    ///
    /// Returns true if this was the last assigned worker while the server
    /// is shutting down; the caller then announces the drain.
    pub fn remove_from_assigned(&self, d: &Descriptor) -> Result<bool, RegistryError> {
        let mut assigned = lock(&self.assigned);
        if !assigned.remove(d.id()) {
            return Err(RegistryError::NotLinked { id: d.id(), chain: "assigned" });
        }
        d.lock().lifecycle = Lifecycle::Initializing;
        Ok(assigned.is_empty() && self.shutdown.global().is_shutting_down())
    }

    /// Retire `d` to the reuse chain with its standing buffer.
    ///
    /// The calling worker thread exits afterwards.
    pub fn retire_to_reuse(&self, d: &Descriptor, standing: Option<StandingBuffer>, fin: Lifecycle) {
        let mut reuse = lock(&self.reuse);
        let stale = {
            let mut slot = d.lock();
            if let Some(buf) = standing {
                slot.standing = Some(buf);
            }
            slot.binding = None;
            slot.listener = None;
            slot.lifecycle = fin;
            reuse.push(d.id());
            slot.handoff.take()
        };
        drop(reuse);
        // Undelivered client: close it outside the locks
        if let Some(mut h) = stale {
            h.connection.close();
        }
        RegistryStats::bump(&self.stats.workers_retired);
        debug!(worker = %d.id(), lifecycle = %fin, "retired to reuse chain");
    }

    /// A descriptor ready for a new worker thread: popped from the reuse
    /// chain and reset, or newly created under the descriptor ceiling.
    pub fn obtain_descriptor(&self) -> Result<Arc<Descriptor>, RegistryError> {
        let mut reuse = lock(&self.reuse);
        if let Some(id) = reuse.pop() {
            let d = self.member(id, "reuse")?;
            {
                let mut slot = d.lock();
                d.reset_for_reuse(&mut slot);
            }
            drop(reuse);
            RegistryStats::bump(&self.stats.descriptors_reused);
            trace!(worker = %id, "reusing descriptor");
            return Ok(d);
        }
        let max = self.config.max_descriptors;
        if self.worker_descriptors.load(Ordering::Acquire) >= max {
            return Err(RegistryError::DescriptorCeiling(max));
        }
        let size = self.config.standing_buffer_size;
        let d = self.push_arena(|id| Descriptor::new_worker(id, size));
        self.worker_descriptors.fetch_add(1, Ordering::AcqRel);
        drop(reuse);
        RegistryStats::bump(&self.stats.descriptors_created);
        RegistryStats::bump(&self.stats.buffers_allocated);
        debug!(worker = %d.id(), "created descriptor");
        Ok(d)
    }

    /// Direct every assigned worker owned by `listener`.
    ///
    /// For `Immediate` the out-of-band handles of bound connections are
    /// returned; the caller signals them after the lock is released.
    pub fn direct_assigned(
        &self,
        listener: ListenerId,
        mode: ShutdownState,
    ) -> Vec<Arc<dyn OutOfBand>> {
        let assigned = lock(&self.assigned);
        let mut wake = Vec::new();
        for id in assigned.walk(usize::MAX) {
            let d = match self.get(id) {
                Some(d) => d,
                None => continue,
            };
            let slot = d.lock();
            if slot.listener != Some(listener) {
                continue;
            }
            d.direct(mode);
            if mode == ShutdownState::Immediate {
                if let Some(b) = slot.binding.as_ref() {
                    wake.push(Arc::clone(&b.oob));
                }
            }
        }
        debug!(listener = %listener, mode = %mode, interrupts = wake.len(), "directed assigned workers");
        wake
    }

    /// Pop every parked worker, direct it and wake it. Returns the count.
    pub fn drain_free(&self, mode: ShutdownState) -> usize {
        let mut free = lock(&self.free);
        let mut n = 0;
        while let Some(id) = free.pop() {
            if let Some(d) = self.get(id) {
                d.direct(mode);
                d.lock().lifecycle = Lifecycle::Initializing;
                d.wake.notify_all();
            }
            n += 1;
        }
        drop(free);
        if n > 0 {
            debug!(drained = n, mode = %mode, "drained free chain");
        }
        n
    }

    /// Directive posted to `d`. A corrupt value is reported as a fault and
    /// read as Immediate.
    pub fn directive(&self, d: &Descriptor) -> ShutdownState {
        match d.check_directive() {
            Ok(state) => state,
            Err(err) => {
                self.fault(err);
                ShutdownState::Immediate
            }
        }
    }

    /// Internal invariant violation: report it and stop the whole server
    pub fn fault(&self, err: RegistryError) {
        error!(error = %err, "internal fault, forcing immediate shutdown");
        self.notifier.internal_fault(&err);
        self.shutdown.post_global(ShutdownState::Immediate);
    }

    /// Tell management the server has drained. Only the first call counts.
    pub fn announce_drained(&self) -> bool {
        if self.drained_announced.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!("all workers drained");
        self.notifier.server_drained();
        true
    }

    #[inline]
    pub fn drained_announced(&self) -> bool {
        self.drained_announced.load(Ordering::Acquire)
    }

    pub fn track_thread(&self, handle: JoinHandle<()>) {
        self.threads.push(handle);
    }

    /// Join every worker thread spawned so far. Returns how many panicked.
    pub fn join_workers(&self) -> usize {
        let mut panicked = 0;
        while let Some(h) = self.threads.pop() {
            let name = h.thread().name().map(str::to_string);
            if h.join().is_err() {
                error!(thread = ?name, "worker thread panicked");
                panicked += 1;
            }
        }
        panicked
    }

    pub fn snapshot(&self) -> ChainSnapshot {
        let reuse = lock(&self.reuse);
        let assigned = lock(&self.assigned);
        let free = lock(&self.free);
        ChainSnapshot {
            free: free.walk(usize::MAX),
            assigned: assigned.walk(usize::MAX),
            reuse: reuse.walk(usize::MAX),
            worker_descriptors: self.worker_descriptors(),
        }
    }

    /// Check every chain invariant under all three chain locks
    pub fn verify(&self) -> Result<(), RegistryError> {
        let reuse = lock(&self.reuse);
        let assigned = lock(&self.assigned);
        let free = lock(&self.free);
        let limit = self.arena.read().unwrap_or_else(|e| e.into_inner()).len();

        let corrupt = |chain: &'static str, detail: String| RegistryError::ChainCorrupted { chain, detail };

        let free_ids = free.check(limit).map_err(|d| corrupt("free", d))?;
        let assigned_ids = assigned.check(limit).map_err(|d| corrupt("assigned", d))?;
        let reuse_ids = reuse.check(limit).map_err(|d| corrupt("reuse", d))?;

        let mut seen = HashSet::new();
        for (chain, ids) in [("free", &free_ids), ("assigned", &assigned_ids), ("reuse", &reuse_ids)] {
            for id in ids {
                if !seen.insert(*id) {
                    return Err(corrupt(chain, format!("{} is on more than one chain", id)));
                }
            }
        }

        let expect = |chain: &'static str,
                      ids: &[WorkerId],
                      ok: &dyn Fn(Lifecycle) -> bool|
         -> Result<(), RegistryError> {
            for id in ids {
                let d = self.get(*id).ok_or_else(|| corrupt(chain, format!("{} not in arena", id)))?;
                if d.kind() != ActivityKind::Worker {
                    return Err(corrupt(chain, format!("{} is a {} descriptor", id, d.kind())));
                }
                let lc = d.lifecycle();
                if !ok(lc) {
                    return Err(corrupt(chain, format!("{} has lifecycle {}", id, lc)));
                }
            }
            Ok(())
        };
        expect("free", &free_ids, &|lc| lc == Lifecycle::FreeUnassigned)?;
        expect("assigned", &assigned_ids, &|lc| lc == Lifecycle::ClientAssigned)?;
        expect("reuse", &reuse_ids, &|lc| lc.is_retired())?;

        let arena = self.arena.read().unwrap_or_else(|e| e.into_inner());
        for d in arena.iter().filter(|d| d.kind() == ActivityKind::Worker) {
            if d.buffer_allocations() != 1 {
                return Err(corrupt(
                    "arena",
                    format!("{} allocated {} standing buffers", d.id(), d.buffer_allocations()),
                ));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("worker_descriptors", &self.worker_descriptors())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}
