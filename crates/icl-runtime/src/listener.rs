//! Initial Connection Listener
//!
//! One listener thread per network path. It accepts connections, admits
//! them against the worker limit and hands each to a parked worker from the
//! free chain, or starts a new worker when none is parked. When its path
//! (or the whole server) is told to shut down it runs the shutdown sequence
//! once and exits.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use icl_core::{
    Accepted, Acceptor, Dispatcher, Lifecycle, ListenerId, RegistryError, ServerError,
    ShutdownState, TransportError,
};
use tracing::{debug, error, info, trace, warn};

use crate::registry::{Descriptor, Handoff, Registry, RegistryStats};
use crate::worker::spawn_worker;

/// Listener for one network path
pub struct Listener {
    id: ListenerId,
    path: Arc<str>,
    acceptor: Box<dyn Acceptor>,
    registry: Arc<Registry>,
    dispatcher: Arc<dyn Dispatcher>,
    descriptor: Arc<Descriptor>,
    hard_failures: u32,
}

impl Listener {
    /// Register a listener for `path` with the shutdown coordinator and the
    /// registry. The thread is started by `spawn`.
    pub fn new(
        registry: Arc<Registry>,
        path: &str,
        acceptor: Box<dyn Acceptor>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let id = registry.shutdown().register_listener(path);
        let descriptor = registry.register_listener_descriptor(id);
        Self {
            id,
            path: Arc::from(path),
            acceptor,
            registry,
            dispatcher,
            descriptor,
            hard_failures: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Run the accept loop on a named thread
    pub fn spawn(self) -> Result<JoinHandle<()>, ServerError> {
        let name = format!("icl-listener-{}", self.path);
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run())
            .map_err(|source| ServerError::Spawn { name, source })
    }

    /// Accept loop; returns after the shutdown sequence
    pub fn run(mut self) {
        let poll = self.registry.config().accept_poll_interval;
        info!(listener = %self.id, path = %self.path, "listener started");

        loop {
            let state = self.registry.shutdown().effective(self.id);
            if state.is_shutting_down() {
                self.shutdown_sequence(state);
                return;
            }

            let res = {
                let _call = self.descriptor.enter_transport();
                self.acceptor.accept(poll)
            };
            match res {
                Ok(accepted) => {
                    self.hard_failures = 0;
                    self.admit(accepted);
                }
                Err(e) if e.is_transient() => {
                    trace!(listener = %self.id, error = %e, "accept");
                }
                Err(e) => self.accept_failed(e),
            }
        }
    }

    fn accept_failed(&mut self, e: TransportError) {
        self.hard_failures += 1;
        let limit = self.registry.config().accept_failure_limit;
        if matches!(e, TransportError::Closed) || self.hard_failures >= limit {
            error!(
                listener = %self.id,
                path = %self.path,
                failures = self.hard_failures,
                error = %e,
                "accept keeps failing, stopping listener"
            );
            let _ = self.registry.shutdown().post_listener(self.id, ShutdownState::Immediate);
            return;
        }
        warn!(listener = %self.id, failures = self.hard_failures, error = %e, "accept failed");
        thread::sleep(self.registry.config().accept_backoff);
    }

    /// Hand an accepted connection to a worker, or turn it away
    fn admit(&mut self, accepted: Accepted) {
        let Accepted { mut connection, peer } = accepted;
        let reg = &self.registry;
        let stats = reg.stats();

        let limit = reg.config().max_workers;
        if reg.assigned_count() >= limit {
            debug!(listener = %self.id, peer = %peer, limit, "worker limit reached, rejecting");
            connection.close();
            RegistryStats::bump(&stats.connections_rejected);
            return;
        }

        let mut handoff = Handoff {
            connection,
            peer,
            listener: self.id,
            path: Arc::clone(&self.path),
            accepted_at: Instant::now(),
        };

        if let Some(d) = reg.acquire_free_worker(self.id) {
            match reg.add_to_assigned(&d, self.id) {
                Ok(()) => {
                    trace!(listener = %self.id, worker = %d.id(), peer = %handoff.peer, "handing client to free worker");
                    RegistryStats::bump(&stats.connections_admitted);
                    d.deliver(handoff);
                }
                Err(e) => {
                    let mode = match e {
                        RegistryError::ShuttingDown => reg
                            .shutdown()
                            .effective(self.id)
                            .escalate(reg.directive(&d))
                            .escalate(ShutdownState::Graceful),
                        other => {
                            reg.fault(other);
                            ShutdownState::Immediate
                        }
                    };
                    debug!(listener = %self.id, worker = %d.id(), mode = %mode, "shutdown raced admission");
                    d.direct_and_wake(mode);
                    handoff.connection.close();
                    RegistryStats::bump(&stats.connections_rejected);
                }
            }
            return;
        }

        if reg.shutdown().effective(self.id).is_shutting_down() {
            handoff.connection.close();
            RegistryStats::bump(&stats.connections_rejected);
            return;
        }

        let d = match reg.obtain_descriptor() {
            Ok(d) => d,
            Err(e) => {
                warn!(listener = %self.id, peer = %handoff.peer, error = %e, "no descriptor, rejecting");
                handoff.connection.close();
                RegistryStats::bump(&stats.connections_rejected);
                return;
            }
        };

        if let Err(e) = reg.add_to_assigned(&d, self.id) {
            let mode = reg.shutdown().effective(self.id).escalate(ShutdownState::Graceful);
            if e != RegistryError::ShuttingDown {
                reg.fault(e);
            }
            reg.retire_to_reuse(&d, None, Lifecycle::for_shutdown(mode));
            handoff.connection.close();
            RegistryStats::bump(&stats.connections_rejected);
            return;
        }

        RegistryStats::bump(&stats.connections_admitted);
        debug!(listener = %self.id, worker = %d.id(), peer = %handoff.peer, "starting worker");
        if let Err(e) = spawn_worker(Arc::clone(reg), d, handoff, Arc::clone(&self.dispatcher)) {
            warn!(listener = %self.id, error = %e, "worker did not start");
        }
    }

    /// Stop accepting and direct this listener's workers. Runs at most
    /// once per listener.
    fn shutdown_sequence(&mut self, mode: ShutdownState) {
        let reg = &self.registry;
        let coordinator = reg.shutdown();
        if !coordinator.begin_sequence(self.id) {
            return;
        }
        info!(listener = %self.id, path = %self.path, mode = %mode, "listener shutting down");

        self.acceptor.close();

        let interrupts = reg.direct_assigned(self.id, mode);
        for oob in &interrupts {
            oob.signal();
        }

        if coordinator.free_drain_due() {
            reg.drain_free(mode);
        }

        self.descriptor.direct(mode);
        self.descriptor.lock().lifecycle = Lifecycle::for_shutdown(mode);
        coordinator.mark_terminal(self.id);
        reg.notifier().listener_terminated(self.id, mode);

        if reg.assigned_count() == 0 && coordinator.global().is_shutting_down() {
            reg.announce_drained();
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("descriptor", &self.descriptor.id())
            .finish_non_exhaustive()
    }
}
