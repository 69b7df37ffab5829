//! Server assembly and control
//!
//! `Server::start` validates the configuration, builds the registry and
//! starts one listener thread per acceptor. The returned `ServerHandle`
//! posts shutdown, waits for every thread and reports the final state.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use icl_core::{
    Acceptor, ConfigError, Dispatcher, ListenerId, ManagementNotifier, RegistryError, ServerError,
    ShutdownState,
};
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::listener::Listener;
use crate::registry::{ChainSnapshot, Registry, StatsSnapshot};
use crate::shutdown::ShutdownCoordinator;
use crate::transport::TcpAcceptor;

/// Entry point for starting a server
#[derive(Debug)]
pub struct Server;

impl Server {
    /// Start a listener for each `(path name, acceptor)` pair
    pub fn start(
        config: ServerConfig,
        acceptors: Vec<(String, Box<dyn Acceptor>)>,
        dispatcher: Arc<dyn Dispatcher>,
        notifier: Arc<dyn ManagementNotifier>,
    ) -> Result<ServerHandle, ServerError> {
        if acceptors.is_empty() {
            return Err(ConfigError::NoPaths.into());
        }
        config.validate()?;
        config.describe();

        let registry = Arc::new(Registry::new(
            Arc::new(config),
            Arc::new(ShutdownCoordinator::new()),
            notifier,
        ));
        let mut handle = ServerHandle {
            registry: Arc::clone(&registry),
            listeners: Vec::with_capacity(acceptors.len()),
            bound: Vec::new(),
        };

        for (path, acceptor) in acceptors {
            let listener = Listener::new(Arc::clone(&registry), &path, acceptor, Arc::clone(&dispatcher));
            let id = listener.id();
            match listener.spawn() {
                Ok(thread) => handle.listeners.push(ListenerThread { id, path, thread }),
                Err(e) => {
                    error!(path = %path, error = %e, "listener did not start, stopping server");
                    handle.shutdown(ShutdownState::Immediate);
                    handle.wait();
                    return Err(e);
                }
            }
        }
        info!(listeners = handle.listeners.len(), "server started");
        Ok(handle)
    }

    /// Bind a TCP acceptor for every configured network path and start
    pub fn start_tcp(
        config: ServerConfig,
        dispatcher: Arc<dyn Dispatcher>,
        notifier: Arc<dyn ManagementNotifier>,
    ) -> Result<ServerHandle, ServerError> {
        let mut acceptors: Vec<(String, Box<dyn Acceptor>)> = Vec::with_capacity(config.paths.len());
        let mut bound = Vec::with_capacity(config.paths.len());
        for p in &config.paths {
            let acceptor = TcpAcceptor::bind(p.addr.as_str())?;
            if let Some(addr) = acceptor.local_addr() {
                info!(path = %p.name, addr = %addr, "listening");
                bound.push((p.name.clone(), addr));
            }
            acceptors.push((p.name.clone(), Box::new(acceptor)));
        }
        let mut handle = Self::start(config, acceptors, dispatcher, notifier)?;
        handle.bound = bound;
        Ok(handle)
    }
}

struct ListenerThread {
    id: ListenerId,
    path: String,
    thread: JoinHandle<()>,
}

/// Control handle for a running server
pub struct ServerHandle {
    registry: Arc<Registry>,
    listeners: Vec<ListenerThread>,
    bound: Vec<(String, SocketAddr)>,
}

impl ServerHandle {
    #[inline]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Listener ids with their path names, in start order
    pub fn listeners(&self) -> Vec<(ListenerId, &str)> {
        self.listeners.iter().map(|l| (l.id, l.path.as_str())).collect()
    }

    /// Addresses bound by `Server::start_tcp`
    pub fn local_addrs(&self) -> &[(String, SocketAddr)] {
        &self.bound
    }

    /// Post a global shutdown.
    ///
    /// Listeners that have not run their shutdown sequence pick this up at
    /// their next accept timeout. Listeners that already finished (an
    /// earlier, milder shutdown) cannot see an escalation, so their
    /// remaining workers are directed from here.
    pub fn shutdown(&self, mode: ShutdownState) {
        let coordinator = self.registry.shutdown();
        let previous = coordinator.global();
        coordinator.post_global(mode);
        info!(mode = %mode, previous = %previous, "server shutdown posted");

        let mut rebroadcast = false;
        for l in &self.listeners {
            if !coordinator.is_terminal(l.id) {
                continue;
            }
            rebroadcast = true;
            for oob in self.registry.direct_assigned(l.id, mode) {
                oob.signal();
            }
        }
        if rebroadcast {
            if coordinator.free_drain_due() {
                self.registry.drain_free(mode);
            }
            if coordinator.all_terminal() && self.registry.assigned_count() == 0 {
                self.registry.announce_drained();
            }
        }
    }

    /// Shut down one network path
    pub fn shutdown_listener(&self, id: ListenerId, mode: ShutdownState) -> Result<(), RegistryError> {
        self.registry.shutdown().post_listener(id, mode)
    }

    /// Every listener has finished its shutdown sequence
    pub fn is_stopped(&self) -> bool {
        self.registry.shutdown().all_terminal()
    }

    /// Current counters and chain membership
    pub fn report(&self) -> ServerReport {
        ServerReport {
            stats: self.registry.stats().snapshot(),
            chains: self.registry.snapshot(),
            drained: self.registry.drained_announced(),
            panicked: 0,
            consistency: self.registry.verify(),
        }
    }

    /// Wait for every listener and worker thread, then report.
    ///
    /// Returns only after a shutdown has been posted and has completed.
    pub fn wait(self) -> ServerReport {
        let mut panicked = 0;
        for l in self.listeners {
            if l.thread.join().is_err() {
                error!(listener = %l.id, path = %l.path, "listener thread panicked");
                panicked += 1;
            }
        }
        panicked += self.registry.join_workers();

        let report = ServerReport {
            stats: self.registry.stats().snapshot(),
            chains: self.registry.snapshot(),
            drained: self.registry.drained_announced(),
            panicked,
            consistency: self.registry.verify(),
        };
        if let Err(e) = &report.consistency {
            warn!(error = %e, "registry inconsistent at exit");
        }
        report
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("listeners", &self.listeners.len())
            .field("bound", &self.bound)
            .field("registry", &self.registry)
            .finish()
    }
}

/// Final (or live) server state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReport {
    pub stats: StatsSnapshot,
    pub chains: ChainSnapshot,
    pub drained: bool,
    pub panicked: usize,
    pub consistency: Result<(), RegistryError>,
}

impl fmt::Display for ServerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.stats;
        writeln!(f, "connections: {} admitted, {} rejected", s.connections_admitted, s.connections_rejected)?;
        writeln!(f, "requests:    {} served, {} oversized", s.requests_served, s.oversized_allocations)?;
        writeln!(
            f,
            "descriptors: {} created, {} reused, {} retired, {} buffers",
            s.descriptors_created, s.descriptors_reused, s.workers_retired, s.buffers_allocated
        )?;
        writeln!(
            f,
            "chains:      free={} assigned={} reuse={}",
            self.chains.free.len(),
            self.chains.assigned.len(),
            self.chains.reuse.len()
        )?;
        match &self.consistency {
            Ok(()) => write!(f, "registry:    consistent"),
            Err(e) => write!(f, "registry:    {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use icl_core::frame::HEADER_LEN;
    use icl_core::{Connection, NullNotifier, TaskCode, TransportError};

    use crate::config::NetworkPath;
    use crate::notify::{EventLog, ServerEvent};
    use crate::testkit::{self, wait_until, Echo, T, TASK_FINISH};
    use crate::transport::{MemoryAcceptor, MemoryConnection, MemoryConnector, TcpConnection};

    fn start(paths: &[&str], config: ServerConfig) -> (ServerHandle, Vec<MemoryConnector>, Arc<EventLog>) {
        let events = Arc::new(EventLog::new());
        let mut acceptors: Vec<(String, Box<dyn Acceptor>)> = Vec::new();
        let mut connectors = Vec::new();
        for p in paths {
            let (a, c) = MemoryAcceptor::new();
            acceptors.push((p.to_string(), Box::new(a)));
            connectors.push(c);
        }
        let handle = Server::start(config, acceptors, Arc::new(Echo), events.clone()).unwrap();
        (handle, connectors, events)
    }

    fn echo(c: &mut MemoryConnection, task: TaskCode, body: &[u8]) -> Vec<u8> {
        c.send(&testkit::request(task, 1, body)).unwrap();
        c.recv_packet(T).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let err = Server::start(testkit::config().max_workers(0), Vec::new(), Arc::new(Echo), Arc::new(NullNotifier))
            .unwrap_err();
        assert!(matches!(err, ServerError::Config(ConfigError::NoPaths)));

        let (a, _c) = MemoryAcceptor::new();
        let err = Server::start(
            testkit::config().max_workers(0),
            vec![("m".into(), Box::new(a) as Box<dyn Acceptor>)],
            Arc::new(Echo),
            Arc::new(NullNotifier),
        )
        .unwrap_err();
        assert!(matches!(err, ServerError::Config(ConfigError::Zero { .. })));
    }

    #[test]
    fn test_graceful_shutdown_empties_chains() {
        let (server, conns, events) = start(&["mem"], testkit::config());
        let mut clients: Vec<_> = (0..4).map(|_| conns[0].connect().unwrap()).collect();
        wait_until("four workers", || server.registry().assigned_count() == 4);
        for c in clients.iter_mut() {
            assert_eq!(&echo(c, TASK_FINISH, b"bye")[HEADER_LEN..], b"bye");
        }
        wait_until("workers parked", || server.registry().free_count() == 4);

        server.shutdown(ShutdownState::Graceful);
        let report = server.wait();
        assert_eq!(report.panicked, 0);
        assert_eq!(report.consistency, Ok(()));
        assert!(report.chains.free.is_empty());
        assert!(report.chains.assigned.is_empty());
        assert_eq!(report.chains.reuse.len(), 4);
        assert!(report.drained);
        assert_eq!(report.stats.requests_served, 4);
        assert_eq!(
            events.drain().iter().filter(|e| **e == ServerEvent::ServerDrained).count(),
            1
        );
    }

    #[test]
    fn test_one_path_stops_other_keeps_serving() {
        let (server, conns, events) = start(&["a", "b"], testkit::config());
        let ids = server.listeners();
        let (a, b) = (ids[0].0, ids[1].0);

        server.shutdown_listener(a, ShutdownState::Graceful).unwrap();
        wait_until("listener a terminal", || server.registry().shutdown().is_terminal(a));
        assert!(conns[0].is_closed());

        let mut c = conns[1].connect().unwrap();
        assert_eq!(&echo(&mut c, TaskCode(0x10), b"still")[HEADER_LEN..], b"still");
        assert!(!server.is_stopped());

        drop(c);
        server.shutdown(ShutdownState::Graceful);
        let report = server.wait();
        assert_eq!(report.consistency, Ok(()));
        assert!(report.chains.assigned.is_empty());
        assert!(report.chains.free.is_empty());

        let seen = events.drain();
        assert!(seen.contains(&ServerEvent::ListenerTerminated(a, ShutdownState::Graceful)));
        assert!(seen.contains(&ServerEvent::ListenerTerminated(b, ShutdownState::Graceful)));
    }

    #[test]
    fn test_escalation_after_listeners_finished() {
        let (server, conns, _events) =
            start(&["mem"], testkit::config().recv_poll_interval(Duration::from_secs(30)));
        let mut c = conns[0].connect().unwrap();
        echo(&mut c, TaskCode(0x10), b"x");
        // Mid-packet: graceful cannot stop this worker
        c.send(&testkit::request(TaskCode(0x10), 1, b"partial")[..12]).unwrap();

        server.shutdown(ShutdownState::Graceful);
        wait_until("listener terminal", || server.is_stopped());
        assert_eq!(server.registry().assigned_count(), 1);

        server.shutdown(ShutdownState::Immediate);
        let mut buf = [0u8; 1];
        assert!(matches!(
            c.receive_exact(&mut buf, T),
            Err(TransportError::PeerClosed { received: 0 })
        ));
        let report = server.wait();
        assert!(report.chains.assigned.is_empty());
        assert!(report.drained);
        assert_eq!(report.consistency, Ok(()));
    }

    #[test]
    fn test_fault_forces_immediate_shutdown() {
        let (server, conns, events) = start(&["mem"], testkit::config());
        let mut c = conns[0].connect().unwrap();
        echo(&mut c, TaskCode(0x10), b"x");

        server.registry().fault(RegistryError::ChainCorrupted { chain: "free", detail: "test".into() });
        let report = server.wait();
        assert!(report.chains.assigned.is_empty());
        let seen = events.drain();
        assert!(seen.iter().any(|e| matches!(e, ServerEvent::InternalFault(_))));
        assert!(seen.contains(&ServerEvent::ListenerTerminated(ListenerId::new(0), ShutdownState::Immediate)));
    }

    #[test]
    fn test_tcp_roundtrip() {
        let config = testkit::config().paths(vec![NetworkPath::new("tcp", "127.0.0.1:0")]);
        let server = Server::start_tcp(config, Arc::new(Echo), Arc::new(NullNotifier)).unwrap();
        let addr = server.local_addrs()[0].1;

        let mut client = TcpConnection::connect(addr).unwrap();
        client.send(&testkit::request(TaskCode(0x10), 1, b"over tcp")).unwrap();
        let mut resp = vec![0u8; HEADER_LEN + 8];
        client.receive_exact(&mut resp, T).unwrap();
        assert_eq!(&resp[HEADER_LEN..], b"over tcp");
        drop(client);

        server.shutdown(ShutdownState::Graceful);
        let report = server.wait();
        assert_eq!(report.stats.connections_admitted, 1);
        assert_eq!(report.consistency, Ok(()));
    }

    #[test]
    fn test_immediate_shutdown_with_client_not_reading() {
        let config = testkit::config().paths(vec![NetworkPath::new("tcp", "127.0.0.1:0")]);
        let server = Server::start_tcp(config, Arc::new(Echo), Arc::new(NullNotifier)).unwrap();
        let addr = server.local_addrs()[0].1;

        // Large echoes and no reads: the worker ends up blocked sending
        let mut client = TcpConnection::connect(addr).unwrap();
        let writer = std::thread::spawn(move || {
            let packet = testkit::request(TaskCode(0x10), 1, &vec![3u8; 512 * 1024]);
            for _ in 0..64 {
                if client.send(&packet).is_err() {
                    break;
                }
            }
            client
        });
        wait_until("first echo", || {
            server.registry().stats().requests_served.load(std::sync::atomic::Ordering::Relaxed) >= 1
        });
        std::thread::sleep(Duration::from_millis(300));

        server.shutdown(ShutdownState::Immediate);
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(server.wait());
        });
        let report = rx.recv_timeout(Duration::from_secs(5)).expect("wait() did not return");
        assert_eq!(report.panicked, 0);
        assert_eq!(report.consistency, Ok(()));
        drop(writer.join().unwrap());
    }
}
