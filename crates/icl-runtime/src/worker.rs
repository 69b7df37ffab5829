//! Server Worker
//!
//! A worker is one OS thread bound to a descriptor. It serves one client at
//! a time: receive a packet, check its framing, hand it to the Dispatcher
//! and send the response, until the client leaves or a shutdown directive
//! stops it. Between clients the worker parks on the free chain and waits
//! for a listener to deliver the next connection.
//!
//! Every blocking receive and send carries `recv_poll_interval` as its
//! timeout. Each timeout is a checkpoint where the descriptor's directive is
//! examined: `Immediate` stops the worker anywhere, `Graceful` only between
//! requests. A response being sent under `Graceful` is finished.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use icl_core::frame::{self, PacketPrefix, HEADER_LEN, PREFIX_LEN};
use icl_core::{
    Connection, DispatchContext, Dispatcher, Disposition, Lifecycle, ListenerId, PeerAddr,
    RegistryError, RequestBuffers, ResponseStatus, ShutdownState, SocketOption, TaskCode,
    TransportError,
};
use tracing::{debug, info, trace, warn};

use crate::config::{MismatchPolicy, ServerConfig};
use crate::registry::{Binding, Descriptor, Handoff, Registry, RegistryStats};

/// How a client session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientEnd {
    /// Client left normally; the worker may serve another one
    Departed,
    /// The worker must retire with this lifecycle
    Terminate(Lifecycle),
}

impl ClientEnd {
    const DOWNED: ClientEnd = ClientEnd::Terminate(Lifecycle::DownedError);

    fn directed(mode: ShutdownState) -> ClientEnd {
        ClientEnd::Terminate(Lifecycle::for_shutdown(mode))
    }
}

/// Outcome of waiting on the free chain
enum Parked {
    Client(Handoff),
    Retire(Lifecycle),
}

/// Start a worker thread for `descriptor`, serving `handoff` first.
///
/// The descriptor must already be on the assigned chain. If the thread
/// cannot be started the descriptor is unlinked and retired here and the
/// connection is closed.
pub fn spawn_worker(
    registry: Arc<Registry>,
    descriptor: Arc<Descriptor>,
    handoff: Handoff,
    dispatcher: Arc<dyn Dispatcher>,
) -> Result<(), RegistryError> {
    let id = descriptor.id();
    let reg = Arc::clone(&registry);
    let d = Arc::clone(&descriptor);
    let spawned = thread::Builder::new()
        .name(format!("icl-worker-{}", id.as_u32()))
        .spawn(move || worker_main(reg, d, handoff, dispatcher));

    match spawned {
        Ok(handle) => {
            registry.track_thread(handle);
            Ok(())
        }
        Err(e) => {
            warn!(worker = %id, error = %e, "failed to spawn worker thread");
            // The closure (and the connection inside it) is gone already
            match registry.remove_from_assigned(&descriptor) {
                Ok(true) => {
                    registry.announce_drained();
                }
                Ok(false) => {}
                Err(err) => registry.fault(err),
            }
            registry.retire_to_reuse(&descriptor, None, Lifecycle::DownedError);
            Err(RegistryError::SpawnFailed(e.to_string()))
        }
    }
}

fn worker_main(
    registry: Arc<Registry>,
    d: Arc<Descriptor>,
    first: Handoff,
    dispatcher: Arc<dyn Dispatcher>,
) {
    let standing = match d.take_standing() {
        Some(buf) => buf,
        None => {
            registry.fault(RegistryError::ChainCorrupted {
                chain: "arena",
                detail: format!("{} started without a standing buffer", d.id()),
            });
            if let Ok(true) = registry.remove_from_assigned(&d) {
                registry.announce_drained();
            }
            drop(first);
            registry.retire_to_reuse(&d, None, Lifecycle::DownedError);
            return;
        }
    };
    let mut buffers = RequestBuffers::new(standing);
    let mut handoff = first;
    trace!(worker = %d.id(), "worker started");

    let fin = loop {
        let end = serve_client(&registry, &d, handoff, &mut buffers, dispatcher.as_ref());

        match registry.remove_from_assigned(&d) {
            Ok(true) => {
                registry.announce_drained();
            }
            Ok(false) => {}
            Err(e) => {
                registry.fault(e);
                break Lifecycle::DownedError;
            }
        }

        if let ClientEnd::Terminate(lifecycle) = end {
            break lifecycle;
        }

        match park(&registry, &d) {
            Parked::Client(next) => handoff = next,
            Parked::Retire(lifecycle) => break lifecycle,
        }
    };

    registry.retire_to_reuse(&d, Some(buffers.into_standing()), fin);
    trace!(worker = %d.id(), lifecycle = %fin, "worker exiting");
}

/// Publish `d` on the free chain and wait for a client or a directive
fn park(registry: &Registry, d: &Descriptor) -> Parked {
    let mut slot = match registry.release_to_free(d) {
        Ok(slot) => slot,
        Err(state) => return Parked::Retire(Lifecycle::for_shutdown(state)),
    };
    let poll = registry.config().park_poll_interval;

    loop {
        if let Some(h) = slot.take_handoff() {
            return Parked::Client(h);
        }
        let directive = registry.directive(d);
        if directive.is_shutting_down() {
            return Parked::Retire(Lifecycle::for_shutdown(directive));
        }

        let (guard, res) = match d.wake.wait_timeout(slot, poll) {
            Ok(r) => r,
            Err(e) => e.into_inner(),
        };
        slot = guard;

        if res.timed_out() && !slot.has_handoff() {
            let global = registry.shutdown().global();
            if global.is_shutting_down() {
                drop(slot);
                if registry.withdraw_from_free(d.id()) {
                    debug!(worker = %d.id(), mode = %global, "parked worker saw shutdown");
                    return Parked::Retire(Lifecycle::for_shutdown(global));
                }
                // A listener or a drain got there first; its handoff or
                // directive is on the way
                slot = d.lock();
            }
        }
    }
}

/// Serve one client until it leaves or the worker must stop
fn serve_client(
    registry: &Registry,
    d: &Descriptor,
    handoff: Handoff,
    buffers: &mut RequestBuffers,
    dispatcher: &dyn Dispatcher,
) -> ClientEnd {
    let Handoff { mut connection, peer, listener, path, accepted_at } = handoff;
    let config = Arc::clone(registry.config());
    let client = d.next_client();

    let options = [
        (config.tcp_nodelay, SocketOption::NoDelay(true)),
        (config.tcp_keepalive, SocketOption::KeepAlive(true)),
    ];
    for (enabled, option) in options {
        if enabled {
            if let Err(e) = connection.set_option(option) {
                debug!(worker = %d.id(), ?option, error = %e, "socket option not applied");
            }
        }
    }

    d.set_binding(Some(Binding {
        peer: peer.clone(),
        listener,
        path: Arc::clone(&path),
        idle_timeout: config.client_idle_timeout,
        oob: connection.out_of_band(),
        connected_at: Instant::now(),
    }));
    debug!(
        worker = %d.id(),
        listener = %listener,
        peer = %peer,
        client,
        waited_us = accepted_at.elapsed().as_micros() as u64,
        "serving client"
    );

    let end = Session {
        registry,
        config: &config,
        d,
        conn: connection.as_mut(),
        buffers: &mut *buffers,
        dispatcher,
        peer: &peer,
        listener,
        path: &path,
        client,
    }
    .run();

    connection.close();
    d.set_binding(None);
    buffers.release_oversized();

    match end {
        ClientEnd::Departed => debug!(worker = %d.id(), peer = %peer, client, "client departed"),
        ClientEnd::Terminate(lc) => info!(worker = %d.id(), peer = %peer, client, lifecycle = %lc, "worker terminating"),
    }
    end
}

struct Session<'a> {
    registry: &'a Registry,
    config: &'a ServerConfig,
    d: &'a Descriptor,
    conn: &'a mut dyn Connection,
    buffers: &'a mut RequestBuffers,
    dispatcher: &'a dyn Dispatcher,
    peer: &'a PeerAddr,
    listener: ListenerId,
    path: &'a str,
    client: u64,
}

impl Session<'_> {
    fn run(&mut self) -> ClientEnd {
        loop {
            if self.registry.directive(self.d) == ShutdownState::Immediate {
                return ClientEnd::directed(ShutdownState::Immediate);
            }

            // Prefix
            if let Err(end) = receive(&mut *self.conn, self.registry, self.d, self.buffers.prefix_mut(), true) {
                return end;
            }
            let prefix = match PacketPrefix::parse(self.buffers.packet(PREFIX_LEN)) {
                Ok(p) => p,
                Err(_) => return ClientEnd::DOWNED,
            };

            if let Err(e) = prefix.check_tag() {
                warn!(worker = %self.d.id(), peer = %self.peer, error = %e, "bad protocol tag");
                if prefix.plausible_first_contact(self.config.first_contact_max_len) {
                    self.reply_level_mismatch(&prefix);
                }
                return ClientEnd::DOWNED;
            }

            let total = match prefix.check_length(self.config.max_request_len) {
                Ok(n) => n,
                Err(e) => {
                    warn!(worker = %self.d.id(), peer = %self.peer, error = %e, "bad packet length");
                    return ClientEnd::DOWNED;
                }
            };
            if self.buffers.prepare(total) {
                RegistryStats::bump(&self.registry.stats().oversized_allocations);
                trace!(worker = %self.d.id(), total, "oversized request buffer");
            }

            // Remainder
            let rest = &mut self.buffers.packet_mut(total)[PREFIX_LEN..];
            if let Err(end) = receive(&mut *self.conn, self.registry, self.d, rest, false) {
                return end;
            }

            let packet = self.buffers.packet(total);
            let (task, sid) = match (frame::task_code(packet), frame::server_id(packet)) {
                (Some(t), Some(s)) => (t, s),
                _ => return ClientEnd::DOWNED,
            };

            if !task.is_pre_auth() && sid != self.config.server_id {
                warn!(
                    worker = %self.d.id(),
                    peer = %self.peer,
                    expected = self.config.server_id,
                    found = sid,
                    "server id mismatch"
                );
                if let Err(end) = self.send_error(task, ResponseStatus::ServerIdMismatch) {
                    return end;
                }
                self.buffers.release_oversized();
                match self.config.server_id_mismatch {
                    MismatchPolicy::Respond => continue,
                    MismatchPolicy::Terminate => return ClientEnd::DOWNED,
                }
            }

            if task.is_pre_auth() {
                let packet = self.buffers.packet(total);
                if let Err(e) = icl_core::validate_request(packet, &self.config.limits) {
                    warn!(worker = %self.d.id(), peer = %self.peer, task = %task, error = %e, "malformed request");
                    return ClientEnd::DOWNED;
                }
            }

            let disposition = match self.dispatch(task, total) {
                Ok(d) => d,
                Err(end) => return end,
            };
            if self.registry.directive(self.d) == ShutdownState::Immediate {
                return ClientEnd::directed(ShutdownState::Immediate);
            }

            if let Err(end) = self.send_response() {
                return end;
            }
            self.buffers.release_oversized();

            if disposition == Disposition::Finished {
                return ClientEnd::Departed;
            }
            let directive = self.registry.directive(self.d);
            if directive.is_shutting_down() {
                return ClientEnd::directed(directive);
            }
        }
    }

    fn dispatch(&mut self, task: TaskCode, total: usize) -> Result<Disposition, ClientEnd> {
        let ctx = DispatchContext {
            worker: self.d.id(),
            listener: self.listener,
            path: self.path,
            client_sequence: self.client,
            peer: self.peer,
            task,
        };
        let (request, response) = self.buffers.request_and_response(total);
        response.clear();
        let outcome = {
            let _call = self.d.enter_dispatcher();
            self.dispatcher.process(&ctx, request, response)
        };
        match outcome {
            Ok(disposition) => {
                self.d.count_request();
                RegistryStats::bump(&self.registry.stats().requests_served);
                Ok(disposition)
            }
            Err(e) => {
                warn!(worker = %self.d.id(), peer = %self.peer, task = %task, error = %e, "dispatcher failed");
                Err(ClientEnd::DOWNED)
            }
        }
    }

    /// Send the response, checking the directive at every timeout.
    /// `Immediate` abandons the send; otherwise the client gets the whole
    /// response.
    fn send_response(&mut self) -> Result<(), ClientEnd> {
        let response = self.buffers.response();
        let mut sent = 0;
        loop {
            let res = {
                let _call = self.d.enter_transport();
                self.conn.send_within(&response[sent..], self.config.recv_poll_interval)
            };
            let err = match res {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            sent += err.received();
            let interrupted = matches!(err, TransportError::Interrupted { .. });

            match err {
                TransportError::Timeout { .. } | TransportError::Interrupted { .. } => {
                    let directive = self.registry.directive(self.d);
                    if directive == ShutdownState::Immediate || (interrupted && directive.is_shutting_down()) {
                        debug!(worker = %self.d.id(), sent, total = response.len(), "send abandoned");
                        return Err(ClientEnd::directed(directive));
                    }
                    if interrupted {
                        debug!(worker = %self.d.id(), "send interrupted without a directive");
                        return Err(ClientEnd::Terminate(Lifecycle::Closed));
                    }
                }
                other => {
                    debug!(worker = %self.d.id(), peer = %self.peer, error = %other, "send failed");
                    return Err(ClientEnd::DOWNED);
                }
            }
        }
    }

    fn send_error(&mut self, task: TaskCode, status: ResponseStatus) -> Result<(), ClientEnd> {
        frame::encode_error_response(self.buffers.response_mut(), task, self.config.server_id, status);
        self.send_response()
    }

    /// Drain the rest of a bad-tag packet and answer with `LevelMismatch`.
    /// Best effort: any failure just skips the reply.
    fn reply_level_mismatch(&mut self, prefix: &PacketPrefix) {
        let declared = prefix.length as usize;
        let mut packet = vec![0u8; declared.max(PREFIX_LEN)];
        packet[..PREFIX_LEN].copy_from_slice(self.buffers.packet(PREFIX_LEN));
        if receive(&mut *self.conn, self.registry, self.d, &mut packet[PREFIX_LEN..], false).is_err() {
            return;
        }
        let task = if declared >= HEADER_LEN {
            frame::task_code(&packet).unwrap_or(TaskCode(0))
        } else {
            TaskCode(0)
        };
        let _ = self.send_error(task, ResponseStatus::LevelMismatch);
    }
}

/// Fill `buf` from the connection, checking the directive at every
/// timeout. `boundary` is true when `buf` starts a new request.
fn receive(
    conn: &mut dyn Connection,
    registry: &Registry,
    d: &Descriptor,
    buf: &mut [u8],
    boundary: bool,
) -> Result<(), ClientEnd> {
    let config = registry.config();
    let started = Instant::now();
    let mut filled = 0;
    loop {
        let res = {
            let _call = d.enter_transport();
            conn.receive_exact(&mut buf[filled..], config.recv_poll_interval)
        };
        let err = match res {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        filled += err.received();
        let idle = boundary && filled == 0;
        let interrupted = matches!(err, TransportError::Interrupted { .. });

        match err {
            TransportError::Timeout { .. } | TransportError::Interrupted { .. } => {
                let directive = registry.directive(d);
                if directive == ShutdownState::Immediate || (idle && directive.is_shutting_down()) {
                    return Err(ClientEnd::directed(directive));
                }
                if interrupted && directive.is_active() {
                    debug!(worker = %d.id(), "receive interrupted without a directive");
                    return Err(ClientEnd::Terminate(Lifecycle::Closed));
                }
                if idle {
                    if let Some(limit) = config.client_idle_timeout {
                        if started.elapsed() >= limit {
                            debug!(worker = %d.id(), "client idle timeout");
                            return Err(ClientEnd::Departed);
                        }
                    }
                }
            }
            TransportError::PeerClosed { .. } if idle => return Err(ClientEnd::Departed),
            other => {
                debug!(worker = %d.id(), received = filled, error = %other, "receive failed");
                return Err(ClientEnd::DOWNED);
            }
        }
    }
}
