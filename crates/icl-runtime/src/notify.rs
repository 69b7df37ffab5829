//! Management event log
//!
//! `EventLog` records every notification on a lock-free queue so a console
//! (or a test) can poll for listener terminations, the drain announcement
//! and internal faults.

use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use icl_core::{ListenerId, ManagementNotifier, RegistryError, ShutdownState};
use tracing::info;

/// One management notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ListenerTerminated(ListenerId, ShutdownState),
    ServerDrained,
    InternalFault(RegistryError),
}

/// `ManagementNotifier` that queues events
#[derive(Debug, Default)]
pub struct EventLog {
    events: SegQueue<ServerEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything queued so far
    pub fn drain(&self) -> Vec<ServerEvent> {
        let mut out = Vec::with_capacity(self.events.len());
        while let Some(e) = self.events.pop() {
            out.push(e);
        }
        out
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Poll until `pred` matches a queued event or the timeout passes.
    /// Events seen along the way are returned in order either way.
    pub fn wait_for(
        &self,
        timeout: Duration,
        pred: impl Fn(&ServerEvent) -> bool,
    ) -> (bool, Vec<ServerEvent>) {
        let deadline = Instant::now() + timeout;
        let mut seen = Vec::new();
        loop {
            while let Some(e) = self.events.pop() {
                seen.push(e);
            }
            if seen.iter().any(&pred) {
                return (true, seen);
            }
            if Instant::now() >= deadline {
                return (false, seen);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl ManagementNotifier for EventLog {
    fn listener_terminated(&self, listener: ListenerId, mode: ShutdownState) {
        info!(listener = %listener, mode = %mode, "listener terminated");
        self.events.push(ServerEvent::ListenerTerminated(listener, mode));
    }

    fn server_drained(&self) {
        self.events.push(ServerEvent::ServerDrained);
    }

    fn internal_fault(&self, err: &RegistryError) {
        self.events.push(ServerEvent::InternalFault(err.clone()));
    }
}
