//! In-memory transport
//!
//! Connections are pairs of byte pipes; an acceptor is a queue of pending
//! connections fed by a `MemoryConnector`. Used by tests and benchmarks to
//! drive listeners and workers without sockets, with the same timeout,
//! close and out-of-band semantics as the TCP transport. Pipes are
//! unbounded unless created with a capacity, in which case a send blocks
//! while the pipe is full, like a socket whose peer stopped reading.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use icl_core::frame::{PacketPrefix, PREFIX_LEN};
use icl_core::{Accepted, Acceptor, Connection, OutOfBand, PeerAddr, SocketOption, TransportError};

#[derive(Debug, Default)]
struct PipeState {
    data: VecDeque<u8>,
    closed: bool,
    /// Reader woken out of band
    interrupted: bool,
    /// Writer woken out of band
    send_interrupted: bool,
}

/// One direction of a connection
#[derive(Debug)]
struct Pipe {
    state: Mutex<PipeState>,
    cond: Condvar,
    capacity: usize,
}

impl Pipe {
    fn new(capacity: usize) -> Arc<Pipe> {
        Arc::new(Pipe {
            state: Mutex::new(PipeState::default()),
            cond: Condvar::new(),
            capacity,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close(&self) {
        self.lock().closed = true;
        self.cond.notify_all();
    }
}

/// Interrupts receives and sends on one end of a memory connection
struct MemoryOob {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
}

impl OutOfBand for MemoryOob {
    fn signal(&self) {
        self.rx.lock().interrupted = true;
        self.rx.cond.notify_all();
        self.tx.lock().send_interrupted = true;
        self.tx.cond.notify_all();
    }
}

/// One end of an in-memory connection
#[derive(Debug)]
pub struct MemoryConnection {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    options: Vec<SocketOption>,
}

impl MemoryConnection {
    /// Two connected ends
    pub fn pair() -> (MemoryConnection, MemoryConnection) {
        Self::bounded_pair(usize::MAX)
    }

    /// Two connected ends whose pipes each hold at most `capacity` unread bytes
    pub fn bounded_pair(capacity: usize) -> (MemoryConnection, MemoryConnection) {
        let a = Pipe::new(capacity.max(1));
        let b = Pipe::new(capacity.max(1));
        (
            MemoryConnection { rx: Arc::clone(&a), tx: Arc::clone(&b), options: Vec::new() },
            MemoryConnection { rx: b, tx: a, options: Vec::new() },
        )
    }

    /// Options applied so far
    pub fn options(&self) -> &[SocketOption] {
        &self.options
    }

    /// Receive one framed packet (prefix, then the declared remainder)
    pub fn recv_packet(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut prefix = [0u8; PREFIX_LEN];
        self.receive_exact(&mut prefix, timeout)?;
        let len = PacketPrefix::parse(&prefix)
            .map(|p| p.length as usize)
            .unwrap_or(PREFIX_LEN)
            .max(PREFIX_LEN);
        let mut packet = vec![0u8; len];
        packet[..PREFIX_LEN].copy_from_slice(&prefix);
        self.receive_exact(&mut packet[PREFIX_LEN..], timeout)?;
        Ok(packet)
    }

    /// Wait until the peer has closed, discarding unread bytes.
    /// Returns false on timeout.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.rx.lock();
        loop {
            if st.closed && st.data.is_empty() {
                return true;
            }
            st.data.clear();
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            st = match self.rx.cond.wait_timeout(st, deadline - now) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
    }
}

impl Connection for MemoryConnection {
    fn receive_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let mut received = 0;
        let mut st = self.rx.lock();
        loop {
            let before = received;
            while received < buf.len() {
                match st.data.pop_front() {
                    Some(b) => {
                        buf[received] = b;
                        received += 1;
                    }
                    None => break,
                }
            }
            if received > before {
                // Room for a writer waiting on a full pipe
                self.rx.cond.notify_all();
            }
            if received == buf.len() {
                return Ok(());
            }
            if st.interrupted {
                return Err(TransportError::Interrupted { received });
            }
            if st.closed {
                return Err(TransportError::PeerClosed { received });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout { received });
            }
            st = match self.rx.cond.wait_timeout(st, deadline - now) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
    }

    fn send_within(&mut self, buf: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let mut sent = 0;
        let mut st = self.tx.lock();
        loop {
            if st.closed {
                return Err(TransportError::Failed(io::Error::from(io::ErrorKind::BrokenPipe)));
            }
            if st.send_interrupted {
                return Err(TransportError::Interrupted { received: sent });
            }
            let room = self.tx.capacity.saturating_sub(st.data.len());
            let n = room.min(buf.len() - sent);
            if n > 0 {
                st.data.extend(buf[sent..sent + n].iter().copied());
                sent += n;
                self.tx.cond.notify_all();
            }
            if sent == buf.len() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout { received: sent });
            }
            st = match self.tx.cond.wait_timeout(st, deadline - now) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
    }

    fn set_option(&mut self, option: SocketOption) -> Result<(), TransportError> {
        self.options.push(option);
        Ok(())
    }

    fn out_of_band(&self) -> Arc<dyn OutOfBand> {
        Arc::new(MemoryOob { rx: Arc::clone(&self.rx), tx: Arc::clone(&self.tx) })
    }

    fn close(&mut self) {
        self.rx.close();
        self.tx.close();
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}

enum Pending {
    Connection(Accepted),
    Failure(io::ErrorKind),
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    closed: bool,
}

#[derive(Default)]
struct AcceptQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    next_peer: AtomicU64,
}

impl AcceptQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Listening side of the in-memory transport
pub struct MemoryAcceptor {
    queue: Arc<AcceptQueue>,
}

/// Client side: opens connections to a `MemoryAcceptor`
#[derive(Clone)]
pub struct MemoryConnector {
    queue: Arc<AcceptQueue>,
}

impl MemoryAcceptor {
    pub fn new() -> (MemoryAcceptor, MemoryConnector) {
        let queue = Arc::new(AcceptQueue::default());
        (MemoryAcceptor { queue: Arc::clone(&queue) }, MemoryConnector { queue })
    }
}

impl MemoryConnector {
    /// Open a connection; the client end is returned
    pub fn connect(&self) -> Result<MemoryConnection, TransportError> {
        self.connect_bounded(usize::MAX)
    }

    /// Open a connection whose pipes hold at most `capacity` unread bytes
    pub fn connect_bounded(&self, capacity: usize) -> Result<MemoryConnection, TransportError> {
        let (server, client) = MemoryConnection::bounded_pair(capacity);
        let n = self.queue.next_peer.fetch_add(1, Ordering::Relaxed);
        let mut st = self.queue.lock();
        if st.closed {
            return Err(TransportError::Failed(io::Error::from(io::ErrorKind::ConnectionRefused)));
        }
        st.pending.push_back(Pending::Connection(Accepted {
            connection: Box::new(server),
            peer: PeerAddr::Local(format!("client-{}", n)),
        }));
        drop(st);
        self.queue.cond.notify_all();
        Ok(client)
    }

    /// Make the next `accept` fail with a hard error
    pub fn inject_failure(&self, kind: io::ErrorKind) {
        self.queue.lock().pending.push_back(Pending::Failure(kind));
        self.queue.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }
}

impl Acceptor for MemoryAcceptor {
    fn accept(&mut self, timeout: Duration) -> Result<Accepted, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut st = self.queue.lock();
        loop {
            if st.closed {
                return Err(TransportError::Closed);
            }
            match st.pending.pop_front() {
                Some(Pending::Connection(a)) => return Ok(a),
                Some(Pending::Failure(kind)) => return Err(TransportError::Failed(io::Error::from(kind))),
                None => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout { received: 0 });
            }
            st = match self.queue.cond.wait_timeout(st, deadline - now) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
    }

    fn close(&mut self) {
        let mut st = self.queue.lock();
        st.closed = true;
        // Refuse whatever was queued but never accepted
        for p in st.pending.drain(..) {
            if let Pending::Connection(mut a) = p {
                a.connection.close();
            }
        }
        drop(st);
        self.queue.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(200);

    #[test]
    fn test_pair_roundtrip() {
        let (mut a, mut b) = MemoryConnection::pair();
        a.send(b"hello").unwrap();
        let mut buf = [0u8; 5];
        b.receive_exact(&mut buf, T).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_partial_then_timeout() {
        let (mut a, mut b) = MemoryConnection::pair();
        a.send(b"abc").unwrap();
        let mut buf = [0u8; 5];
        match b.receive_exact(&mut buf, Duration::from_millis(20)) {
            Err(TransportError::Timeout { received: 3 }) => {}
            other => panic!("unexpected {:?}", other),
        }
        a.send(b"de").unwrap();
        b.receive_exact(&mut buf[3..], T).unwrap();
        assert_eq!(&buf, b"abcde");
    }

    #[test]
    fn test_peer_close() {
        let (mut a, mut b) = MemoryConnection::pair();
        a.send(b"x").unwrap();
        a.close();
        let mut buf = [0u8; 2];
        assert!(matches!(
            b.receive_exact(&mut buf, T),
            Err(TransportError::PeerClosed { received: 1 })
        ));
        assert!(b.send(b"y").is_err());
    }

    #[test]
    fn test_out_of_band_interrupts() {
        let (_a, mut b) = MemoryConnection::pair();
        let oob = b.out_of_band();
        let t = std::thread::spawn(move || {
            let mut buf = [0u8; 1];
            b.receive_exact(&mut buf, Duration::from_secs(10))
        });
        std::thread::sleep(Duration::from_millis(20));
        oob.signal();
        assert!(matches!(t.join().unwrap(), Err(TransportError::Interrupted { received: 0 })));
    }

    #[test]
    fn test_bounded_send_blocks_until_read() {
        let (mut a, mut b) = MemoryConnection::bounded_pair(4);
        match a.send_within(b"abcdefgh", Duration::from_millis(20)) {
            Err(TransportError::Timeout { received: 4 }) => {}
            other => panic!("unexpected {:?}", other),
        }
        let t = std::thread::spawn(move || {
            a.send(b"efgh").unwrap();
            a
        });
        let mut buf = [0u8; 8];
        b.receive_exact(&mut buf, T).unwrap();
        assert_eq!(&buf, b"abcdefgh");
        t.join().unwrap();
    }

    #[test]
    fn test_out_of_band_interrupts_blocked_send() {
        let (mut a, _b) = MemoryConnection::bounded_pair(2);
        let oob = a.out_of_band();
        let t = std::thread::spawn(move || a.send_within(b"hello", Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(20));
        oob.signal();
        assert!(matches!(t.join().unwrap(), Err(TransportError::Interrupted { received: 2 })));
    }

    #[test]
    fn test_acceptor_queue() {
        let (mut acc, conn) = MemoryAcceptor::new();
        assert!(matches!(
            acc.accept(Duration::from_millis(10)),
            Err(TransportError::Timeout { .. })
        ));
        let mut client = conn.connect().unwrap();
        let mut accepted = acc.accept(T).unwrap();
        client.send(b"ping").unwrap();
        let mut buf = [0u8; 4];
        accepted.connection.receive_exact(&mut buf, T).unwrap();
        assert_eq!(&buf, b"ping");

        conn.inject_failure(io::ErrorKind::Other);
        assert!(matches!(acc.accept(T), Err(TransportError::Failed(_))));

        acc.close();
        assert!(matches!(acc.accept(T), Err(TransportError::Closed)));
        assert!(conn.connect().is_err());
    }

    #[test]
    fn test_wait_closed() {
        let (mut a, b) = MemoryConnection::pair();
        assert!(!b.wait_closed(Duration::from_millis(10)));
        a.close();
        assert!(b.wait_closed(T));
    }
}
