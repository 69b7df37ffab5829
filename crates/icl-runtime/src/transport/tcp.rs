//! TCP transport over `std::net`
//!
//! Accept waits use `poll(2)` on the listening socket so the listener can
//! time out and check its shutdown state. Receives and sends use per-call
//! socket timeouts. The out-of-band wake flags the connection and shuts
//! down both halves of the socket, so a blocked read or write returns and
//! reports `Interrupted`.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use icl_core::{Accepted, Acceptor, Connection, OutOfBand, PeerAddr, SocketOption, TransportError};
use tracing::{debug, trace};

/// Listening TCP socket
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: Option<TcpListener>,
}

impl TcpAcceptor {
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)?;
        #[cfg(not(unix))]
        listener.set_nonblocking(true)?;
        debug!(addr = ?listener.local_addr().ok(), "tcp acceptor bound");
        Ok(Self { listener: Some(listener) })
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::os::unix::io::AsRawFd;

        /// Wait for the listening socket to become readable
        fn wait_readable(listener: &TcpListener, timeout: Duration) -> Result<(), TransportError> {
            let mut pfd = libc::pollfd {
                fd: listener.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
            // SAFETY: one valid pollfd for the duration of the call
            let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
            match rc {
                0 => Err(TransportError::Timeout { received: 0 }),
                n if n > 0 => Ok(()),
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        Err(TransportError::Interrupted { received: 0 })
                    } else {
                        Err(TransportError::Failed(err))
                    }
                }
            }
        }

        fn apply_option(stream: &TcpStream, option: SocketOption) -> io::Result<()> {
            use nix::sys::socket::{setsockopt, sockopt};

            let res = match option {
                SocketOption::NoDelay(on) => setsockopt(stream, sockopt::TcpNoDelay, &on),
                SocketOption::KeepAlive(on) => setsockopt(stream, sockopt::KeepAlive, &on),
                SocketOption::RecvBufferSize(n) => setsockopt(stream, sockopt::RcvBuf, &n),
                SocketOption::SendBufferSize(n) => setsockopt(stream, sockopt::SndBuf, &n),
                SocketOption::Linger(d) => {
                    let linger = libc::linger {
                        l_onoff: d.is_some() as libc::c_int,
                        l_linger: d.map_or(0, |d| d.as_secs().min(i32::MAX as u64) as libc::c_int),
                    };
                    setsockopt(stream, sockopt::Linger, &linger)
                }
            };
            res.map_err(io::Error::from)
        }
    } else {
        /// The listener is non-blocking here; nap briefly and let `accept`
        /// report `WouldBlock` as a timeout
        fn wait_readable(_listener: &TcpListener, timeout: Duration) -> Result<(), TransportError> {
            std::thread::sleep(timeout.min(Duration::from_millis(10)));
            Ok(())
        }

        fn apply_option(stream: &TcpStream, option: SocketOption) -> io::Result<()> {
            match option {
                SocketOption::NoDelay(on) => stream.set_nodelay(on),
                _ => Err(io::Error::from(io::ErrorKind::Unsupported)),
            }
        }
    }
}

impl Acceptor for TcpAcceptor {
    fn accept(&mut self, timeout: Duration) -> Result<Accepted, TransportError> {
        let listener = self.listener.as_ref().ok_or(TransportError::Closed)?;
        wait_readable(listener, timeout)?;
        match listener.accept() {
            Ok((stream, addr)) => {
                trace!(peer = %addr, "tcp accept");
                let connection = TcpConnection::new(stream)?;
                Ok(Accepted {
                    connection: Box::new(connection),
                    peer: PeerAddr::Inet(addr),
                })
            }
            Err(e) => Err(match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                    TransportError::Timeout { received: 0 }
                }
                io::ErrorKind::Interrupted => TransportError::Interrupted { received: 0 },
                io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => {
                    TransportError::Aborted
                }
                _ => TransportError::Failed(e),
            }),
        }
    }

    fn close(&mut self) {
        self.listener = None;
    }
}

/// Out-of-band wake for a TCP connection
#[derive(Debug)]
struct TcpOob {
    stream: TcpStream,
    signalled: AtomicBool,
}

impl OutOfBand for TcpOob {
    fn signal(&self) {
        self.signalled.store(true, Ordering::Release);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// One accepted TCP connection
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    oob: Arc<TcpOob>,
    closed: bool,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nonblocking(false)?;
        let oob = Arc::new(TcpOob {
            stream: stream.try_clone()?,
            signalled: AtomicBool::new(false),
        });
        Ok(Self { stream, oob, closed: false })
    }

    /// Client-side connect, used by tools and tests
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        Self::new(TcpStream::connect(addr)?)
    }

    #[inline]
    fn interrupted(&self) -> bool {
        self.oob.signalled.load(Ordering::Acquire)
    }
}

impl Connection for TcpConnection {
    fn receive_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let mut received = 0;
        while received < buf.len() {
            if self.interrupted() {
                return Err(TransportError::Interrupted { received });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout { received });
            }
            // A zero read timeout means "block forever"; the deadline check
            // above guarantees a positive remainder
            self.stream.set_read_timeout(Some(deadline - now))?;
            match self.stream.read(&mut buf[received..]) {
                Ok(0) if self.interrupted() => return Err(TransportError::Interrupted { received }),
                Ok(0) => return Err(TransportError::PeerClosed { received }),
                Ok(n) => received += n,
                Err(e) => match e.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                        return Err(TransportError::Timeout { received })
                    }
                    io::ErrorKind::Interrupted => continue,
                    _ if self.interrupted() => return Err(TransportError::Interrupted { received }),
                    _ => return Err(TransportError::Failed(e)),
                },
            }
        }
        Ok(())
    }

    fn send_within(&mut self, buf: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let mut sent = 0;
        while sent < buf.len() {
            if self.interrupted() {
                return Err(TransportError::Interrupted { received: sent });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout { received: sent });
            }
            self.stream.set_write_timeout(Some(deadline - now))?;
            match self.stream.write(&buf[sent..]) {
                Ok(0) => return Err(TransportError::Failed(io::ErrorKind::WriteZero.into())),
                Ok(n) => sent += n,
                Err(e) => match e.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                        return Err(TransportError::Timeout { received: sent })
                    }
                    io::ErrorKind::Interrupted => continue,
                    _ if self.interrupted() => return Err(TransportError::Interrupted { received: sent }),
                    _ => return Err(TransportError::Failed(e)),
                },
            }
        }
        Ok(())
    }

    fn set_option(&mut self, option: SocketOption) -> Result<(), TransportError> {
        apply_option(&self.stream, option)?;
        Ok(())
    }

    fn out_of_band(&self) -> Arc<dyn OutOfBand> {
        Arc::clone(&self.oob) as Arc<dyn OutOfBand>
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}
