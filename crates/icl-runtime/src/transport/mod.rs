//! Transport implementations
//!
//! - `tcp` - sockets over `std::net`, accept waits with `poll(2)`
//! - `memory` - byte pipes for tests, benchmarks and simulation

pub mod memory;
pub mod tcp;

pub use memory::{MemoryAcceptor, MemoryConnection, MemoryConnector};
pub use tcp::{TcpAcceptor, TcpConnection};
