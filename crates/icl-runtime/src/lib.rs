//! # icl-runtime
//!
//! Threads, locks and sockets for the Initial Connection Listener.
//!
//! This crate provides:
//! - The worker registry: descriptor arena with free, assigned and reuse chains
//! - Server Workers (one OS thread per bound client)
//! - Listeners (one OS thread per network path)
//! - The shutdown coordinator and Unix shutdown signals
//! - TCP and in-memory transports
//! - `Server`, which wires everything together

pub mod config;
pub mod registry;
pub mod shutdown;
pub mod worker;
pub mod listener;
pub mod server;
pub mod notify;
pub mod signal;
pub mod transport;

#[cfg(test)]
mod testkit;

// Re-exports
pub use config::{MismatchPolicy, NetworkPath, ServerConfig};
pub use registry::{Descriptor, Registry, RegistryStats, StatsSnapshot};
pub use shutdown::ShutdownCoordinator;
pub use listener::Listener;
pub use server::{Server, ServerHandle, ServerReport};
pub use notify::{EventLog, ServerEvent};
