//! # icl-core
//!
//! Core types for the Initial Connection Listener (ICL) and its Server
//! Worker pool.
//!
//! This crate is platform-agnostic and contains no threads, sockets or
//! locks. The registry, workers, listeners and transports live in
//! `icl-runtime`.
//!
//! ## Modules
//!
//! - `id` - Worker and listener identifier types
//! - `state` - Descriptor lifecycle, shutdown state and activity kinds
//! - `error` - Error types for every concern
//! - `frame` - Request/response framing (tag, length, task code)
//! - `validate` - Bounds-checked shape validation of pre-auth requests
//! - `buffer` - Standing, oversized and response buffers
//! - `traits` - Transport, Dispatcher and management collaborator traits
//! - `logging` - `tracing` subscriber setup driven by environment
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod error;
pub mod frame;
pub mod validate;
pub mod buffer;
pub mod traits;
pub mod logging;
pub mod env;

// Re-exports for convenience
pub use id::{ListenerId, WorkerId};
pub use state::{ActivityKind, Lifecycle, ShutdownDirective, ShutdownState};
pub use error::{
    ServerResult, ConfigError, DispatchError, FrameError, RegistryError, ServerError, TransportError,
    ValidationError,
};
pub use frame::{PacketPrefix, RequestBuilder, ResponseStatus, TaskCode};
pub use validate::{validate_request, FieldLimits, ValidatedRequest};
pub use buffer::{RequestBuffers, StandingBuffer};
pub use traits::{
    Accepted, Acceptor, Connection, DispatchContext, Dispatcher, Disposition,
    ManagementNotifier, NullNotifier, OutOfBand, PeerAddr, SocketOption,
};
pub use logging::LogLevel;
pub use env::{env_get, env_get_bool, env_get_duration_ms, env_get_opt, env_get_str};
