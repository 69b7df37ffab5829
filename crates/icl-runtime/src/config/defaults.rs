//! Library defaults for `ServerConfig`
//!
//! Every value here can be overridden through the matching `ICL_*`
//! environment variable or a builder method.

/// Network path served when `ICL_LISTEN` is unset
pub const LISTEN: &str = "tcp=127.0.0.1:4460";

/// Assigned workers admitted before new connections are turned away
pub const MAX_WORKERS: usize = 64;

/// Worker descriptors that may ever exist (active + free + reuse)
pub const MAX_DESCRIPTORS: usize = 128;

/// Standing request buffer allocated per descriptor
pub const STANDING_BUFFER: usize = 4096;

/// Largest request packet accepted
pub const MAX_REQUEST_LEN: usize = 1 << 20;

/// Largest bad-tag packet that still earns a level-mismatch reply
pub const FIRST_CONTACT_MAX: usize = 256;

pub const RECV_POLL_MS: u64 = 200;
pub const ACCEPT_POLL_MS: u64 = 200;
pub const PARK_POLL_MS: u64 = 500;

/// Client idle limit; 0 disables it
pub const CLIENT_IDLE_MS: u64 = 0;

pub const SERVER_ID: u32 = 1;

pub const TCP_NODELAY: bool = true;
pub const TCP_KEEPALIVE: bool = true;

/// Consecutive hard accept failures before a listener stops itself
pub const ACCEPT_FAILURE_LIMIT: u32 = 16;
pub const ACCEPT_BACKOFF_MS: u64 = 50;

pub const MAX_STRING_LEN: usize = 1024;
pub const MAX_BYTES_LEN: usize = 65536;
pub const MAX_UNICODE_CHARS: usize = 1024;
