//! Server configuration
//!
//! Provides library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder methods
//! 2. Environment variables (`from_env`)
//! 3. Library defaults (`config::defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use icl_runtime::config::ServerConfig;
//!
//! let config = ServerConfig::from_env()
//!     .max_workers(16)
//!     .recv_poll_interval(Duration::from_millis(50));
//! config.validate()?;
//! ```

pub mod defaults;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use icl_core::env::{env_get, env_get_bool, env_get_duration_ms, env_get_str};
use icl_core::frame::{HEADER_LEN, PREFIX_LEN};
use icl_core::{ConfigError, FieldLimits};
use tracing::{info, warn};

/// One named network path a listener serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPath {
    pub name: String,
    pub addr: String,
}

impl NetworkPath {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self { name: name.into(), addr: addr.into() }
    }

    /// Parse `name=addr[,name=addr...]`. A bare `addr` is named `pathN`.
    pub fn parse_list(spec: &str) -> Result<Vec<NetworkPath>, ConfigError> {
        let mut out = Vec::new();
        for (i, item) in spec.split(',').map(str::trim).filter(|s| !s.is_empty()).enumerate() {
            let path = match item.split_once('=') {
                Some((name, addr)) => {
                    let (name, addr) = (name.trim(), addr.trim());
                    if name.is_empty() || addr.is_empty() {
                        return Err(ConfigError::InvalidValue {
                            key: "ICL_LISTEN",
                            value: item.to_string(),
                        });
                    }
                    NetworkPath::new(name, addr)
                }
                None => NetworkPath::new(format!("path{}", i), item),
            };
            out.push(path);
        }
        if out.is_empty() {
            return Err(ConfigError::NoPaths);
        }
        Ok(out)
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.addr)
    }
}

/// What a worker does after answering a server-id mismatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchPolicy {
    /// Send the error response and keep serving the client
    Respond,
    /// Send the error response and terminate
    Terminate,
}

impl FromStr for MismatchPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "respond" | "continue" => Ok(MismatchPolicy::Respond),
            "terminate" | "close" => Ok(MismatchPolicy::Terminate),
            _ => Err(ConfigError::InvalidValue {
                key: "ICL_SERVER_ID_MISMATCH",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for MismatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MismatchPolicy::Respond => write!(f, "respond"),
            MismatchPolicy::Terminate => write!(f, "terminate"),
        }
    }
}

/// Server configuration with builder pattern.
///
/// Shared read-only by the registry, listeners and workers once the server
/// starts.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Network paths for TCP listeners
    pub paths: Vec<NetworkPath>,
    /// Assigned-worker ceiling for admission
    pub max_workers: usize,
    /// Ceiling on worker descriptors ever created
    pub max_descriptors: usize,
    /// Standing request buffer size per descriptor
    pub standing_buffer_size: usize,
    /// Largest accepted request
    pub max_request_len: usize,
    /// Bad-tag packets up to this length get a level-mismatch reply
    pub first_contact_max_len: usize,
    /// Receive and send timeout; each expiry is a shutdown checkpoint
    pub recv_poll_interval: Duration,
    /// Accept timeout; each expiry is a shutdown checkpoint
    pub accept_poll_interval: Duration,
    /// Free-chain park timeout; each expiry is a shutdown checkpoint
    pub park_poll_interval: Duration,
    /// Client idle limit (None = unlimited)
    pub client_idle_timeout: Option<Duration>,
    /// Server instance id checked on post-authentication requests
    pub server_id: u32,
    pub server_id_mismatch: MismatchPolicy,
    pub tcp_nodelay: bool,
    pub tcp_keepalive: bool,
    /// Consecutive hard accept failures before a listener stops itself
    pub accept_failure_limit: u32,
    /// Pause after a hard accept failure
    pub accept_backoff: Duration,
    /// Plausible field sizes for pre-authentication requests
    pub limits: FieldLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ServerConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `ICL_LISTEN` - `name=addr[,name=addr...]`
    /// - `ICL_MAX_WORKERS` - Assigned-worker admission ceiling
    /// - `ICL_MAX_DESCRIPTORS` - Descriptor ceiling
    /// - `ICL_STANDING_BUFFER` - Standing buffer bytes
    /// - `ICL_MAX_REQUEST_LEN` - Largest request bytes
    /// - `ICL_FIRST_CONTACT_MAX` - Largest plausible first-contact packet
    /// - `ICL_RECV_POLL_MS` / `ICL_ACCEPT_POLL_MS` / `ICL_PARK_POLL_MS`
    /// - `ICL_CLIENT_IDLE_MS` - Client idle limit (0 = unlimited)
    /// - `ICL_SERVER_ID` - Server instance id
    /// - `ICL_SERVER_ID_MISMATCH` - `respond` or `terminate`
    /// - `ICL_TCP_NODELAY` / `ICL_TCP_KEEPALIVE` - (0/1)
    /// - `ICL_ACCEPT_FAILURE_LIMIT` / `ICL_ACCEPT_BACKOFF_MS`
    /// - `ICL_MAX_STRING_LEN` / `ICL_MAX_BYTES_LEN` / `ICL_MAX_UNICODE_CHARS`
    pub fn from_env() -> Self {
        let listen = env_get_str("ICL_LISTEN", defaults::LISTEN);
        let paths = match NetworkPath::parse_list(&listen) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(error = %e, value = %listen, "ignoring ICL_LISTEN");
                default_paths()
            }
        };
        let idle_ms: u64 = env_get("ICL_CLIENT_IDLE_MS", defaults::CLIENT_IDLE_MS);

        Self {
            paths,
            max_workers: env_get("ICL_MAX_WORKERS", defaults::MAX_WORKERS),
            max_descriptors: env_get("ICL_MAX_DESCRIPTORS", defaults::MAX_DESCRIPTORS),
            standing_buffer_size: env_get("ICL_STANDING_BUFFER", defaults::STANDING_BUFFER),
            max_request_len: env_get("ICL_MAX_REQUEST_LEN", defaults::MAX_REQUEST_LEN),
            first_contact_max_len: env_get("ICL_FIRST_CONTACT_MAX", defaults::FIRST_CONTACT_MAX),
            recv_poll_interval: env_get_duration_ms(
                "ICL_RECV_POLL_MS",
                Duration::from_millis(defaults::RECV_POLL_MS),
            ),
            accept_poll_interval: env_get_duration_ms(
                "ICL_ACCEPT_POLL_MS",
                Duration::from_millis(defaults::ACCEPT_POLL_MS),
            ),
            park_poll_interval: env_get_duration_ms(
                "ICL_PARK_POLL_MS",
                Duration::from_millis(defaults::PARK_POLL_MS),
            ),
            client_idle_timeout: (idle_ms > 0).then(|| Duration::from_millis(idle_ms)),
            server_id: env_get("ICL_SERVER_ID", defaults::SERVER_ID),
            server_id_mismatch: env_get("ICL_SERVER_ID_MISMATCH", MismatchPolicy::Respond),
            tcp_nodelay: env_get_bool("ICL_TCP_NODELAY", defaults::TCP_NODELAY),
            tcp_keepalive: env_get_bool("ICL_TCP_KEEPALIVE", defaults::TCP_KEEPALIVE),
            accept_failure_limit: env_get(
                "ICL_ACCEPT_FAILURE_LIMIT",
                defaults::ACCEPT_FAILURE_LIMIT,
            ),
            accept_backoff: env_get_duration_ms(
                "ICL_ACCEPT_BACKOFF_MS",
                Duration::from_millis(defaults::ACCEPT_BACKOFF_MS),
            ),
            limits: FieldLimits {
                max_string_len: env_get("ICL_MAX_STRING_LEN", defaults::MAX_STRING_LEN),
                max_bytes_len: env_get("ICL_MAX_BYTES_LEN", defaults::MAX_BYTES_LEN),
                max_unicode_chars: env_get("ICL_MAX_UNICODE_CHARS", defaults::MAX_UNICODE_CHARS),
            },
        }
    }

    /// Create config with library defaults (no env override).
    /// Useful for testing or when you want full control.
    pub fn new() -> Self {
        Self {
            paths: default_paths(),
            max_workers: defaults::MAX_WORKERS,
            max_descriptors: defaults::MAX_DESCRIPTORS,
            standing_buffer_size: defaults::STANDING_BUFFER,
            max_request_len: defaults::MAX_REQUEST_LEN,
            first_contact_max_len: defaults::FIRST_CONTACT_MAX,
            recv_poll_interval: Duration::from_millis(defaults::RECV_POLL_MS),
            accept_poll_interval: Duration::from_millis(defaults::ACCEPT_POLL_MS),
            park_poll_interval: Duration::from_millis(defaults::PARK_POLL_MS),
            client_idle_timeout: None,
            server_id: defaults::SERVER_ID,
            server_id_mismatch: MismatchPolicy::Respond,
            tcp_nodelay: defaults::TCP_NODELAY,
            tcp_keepalive: defaults::TCP_KEEPALIVE,
            accept_failure_limit: defaults::ACCEPT_FAILURE_LIMIT,
            accept_backoff: Duration::from_millis(defaults::ACCEPT_BACKOFF_MS),
            limits: FieldLimits {
                max_string_len: defaults::MAX_STRING_LEN,
                max_bytes_len: defaults::MAX_BYTES_LEN,
                max_unicode_chars: defaults::MAX_UNICODE_CHARS,
            },
        }
    }

    // Builder methods

    pub fn paths(mut self, paths: Vec<NetworkPath>) -> Self {
        self.paths = paths;
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.max_workers = n;
        self
    }

    pub fn max_descriptors(mut self, n: usize) -> Self {
        self.max_descriptors = n;
        self
    }

    pub fn standing_buffer_size(mut self, size: usize) -> Self {
        self.standing_buffer_size = size;
        self
    }

    pub fn max_request_len(mut self, len: usize) -> Self {
        self.max_request_len = len;
        self
    }

    pub fn first_contact_max_len(mut self, len: usize) -> Self {
        self.first_contact_max_len = len;
        self
    }

    pub fn recv_poll_interval(mut self, d: Duration) -> Self {
        self.recv_poll_interval = d;
        self
    }

    pub fn accept_poll_interval(mut self, d: Duration) -> Self {
        self.accept_poll_interval = d;
        self
    }

    pub fn park_poll_interval(mut self, d: Duration) -> Self {
        self.park_poll_interval = d;
        self
    }

    pub fn client_idle_timeout(mut self, d: Option<Duration>) -> Self {
        self.client_idle_timeout = d;
        self
    }

    pub fn server_id(mut self, id: u32) -> Self {
        self.server_id = id;
        self
    }

    pub fn server_id_mismatch(mut self, policy: MismatchPolicy) -> Self {
        self.server_id_mismatch = policy;
        self
    }

    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.tcp_nodelay = enable;
        self
    }

    pub fn tcp_keepalive(mut self, enable: bool) -> Self {
        self.tcp_keepalive = enable;
        self
    }

    pub fn accept_failure_limit(mut self, n: u32) -> Self {
        self.accept_failure_limit = n;
        self
    }

    pub fn accept_backoff(mut self, d: Duration) -> Self {
        self.accept_backoff = d;
        self
    }

    pub fn limits(mut self, limits: FieldLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Validate configuration and return the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Zero { field: "max_workers" });
        }
        if self.max_descriptors < self.max_workers {
            return Err(ConfigError::Inverted {
                lower: "max_workers",
                lo: self.max_workers,
                upper: "max_descriptors",
                hi: self.max_descriptors,
            });
        }
        if self.standing_buffer_size < HEADER_LEN {
            return Err(ConfigError::TooSmall {
                field: "standing_buffer_size",
                value: self.standing_buffer_size,
                min: HEADER_LEN,
            });
        }
        if self.max_request_len < HEADER_LEN {
            return Err(ConfigError::TooSmall {
                field: "max_request_len",
                value: self.max_request_len,
                min: HEADER_LEN,
            });
        }
        if self.first_contact_max_len < PREFIX_LEN {
            return Err(ConfigError::TooSmall {
                field: "first_contact_max_len",
                value: self.first_contact_max_len,
                min: PREFIX_LEN,
            });
        }
        for (field, d) in [
            ("recv_poll_interval", self.recv_poll_interval),
            ("accept_poll_interval", self.accept_poll_interval),
            ("park_poll_interval", self.park_poll_interval),
        ] {
            if d.is_zero() {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.accept_failure_limit == 0 {
            return Err(ConfigError::Zero { field: "accept_failure_limit" });
        }
        let mut seen = HashSet::new();
        for path in &self.paths {
            if !seen.insert(path.name.as_str()) {
                return Err(ConfigError::DuplicatePath(path.name.clone()));
            }
        }
        Ok(())
    }

    /// Log the configuration at info level
    pub fn describe(&self) {
        info!("ICL configuration:");
        for path in &self.paths {
            info!("  path:                   {}", path);
        }
        info!("  max_workers:            {}", self.max_workers);
        info!("  max_descriptors:        {}", self.max_descriptors);
        info!("  standing_buffer_size:   {}", self.standing_buffer_size);
        info!("  max_request_len:        {}", self.max_request_len);
        info!("  first_contact_max_len:  {}", self.first_contact_max_len);
        info!("  recv_poll_interval:     {:?}", self.recv_poll_interval);
        info!("  accept_poll_interval:   {:?}", self.accept_poll_interval);
        info!("  park_poll_interval:     {:?}", self.park_poll_interval);
        info!("  client_idle_timeout:    {:?}", self.client_idle_timeout);
        info!("  server_id:              {}", self.server_id);
        info!("  server_id_mismatch:     {}", self.server_id_mismatch);
        info!("  tcp_nodelay:            {}", self.tcp_nodelay);
        info!("  tcp_keepalive:          {}", self.tcp_keepalive);
        info!("  accept_failure_limit:   {}", self.accept_failure_limit);
        info!("  limits:                 {:?}", self.limits);
    }
}

fn default_paths() -> Vec<NetworkPath> {
    NetworkPath::parse_list(defaults::LISTEN).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = ServerConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.paths, vec![NetworkPath::new("tcp", "127.0.0.1:4460")]);
        assert!(config.client_idle_timeout.is_none());
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("ICL_MAX_WORKERS", "7");
        std::env::set_var("ICL_SERVER_ID_MISMATCH", "terminate");
        std::env::set_var("ICL_CLIENT_IDLE_MS", "1500");
        let config = ServerConfig::from_env();
        std::env::remove_var("ICL_MAX_WORKERS");
        std::env::remove_var("ICL_SERVER_ID_MISMATCH");
        std::env::remove_var("ICL_CLIENT_IDLE_MS");

        assert_eq!(config.max_workers, 7);
        assert_eq!(config.server_id_mismatch, MismatchPolicy::Terminate);
        assert_eq!(config.client_idle_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::new()
            .max_workers(8)
            .max_descriptors(8)
            .recv_poll_interval(Duration::from_millis(5))
            .server_id_mismatch(MismatchPolicy::Terminate);

        assert_eq!(config.max_workers, 8);
        assert_eq!(config.recv_poll_interval, Duration::from_millis(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            ServerConfig::new().max_workers(0).validate(),
            Err(ConfigError::Zero { field: "max_workers" })
        );
        assert!(matches!(
            ServerConfig::new().max_workers(10).max_descriptors(5).validate(),
            Err(ConfigError::Inverted { .. })
        ));
        assert!(matches!(
            ServerConfig::new().standing_buffer_size(8).validate(),
            Err(ConfigError::TooSmall { field: "standing_buffer_size", .. })
        ));
        assert_eq!(
            ServerConfig::new().park_poll_interval(Duration::ZERO).validate(),
            Err(ConfigError::Zero { field: "park_poll_interval" })
        );
        let dup = vec![NetworkPath::new("a", "x:1"), NetworkPath::new("a", "x:2")];
        assert_eq!(
            ServerConfig::new().paths(dup).validate(),
            Err(ConfigError::DuplicatePath("a".into()))
        );
    }

    #[test]
    fn test_parse_paths() {
        let paths = NetworkPath::parse_list("lan=0.0.0.0:4460, 127.0.0.1:4461").unwrap();
        assert_eq!(paths[0], NetworkPath::new("lan", "0.0.0.0:4460"));
        assert_eq!(paths[1], NetworkPath::new("path1", "127.0.0.1:4461"));
        assert_eq!(NetworkPath::parse_list(" , "), Err(ConfigError::NoPaths));
        assert!(NetworkPath::parse_list("=x").is_err());
    }

    #[test]
    fn test_mismatch_policy_parse() {
        assert_eq!("Respond".parse::<MismatchPolicy>(), Ok(MismatchPolicy::Respond));
        assert!("maybe".parse::<MismatchPolicy>().is_err());
    }
}
