//! Logging setup
//!
//! All crates log through `tracing` macros. Binaries and tests call
//! [`init`] once to install a stderr `tracing-subscriber` formatter.
//!
//! # Environment Variables
//!
//! - `ICL_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//!   (names are accepted too). Default: info.
//! - `ICL_LOG_ANSI=1` - Colored output. Default: off.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::level_filters::LevelFilter;

use crate::env::{env_get_bool, env_get_str};

/// Log levels (matches common conventions)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse a level name or number; unknown values fall back to Info
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    pub fn from_env() -> Self {
        Self::parse(&env_get_str("ICL_LOG_LEVEL", "info"))
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> LevelFilter {
        match level {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize logging from environment variables
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init() {
    init_with_level(LogLevel::from_env());
}

/// Initialize logging with an explicit level
pub fn init_with_level(level: LogLevel) {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    // A subscriber may already be installed by the embedding program
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from(level))
        .with_thread_names(true)
        .with_target(false)
        .with_ansi(env_get_bool("ICL_LOG_ANSI", false))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Logging for unit tests: captured by the test harness, level from env
#[doc(hidden)]
pub fn init_for_tests() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from(LogLevel::from_env()))
        .with_thread_names(true)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("2"), LogLevel::Warn);
        assert_eq!(LogLevel::parse(" TRACE "), LogLevel::Trace);
        assert_eq!(LogLevel::parse("bogus"), LogLevel::Info);
    }

    #[test]
    fn test_level_filter() {
        assert_eq!(LevelFilter::from(LogLevel::Off), LevelFilter::OFF);
        assert_eq!(LevelFilter::from(LogLevel::Warn), LevelFilter::WARN);
        assert!(LogLevel::Error < LogLevel::Trace);
        assert_eq!(LogLevel::from_u8(9), LogLevel::Trace);
    }

    #[test]
    fn test_init_idempotent() {
        init_for_tests();
        init_for_tests();
        init();
        tracing::debug!("logging initialized");
    }
}
