//! `ICL_*` environment overrides
//!
//! Every setting falls back to its compiled default when the variable is
//! unset, blank or unparsable, so a typo never stops the server from
//! starting. `ServerConfig::from_env` and the logging setup read through
//! these helpers.
//!
//! ```ignore
//! use icl_core::env::{env_get, env_get_bool, env_get_duration_ms};
//!
//! let workers: usize = env_get("ICL_MAX_WORKERS", 64);
//! let nodelay = env_get_bool("ICL_TCP_NODELAY", true);
//! let poll = env_get_duration_ms("ICL_RECV_POLL_MS", Duration::from_millis(200));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Trimmed value of `key`; blank counts as unset
fn raw(key: &str) -> Option<String> {
    let val = std::env::var(key).ok()?;
    let val = val.trim();
    (!val.is_empty()).then(|| val.to_string())
}

/// Parsed value of `key`, or `default`
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// Switch: `1`/`true`/`yes`/`on` and `0`/`false`/`no`/`off`, any case.
/// Anything else keeps `default`.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match raw(key).map(|v| v.to_ascii_lowercase()).as_deref() {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    raw(key)?.parse().ok()
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    raw(key).unwrap_or_else(|| default.to_string())
}

/// Millisecond count as a `Duration`
#[inline]
pub fn env_get_duration_ms(key: &str, default: Duration) -> Duration {
    env_get_opt(key).map(Duration::from_millis).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test owns its variable names; tests run in parallel.

    #[test]
    fn test_unset_uses_defaults() {
        let key = "__ICL_ENV_UNSET__";
        assert_eq!(env_get(key, 42usize), 42);
        assert_eq!(env_get_opt::<usize>(key), None);
        assert_eq!(env_get_str(key, "tcp"), "tcp");
        assert!(env_get_bool(key, true));
        assert_eq!(env_get_duration_ms(key, Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[test]
    fn test_values_are_trimmed() {
        std::env::set_var("__ICL_ENV_NUM__", " 123 ");
        assert_eq!(env_get("__ICL_ENV_NUM__", 0usize), 123);
        std::env::set_var("__ICL_ENV_STR__", "  127.0.0.1:4460\n");
        assert_eq!(env_get_str("__ICL_ENV_STR__", ""), "127.0.0.1:4460");
        std::env::remove_var("__ICL_ENV_NUM__");
        std::env::remove_var("__ICL_ENV_STR__");
    }

    #[test]
    fn test_blank_counts_as_unset() {
        std::env::set_var("__ICL_ENV_BLANK__", "   ");
        assert_eq!(env_get_str("__ICL_ENV_BLANK__", "dflt"), "dflt");
        assert_eq!(env_get("__ICL_ENV_BLANK__", 7u32), 7);
        assert!(!env_get_bool("__ICL_ENV_BLANK__", false));
        std::env::remove_var("__ICL_ENV_BLANK__");
    }

    #[test]
    fn test_bool_switches() {
        let key = "__ICL_ENV_BOOL__";
        for (v, default, want) in [
            ("1", false, true),
            ("TRUE", false, true),
            ("on", false, true),
            ("0", true, false),
            ("Off", true, false),
            ("no", true, false),
            ("garbage", true, true),
            ("garbage", false, false),
        ] {
            std::env::set_var(key, v);
            assert_eq!(env_get_bool(key, default), want, "value {:?}", v);
        }
        std::env::remove_var(key);
    }

    #[test]
    fn test_unparsable_falls_back() {
        std::env::set_var("__ICL_ENV_BAD__", "soon");
        assert_eq!(env_get("__ICL_ENV_BAD__", 99usize), 99);
        assert_eq!(
            env_get_duration_ms("__ICL_ENV_BAD__", Duration::from_millis(5)),
            Duration::from_millis(5)
        );
        std::env::set_var("__ICL_ENV_BAD__", "250");
        assert_eq!(env_get_duration_ms("__ICL_ENV_BAD__", Duration::ZERO), Duration::from_millis(250));
        std::env::remove_var("__ICL_ENV_BAD__");
    }
}
