//! Shutdown signals
//!
//! On Unix, `SIGTERM` and `SIGINT` request a graceful shutdown and `SIGQUIT`
//! an immediate one. Handlers only record the request; the server binary
//! polls `take_pending` and posts the shutdown itself.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    } else {
        use icl_core::ShutdownState;

        /// No signal handling on this platform
        pub fn install() -> std::io::Result<()> {
            Ok(())
        }

        pub fn take_pending() -> Option<ShutdownState> {
            None
        }
    }
}
