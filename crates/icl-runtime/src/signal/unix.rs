//! Unix signal handlers for shutdown requests

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use icl_core::ShutdownState;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::debug;

static HANDLERS_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Strongest shutdown requested so far, as a `ShutdownState` value
static PENDING: AtomicU8 = AtomicU8::new(ShutdownState::Active as u8);

extern "C" fn on_signal(signo: libc::c_int) {
    let mode = if signo == libc::SIGQUIT {
        ShutdownState::Immediate
    } else {
        ShutdownState::Graceful
    };
    // Async-signal-safe: a single atomic op
    PENDING.fetch_max(mode as u8, Ordering::AcqRel);
}

/// Install the shutdown handlers (idempotent)
pub fn install() -> io::Result<()> {
    if HANDLERS_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    let action = SigAction::new(SigHandler::Handler(on_signal), SaFlags::SA_RESTART, SigSet::empty());
    for sig in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGQUIT] {
        // SAFETY: the handler only touches an atomic
        unsafe { sigaction(sig, &action) }.map_err(io::Error::from)?;
    }
    debug!("shutdown signal handlers installed");
    Ok(())
}

/// Take the strongest shutdown requested since the last call
pub fn take_pending() -> Option<ShutdownState> {
    let raw = PENDING.swap(ShutdownState::Active as u8, Ordering::AcqRel);
    match ShutdownState::try_from(raw) {
        Ok(ShutdownState::Active) => None,
        Ok(mode) => Some(mode),
        Err(_) => Some(ShutdownState::Immediate),
    }
}
