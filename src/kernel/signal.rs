//! Async-safe host signal handling
//!
//! SIGINT/SIGTERM only set atomic flags; a watcher turns them into cancellation.
use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Global shutdown flag (async-safe atomic)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Global signal received (async-safe atomic)
static SIGNAL_RECEIVED: AtomicU32 = AtomicU32::new(0);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Signal handler state
pub struct SignalHandler;

impl SignalHandler {
    /// Install handlers for SIGINT and SIGTERM.
    /// Call early in main(), before any sandbox is launched.
    pub fn init() -> Result<Self, String> {
        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        // SAFETY: the handler only touches atomics.
        unsafe {
            signal::sigaction(Signal::SIGINT, &sig_action)
                .map_err(|e| format!("Failed to install SIGINT handler: {}", e))?;
            signal::sigaction(Signal::SIGTERM, &sig_action)
                .map_err(|e| format!("Failed to install SIGTERM handler: {}", e))?;
        }

        info!("Signal handlers installed (SIGINT, SIGTERM)");
        Ok(Self)
    }

    /// No allocations, no locks, no I/O
    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal as u32, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Signal that was received (0 if none)
    pub fn get_signal(&self) -> u32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
        SIGNAL_RECEIVED.store(0, Ordering::SeqCst);
    }

    pub fn poll_interval() -> Duration {
        POLL_INTERVAL
    }
}
