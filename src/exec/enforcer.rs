//! Limit enforcement: deadline arming and forced termination
//!
//! Memory and pids ceilings live in the cgroup and rlimits; the only limit
//! enforced from user space is the wall-clock deadline.

use crate::config::types::LimitsConfig;
use crate::exec::launcher::SandboxProcess;
use crossbeam_channel::{after, never, Receiver};
use std::time::{Duration, Instant};

/// How long the proxy gets to report after the payload was killed
pub const KILL_GRACE: Duration = Duration::from_secs(2);

/// Deadline handling for one run
#[derive(Clone, Copy, Debug)]
pub struct LimitEnforcer {
    time_limit: Option<Duration>,
}

impl LimitEnforcer {
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            time_limit: limits.time_ms.map(Duration::from_millis),
        }
    }

    /// Arm the deadline. Must be called once the payload has started; the
    /// returned channel never fires when no time limit is configured.
    pub fn arm(&self) -> Receiver<Instant> {
        match self.time_limit {
            Some(limit) => {
                log::debug!("Deadline armed: {}ms", limit.as_millis());
                after(limit)
            }
            None => never(),
        }
    }

    /// Have the proxy SIGKILL the PID-namespace init.
    ///
    /// The kernel then kills every process in the namespace. The proxy stays
    /// alive so it can still reap the payload and report how it ended.
    pub fn terminate(&self, process: &SandboxProcess) {
        if let Err(e) = process.request_kill() {
            log::debug!("terminate: proxy {} gone: {}", process.proxy_pid, e);
        }
    }

    /// SIGKILL the proxy's process group. Used when the proxy did not report
    /// within [`KILL_GRACE`].
    pub fn escalate(&self, process: &SandboxProcess) {
        if !process.kill_group() {
            log::debug!("escalate: proxy {} already reaped", process.proxy_pid);
        }
    }
}
