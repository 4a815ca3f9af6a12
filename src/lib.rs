//! runj: single-run sandbox execution engine
//!
//! Runs one command inside a freshly built filesystem view, under a wall-clock
//! deadline and kernel-enforced resource ceilings, and reports how it ended.
//!
//! # Architecture
//!
//! The crate is organized by Linux kernel primitive families:
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::namespace`]: mount/PID/IPC/UTS (and user) namespaces, id maps
//! - [`kernel::mount`]: mount planning, the mount table, root switch
//! - [`kernel::cgroup`]: per-run cgroup v2 for memory and pids ceilings
//! - [`kernel::rlimit`]: rlimits applied right before exec
//! - [`kernel::signal`]: host SIGINT/SIGTERM handling
//!
//! ## Execution Control ([`exec`])
//! - [`exec::preexec`]: type-state ordered pre-exec chain
//! - [`exec::launcher`]: host -> proxy -> payload process model
//! - [`exec::enforcer`]: deadline arming and forced kill
//! - [`exec::coordinator`]: per-run state machine and single wait point
//!
//! ## Verdict ([`verdict`])
//! - [`verdict::classifier`]: termination cause -> `{status, exit_code}`
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::workspace`]: run-scoped host workspace
//! - [`safety::cleanup`]: idempotent resource ledger
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: configuration, report, error taxonomy
//! - [`config::validator`]: configuration validation
//!
//! # Example
//!
//! ```no_run
//! use runj::{MountConfig, RunConfig};
//!
//! let mut config = RunConfig::new(["/bin/true"]);
//! config.mounts.push(MountConfig::new("/bin", "/bin", &["exec"]));
//! config.mounts.push(MountConfig::new("/lib", "/lib", &["exec"]));
//! config.limits.time_ms = Some(1000);
//!
//! let report = runj::run(&config)?;
//! println!("{}", serde_json::to_string(&report)?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// Verdict
pub mod verdict;

// Safety & Cleanup
pub mod safety;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint wiring for the runj binary
pub mod cli;

pub use config::types::*;
pub use exec::coordinator::{cancel_pair, CancelHandle, CancelSignal};
pub use verdict::classifier::{
    CANCELLED_EXIT_CODE, EXEC_FAILED_EXIT_CODE, SETUP_ERROR_EXIT_CODE, TIMEOUT_EXIT_CODE,
};

use config::validator::validate_config;
use exec::coordinator::ExecutionCoordinator;

/// Run `config` to completion.
///
/// Returns `Err` only for a configuration rejected before anything was
/// provisioned. Every other outcome, including setup failures, is a report.
pub fn run(config: &RunConfig) -> Result<ExecutionReport> {
    run_with_cancel(config, &CancelSignal::never())
}

/// [`run`], stoppable through the [`CancelHandle`] paired with `cancel`.
pub fn run_with_cancel(config: &RunConfig, cancel: &CancelSignal) -> Result<ExecutionReport> {
    let validation = validate_config(config).into_result()?;
    for warning in &validation.warnings {
        log::warn!("{}", warning);
    }

    log::info!("Running {:?}", config.command);
    Ok(ExecutionCoordinator::new(config.clone()).run(cancel))
}
