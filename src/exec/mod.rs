//! Execution control
//!
//! Launches the sandbox, enforces the deadline and coordinates one run from
//! provisioning to cleanup.

pub mod coordinator;
pub mod enforcer;
pub mod launcher;
pub mod preexec;
