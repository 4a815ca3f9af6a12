//! Thin wrappers around Linux kernel primitives.
//!
//! Most `unsafe` code is concentrated here and in the launcher.
//! Dependency direction: signal -> namespace -> mount -> rlimit -> credentials -> cgroup

pub mod capabilities;
pub mod cgroup;
pub mod credentials;
pub mod keyring;
pub mod mount;
pub mod namespace;
pub mod rlimit;
pub mod signal;
