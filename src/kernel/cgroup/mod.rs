//! Cgroup resource governance
//!
//! Per-run cgroup v2 for the memory and pids ceilings.

pub mod v2;

pub use v2::{CgroupEvidence, CgroupV2};
