//! Filesystem isolation and mount management
//!
//! Planning happens on the host; the table applies the plan inside the
//! sandbox mount namespace and tracks every mount for deterministic unwind.

pub mod plan;
pub mod table;

pub use plan::{MountPlan, PlannedMount, RootBase, SourceKind};
pub use table::{switch_root, KernelMounts, MountOps, MountTable};
