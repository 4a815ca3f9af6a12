//! Safety and cleanup
//!
//! Run-scoped host workspaces and the ledger that guarantees every host
//! resource of a run is released.

pub mod cleanup;
pub mod workspace;
