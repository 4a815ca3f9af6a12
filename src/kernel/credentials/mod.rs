//! uid/gid transition of the payload before exec.
//!
//! setresgid runs before setresuid: once the uid is dropped the process can
//! no longer change its gid.

mod transition;
mod validation;

pub use transition::{transition_to_unprivileged, Credentials};
pub use validation::validate_ids;
