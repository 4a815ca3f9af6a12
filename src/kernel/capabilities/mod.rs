//! Capability and `no_new_privs` handling for the payload.
//!
//! The bounding set is dropped while the payload still holds
//! `CAP_SETPCAP`; the process sets are zeroed after the uid change.

mod drop;

pub use drop::{
    capabilities_zeroed, clear_ambient, drop_bounding_set, set_no_new_privs, zero_capabilities,
};

/// Capability number newtype
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CapabilityNumber(u32);

impl CapabilityNumber {
    /// Highest capability any supported kernel defines, with headroom
    pub const MAX_CAP: u32 = 63;

    pub fn new(cap: u32) -> Option<Self> {
        if cap <= Self::MAX_CAP {
            Some(Self(cap))
        } else {
            None
        }
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

pub(crate) const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;
