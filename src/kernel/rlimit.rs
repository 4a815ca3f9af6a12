/// Resource limits applied to the payload right before exec
use crate::config::types::{LaunchError, LimitsConfig};
use nix::sys::resource::{setrlimit, Resource};

/// Ordered set of hard+soft rlimits
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RlimitSet {
    entries: Vec<(Resource, u64)>,
}

impl RlimitSet {
    /// Core dumps are always disabled; file size and open files follow the limits.
    pub fn from_limits(limits: &LimitsConfig) -> Self {
        let mut entries = vec![(Resource::RLIMIT_CORE, 0)];
        if let Some(fsize_kib) = limits.fsize_kib {
            entries.push((Resource::RLIMIT_FSIZE, fsize_kib.saturating_mul(1024)));
        }
        if let Some(no_file) = limits.no_file {
            entries.push((Resource::RLIMIT_NOFILE, no_file));
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[(Resource, u64)] {
        &self.entries
    }

    pub fn apply(&self) -> Result<(), LaunchError> {
        for &(resource, value) in &self.entries {
            setrlimit(resource, value as libc::rlim_t, value as libc::rlim_t).map_err(|e| {
                LaunchError::Setup(format!("setrlimit({:?}, {}) failed: {}", resource, value, e))
            })?;
        }
        Ok(())
    }
}
