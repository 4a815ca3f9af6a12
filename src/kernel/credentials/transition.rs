use super::validation::validate_ids;
use crate::config::types::{LaunchError, RunConfig};
use nix::unistd::{getresgid, getresuid, setgroups, setresgid, setresuid, Gid, Uid};

/// Identity the payload runs as, as seen inside its namespaces
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    /// Drop supplementary groups. A user namespace with `setgroups` denied
    /// cannot, and its unmapped groups grant nothing.
    pub clear_groups: bool,
}

impl Credentials {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            uid: config.container_uid,
            gid: config.container_gid,
            clear_groups: !config.rootless,
        }
    }
}

/// validate, clear groups, setresgid, setresuid, verify.
pub fn transition_to_unprivileged(creds: &Credentials) -> Result<(), LaunchError> {
    validate_ids(creds.uid, creds.gid)?;

    if creds.clear_groups {
        setgroups(&[])
            .map_err(|e| LaunchError::Privilege(format!("setgroups([]) failed: {}", e)))?;
    }

    let gid = Gid::from_raw(creds.gid);
    setresgid(gid, gid, gid)
        .map_err(|e| LaunchError::Privilege(format!("setresgid({}) failed: {}", creds.gid, e)))?;

    let uid = Uid::from_raw(creds.uid);
    setresuid(uid, uid, uid)
        .map_err(|e| LaunchError::Privilege(format!("setresuid({}) failed: {}", creds.uid, e)))?;

    verify_transition(creds)
}

fn verify_transition(creds: &Credentials) -> Result<(), LaunchError> {
    let uids = getresuid().map_err(|e| LaunchError::Privilege(format!("getresuid: {}", e)))?;
    let gids = getresgid().map_err(|e| LaunchError::Privilege(format!("getresgid: {}", e)))?;

    let uid_ok = [uids.real, uids.effective, uids.saved]
        .iter()
        .all(|id| id.as_raw() == creds.uid);
    let gid_ok = [gids.real, gids.effective, gids.saved]
        .iter()
        .all(|id| id.as_raw() == creds.gid);
    if !uid_ok || !gid_ok {
        return Err(LaunchError::Privilege(format!(
            "credentials did not change: uid {:?}, gid {:?}",
            uids, gids
        )));
    }
    Ok(())
}
