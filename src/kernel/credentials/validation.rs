use crate::config::types::LaunchError;

/// Reject a transition to uid or gid 0.
pub fn validate_ids(uid: u32, gid: u32) -> Result<(), LaunchError> {
    if uid == 0 || gid == 0 {
        return Err(LaunchError::Privilege(format!(
            "refusing to run as root (uid={}, gid={})",
            uid, gid
        )));
    }
    Ok(())
}
