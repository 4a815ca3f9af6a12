/// Session keyring isolation
/// A fresh anonymous session keyring keeps the payload from reading keys
/// cached in the invoking user's keyring.
use crate::config::types::LaunchError;
use std::io;

const KEYCTL_JOIN_SESSION_KEYRING: libc::c_long = 1;

/// Join a new anonymous session keyring. Kernels built without keys
/// (ENOSYS) or that filter keyctl (EPERM) leave nothing to isolate.
pub fn join_new_session_keyring() -> Result<(), LaunchError> {
    // SAFETY: a null name asks for an anonymous keyring; no memory is written.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_keyctl,
            KEYCTL_JOIN_SESSION_KEYRING,
            std::ptr::null::<libc::c_char>(),
        )
    };
    if rc >= 0 {
        return Ok(());
    }
    match io::Error::last_os_error().raw_os_error() {
        Some(libc::ENOSYS) | Some(libc::EPERM) => Ok(()),
        _ => Err(LaunchError::Privilege(format!(
            "cannot join a new session keyring: {}",
            io::Error::last_os_error()
        ))),
    }
}
