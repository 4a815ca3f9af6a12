use super::{CapabilityNumber, LINUX_CAPABILITY_VERSION_3};
use crate::config::types::LaunchError;
use std::io;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// Remove every capability from the bounding set. Stops at the first number
/// the kernel does not know.
pub fn drop_bounding_set() -> Result<(), LaunchError> {
    for cap in 0..=CapabilityNumber::MAX_CAP {
        // SAFETY: prctl(PR_CAPBSET_DROP) takes a plain integer argument.
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) };
        if rc == 0 {
            continue;
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINVAL) {
            break;
        }
        return Err(LaunchError::Privilege(format!(
            "cannot drop capability {} from the bounding set: {}",
            cap, err
        )));
    }
    Ok(())
}

/// Clear the ambient set. Kernels without ambient capabilities have none
/// to clear.
pub fn clear_ambient() -> Result<(), LaunchError> {
    // SAFETY: prctl(PR_CAP_AMBIENT, PR_CAP_AMBIENT_CLEAR_ALL) takes no pointers.
    let rc = unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_CLEAR_ALL as libc::c_ulong,
            0,
            0,
            0,
        )
    };
    if rc != 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EINVAL) {
        return Err(LaunchError::Privilege(format!(
            "cannot clear ambient capabilities: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Zero the effective, permitted and inheritable sets, then confirm.
pub fn zero_capabilities() -> Result<(), LaunchError> {
    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    // Version 3 takes two entries: caps 0-31 and 32-63
    let data = [CapUserData::default(); 2];

    // SAFETY: valid v3 header for the calling thread and two initialized entries.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &header as *const CapUserHeader,
            data.as_ptr(),
        )
    };
    if rc != 0 {
        return Err(LaunchError::Privilege(format!(
            "capset failed: {}",
            io::Error::last_os_error()
        )));
    }

    if !capabilities_zeroed()? {
        return Err(LaunchError::Privilege(
            "capabilities remain after capset".to_string(),
        ));
    }
    Ok(())
}

/// Whether the calling thread holds no effective or permitted capability.
pub fn capabilities_zeroed() -> Result<bool, LaunchError> {
    let mut header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let mut data = [CapUserData::default(); 2];

    // SAFETY: capget writes at most two entries for a v3 header.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capget,
            &mut header as *mut CapUserHeader,
            data.as_mut_ptr(),
        )
    };
    if rc != 0 {
        return Err(LaunchError::Privilege(format!(
            "capget failed: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(data.iter().all(|d| d.effective == 0 && d.permitted == 0))
}

/// Keep execve from granting privileges through setuid bits or file
/// capabilities. Irreversible.
pub fn set_no_new_privs() -> Result<(), LaunchError> {
    // SAFETY: prctl(PR_SET_NO_NEW_PRIVS, 1) takes no pointers.
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(LaunchError::Privilege(format!(
            "PR_SET_NO_NEW_PRIVS failed: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}
