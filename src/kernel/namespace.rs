/// Namespace isolation for the sandbox proxy
/// Mount, PID, IPC and UTS namespaces always; a user namespace when rootless
use crate::config::types::{LaunchError, Result, SandboxError};

use nix::sched::{unshare, CloneFlags};
use nix::unistd::{sethostname, Pid};
use std::fs;

/// Hostname seen inside the UTS namespace
pub const SANDBOX_HOSTNAME: &str = "runj";

/// Namespace set unshared by the proxy before it forks the payload
#[derive(Clone, Copy, Debug)]
pub struct NamespaceIsolation {
    /// Add a user namespace mapping the invoking user to the container ids
    rootless: bool,
}

impl NamespaceIsolation {
    pub fn new(rootless: bool) -> Self {
        Self { rootless }
    }

    pub fn is_rootless(&self) -> bool {
        self.rootless
    }

    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUTS;
        if self.rootless {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        flags
    }

    /// Unshare the namespace set. Runs in the proxy; the next fork becomes
    /// PID 1 of the new PID namespace.
    pub fn unshare(&self) -> std::result::Result<(), LaunchError> {
        unshare(self.clone_flags()).map_err(|e| {
            LaunchError::Namespace(format!(
                "unshare({:?}) failed: {}",
                self.clone_flags(),
                e
            ))
        })
    }

    /// Set the hostname inside the new UTS namespace. Requires the id maps
    /// to be in place when rootless.
    pub fn set_hostname(&self) -> std::result::Result<(), LaunchError> {
        sethostname(SANDBOX_HOSTNAME)
            .map_err(|e| LaunchError::Namespace(format!("sethostname failed: {}", e)))
    }

    pub fn enabled_namespaces(&self) -> Vec<&'static str> {
        let mut namespaces = vec!["Mount", "PID", "IPC", "UTS"];
        if self.rootless {
            namespaces.push("User");
        }
        namespaces
    }
}

/// uid/gid maps that show the invoking user as the container identity
/// inside a user namespace. Nothing maps to root.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdMapping {
    pub sandbox_uid: u32,
    pub sandbox_gid: u32,
    pub host_uid: u32,
    pub host_gid: u32,
}

impl IdMapping {
    /// Map the calling user's effective ids to `sandbox_uid`/`sandbox_gid`.
    pub fn current(sandbox_uid: u32, sandbox_gid: u32) -> Self {
        Self {
            sandbox_uid,
            sandbox_gid,
            host_uid: nix::unistd::geteuid().as_raw(),
            host_gid: nix::unistd::getegid().as_raw(),
        }
    }

    pub fn uid_map(&self) -> String {
        format!("{} {} 1\n", self.sandbox_uid, self.host_uid)
    }

    pub fn gid_map(&self) -> String {
        format!("{} {} 1\n", self.sandbox_gid, self.host_gid)
    }

    /// Write the maps for `pid` from the host. `setgroups` is denied first,
    /// as the kernel requires for unprivileged gid maps.
    pub fn write_for(&self, pid: Pid) -> Result<()> {
        let proc_dir = format!("/proc/{}", pid);

        match fs::write(format!("{}/setgroups", proc_dir), "deny") {
            Ok(()) => {}
            // Kernels before 3.19 have no setgroups file
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SandboxError::Launch(LaunchError::Namespace(format!(
                    "failed to deny setgroups for {}: {}",
                    pid, e
                ))))
            }
        }

        fs::write(format!("{}/uid_map", proc_dir), self.uid_map()).map_err(|e| {
            SandboxError::Launch(LaunchError::Namespace(format!(
                "failed to write uid_map for {}: {}",
                pid, e
            )))
        })?;
        fs::write(format!("{}/gid_map", proc_dir), self.gid_map()).map_err(|e| {
            SandboxError::Launch(LaunchError::Namespace(format!(
                "failed to write gid_map for {}: {}",
                pid, e
            )))
        })?;

        log::debug!(
            "Mapped host uid {} gid {} to {}:{} in user namespace of {}",
            self.host_uid,
            self.host_gid,
            self.sandbox_uid,
            self.sandbox_gid,
            pid
        );
        Ok(())
    }
}

/// Make `/` recursively private so no sandbox mount propagates to the host.
/// Must succeed before any other mount in the sandbox.
pub fn harden_mount_propagation() -> std::result::Result<(), LaunchError> {
    use nix::mount::{mount, MsFlags};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| {
        LaunchError::Namespace(format!(
            "failed to make / private (MS_PRIVATE|MS_REC): {}",
            e
        ))
    })
}
