/// Cleanup and resource management
/// Every host-side resource of a run is recorded right after it is created
/// and released in reverse creation order. Cleanup is safe to call again
/// after a partial failure.
use crate::config::types::{Result, SandboxError};
use crate::kernel::cgroup::CgroupV2;
use crate::safety::workspace;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;

/// Resource kinds a run can own on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Workspace,
    Cgroup,
    /// An unreaped sandbox proxy
    Process,
}

#[derive(Debug, Clone)]
pub struct ResourceEntry {
    pub resource_type: ResourceType,
    pub identifier: String,
    pub path: Option<PathBuf>,
}

/// Resource ledger with idempotent teardown
#[derive(Debug, Default)]
pub struct CleanupManager {
    entries: Vec<ResourceEntry>,
}

impl CleanupManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be called immediately after successful creation
    pub fn record(&mut self, resource_type: ResourceType, identifier: String, path: Option<PathBuf>) {
        let entry = ResourceEntry {
            resource_type,
            identifier,
            path,
        };
        debug!("Recording resource: {:?}", entry);
        self.entries.push(entry);
    }

    /// Drop an entry whose resource was already released elsewhere
    pub fn release(&mut self, resource_type: ResourceType, identifier: &str) {
        self.entries
            .retain(|e| !(e.resource_type == resource_type && e.identifier == identifier));
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release everything still recorded, newest first.
    ///
    /// Successful entries leave the ledger, failed ones stay so a later call
    /// retries them. Processes are killed before the cgroup that holds them
    /// is removed because they were recorded after it.
    pub fn cleanup_all(&mut self) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        info!("Starting cleanup of {} resources", self.entries.len());

        let mut remaining = Vec::new();
        let mut failures = Vec::new();
        for entry in self.entries.drain(..).rev() {
            match cleanup_resource(&entry) {
                Ok(()) => debug!("Cleaned {:?} {}", entry.resource_type, entry.identifier),
                Err(e) => {
                    warn!(
                        "Cleanup of {:?} {} failed: {}",
                        entry.resource_type, entry.identifier, e
                    );
                    failures.push(format!("{:?} {}: {}", entry.resource_type, entry.identifier, e));
                    remaining.push(entry);
                }
            }
        }
        remaining.reverse();
        self.entries = remaining;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::Cleanup(failures.join("; ")))
        }
    }
}

fn cleanup_resource(entry: &ResourceEntry) -> Result<()> {
    match entry.resource_type {
        ResourceType::Workspace => match &entry.path {
            Some(path) => workspace::remove_run_dir(path),
            None => Ok(()),
        },
        ResourceType::Cgroup => match &entry.path {
            Some(path) => {
                let cgroup = CgroupV2::open(path.clone());
                if !cgroup.is_empty() {
                    warn!("Cgroup {} still has processes", path.display());
                }
                cgroup.remove()
            }
            None => Ok(()),
        },
        ResourceType::Process => cleanup_process(&entry.identifier),
    }
}

/// SIGKILL the proxy's group and reap it
fn cleanup_process(identifier: &str) -> Result<()> {
    let raw: i32 = identifier
        .parse()
        .map_err(|_| SandboxError::Process(format!("Invalid PID: {}", identifier)))?;
    let pid = Pid::from_raw(raw);

    if killpg(pid, Signal::SIGKILL).is_err() {
        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                return Err(SandboxError::Process(format!(
                    "Failed to kill process {}: {}",
                    pid, e
                )))
            }
        }
    }

    loop {
        match nix::sys::wait::waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            // ECHILD: not ours or already reaped
            _ => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::workspace::Workspace;
    use tempfile::TempDir;

    #[test]
    fn test_cleanup_removes_workspace_once() {
        let base = TempDir::new().unwrap();
        let ws = Workspace::create_in(base.path()).unwrap();

        let mut manager = CleanupManager::new();
        manager.record(
            ResourceType::Workspace,
            ws.run_id().to_string(),
            Some(ws.run_dir().to_path_buf()),
        );
        assert_eq!(manager.count(), 1);

        manager.cleanup_all().unwrap();
        assert!(manager.is_empty());
        assert!(!ws.run_dir().exists());

        manager.cleanup_all().unwrap();
    }

    #[test]
    fn test_failed_entries_stay_for_retry() {
        let base = TempDir::new().unwrap();
        let ws = Workspace::create_in(base.path()).unwrap();
        let blocker = ws.rootfs().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let mut manager = CleanupManager::new();
        manager.record(
            ResourceType::Workspace,
            ws.run_id().to_string(),
            Some(ws.run_dir().to_path_buf()),
        );

        match manager.cleanup_all() {
            Err(SandboxError::Cleanup(message)) => {
                assert!(message.starts_with("Workspace "), "{}", message)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(manager.count(), 1);

        std::fs::remove_file(&blocker).unwrap();
        manager.cleanup_all().unwrap();
        assert!(manager.is_empty());
    }

    #[test]
    fn test_release_forgets_entry() {
        let mut manager = CleanupManager::new();
        manager.record(ResourceType::Process, "12345".to_string(), None);
        manager.record(ResourceType::Cgroup, "12345".to_string(), None);
        manager.release(ResourceType::Process, "12345");
        assert_eq!(manager.count(), 1);
    }

    #[test]
    fn test_invalid_pid_is_reported() {
        assert!(cleanup_process("not-a-pid").is_err());
    }
}
