/// Run-scoped host workspace
/// Each run gets `<tmp>/runj-uid-<euid>/<run-id>/rootfs` as the mount point
/// for its sandbox root and a sibling `scratch` for overlay layers. Mounts
/// live in the sandbox's private mount namespace, so on the host side the
/// tree stays empty.
use crate::config::types::{Result, SandboxError};
use nix::unistd::geteuid;
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Workspace {
    run_id: String,
    run_dir: PathBuf,
    rootfs: PathBuf,
    scratch: PathBuf,
}

impl Workspace {
    pub fn create_in(base_dir: &Path) -> Result<Self> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(base_dir)
            .map_err(|e| workspace_error("create base directory", base_dir, e))?;

        let base_meta =
            fs::symlink_metadata(base_dir).map_err(|e| workspace_error("stat", base_dir, e))?;
        if !base_meta.is_dir() || base_meta.uid() != geteuid().as_raw() {
            return Err(SandboxError::Config(format!(
                "workspace base {} is not a directory owned by uid {}",
                base_dir.display(),
                geteuid()
            )));
        }

        let run_id = Uuid::new_v4().to_string();
        let run_dir = base_dir.join(&run_id);
        let rootfs = run_dir.join(ROOTFS_DIR);
        let scratch = run_dir.join(SCRATCH_DIR);

        // create_dir, not create_dir_all: a pre-existing run dir is a collision
        DirBuilder::new()
            .mode(0o700)
            .create(&run_dir)
            .map_err(|e| workspace_error("create run directory", &run_dir, e))?;
        DirBuilder::new()
            .mode(0o755)
            .create(&rootfs)
            .map_err(|e| workspace_error("create rootfs mount point", &rootfs, e))?;
        DirBuilder::new()
            .mode(0o700)
            .create(&scratch)
            .map_err(|e| workspace_error("create scratch mount point", &scratch, e))?;

        log::debug!("Created workspace {}", run_dir.display());
        Ok(Self {
            run_id,
            run_dir,
            rootfs,
            scratch,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Host path the sandbox root is mounted on
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Host path the overlay scratch tmpfs is mounted on
    pub fn scratch(&self) -> &Path {
        &self.scratch
    }
}

const ROOTFS_DIR: &str = "rootfs";
const SCRATCH_DIR: &str = "scratch";

pub fn default_base_dir() -> PathBuf {
    std::env::temp_dir().join(format!("runj-uid-{}", geteuid()))
}

/// Remove a run directory created by [`Workspace::create_in`].
///
/// Never recurses: the mount points and the run directory are removed with
/// `rmdir`, so a mount that somehow leaked into the host namespace makes this
/// fail instead of deleting through it. Already-removed is success.
pub fn remove_run_dir(run_dir: &Path) -> Result<()> {
    let rootfs = run_dir.join(ROOTFS_DIR);
    let scratch = run_dir.join(SCRATCH_DIR);
    for mount_point in [&rootfs, &scratch] {
        if is_mount_point(mount_point)? {
            return Err(SandboxError::Cleanup(format!(
                "{} is still mounted",
                mount_point.display()
            )));
        }
    }

    for dir in [rootfs.as_path(), scratch.as_path(), run_dir] {
        match fs::remove_dir(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(workspace_error("remove", dir, e)),
        }
    }
    Ok(())
}

/// Whether `path` is a mount point in the caller's mount namespace
pub fn is_mount_point(path: &Path) -> Result<bool> {
    let mountinfo = fs::read_to_string("/proc/self/mountinfo")?;
    Ok(mountinfo_contains(&mountinfo, path))
}

fn mountinfo_contains(mountinfo: &str, path: &Path) -> bool {
    let wanted = path.to_string_lossy();
    mountinfo
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .any(|mount_point| unescape_mountinfo(mount_point) == wanted)
}

/// mountinfo escapes space, tab, newline and backslash as octal
fn unescape_mountinfo(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

fn workspace_error(action: &str, path: &Path, e: io::Error) -> SandboxError {
    SandboxError::Io(io::Error::new(
        e.kind(),
        format!("Failed to {} {}: {}", action, path.display(), e),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_workspace_layout_and_removal() {
        let base = TempDir::new().unwrap();
        let workspace = Workspace::create_in(base.path()).unwrap();

        assert!(workspace.rootfs().is_dir());
        assert!(workspace.scratch().is_dir());
        assert_eq!(workspace.rootfs().parent(), Some(workspace.run_dir()));
        assert_eq!(workspace.scratch().parent(), Some(workspace.run_dir()));
        assert!(workspace.run_dir().ends_with(workspace.run_id()));

        remove_run_dir(workspace.run_dir()).unwrap();
        assert!(!workspace.run_dir().exists());
        // Second removal is a no-op
        remove_run_dir(workspace.run_dir()).unwrap();
    }

    #[test]
    fn test_workspaces_do_not_collide() {
        let base = TempDir::new().unwrap();
        let a = Workspace::create_in(base.path()).unwrap();
        let b = Workspace::create_in(base.path()).unwrap();
        assert_ne!(a.run_dir(), b.run_dir());
    }

    #[test]
    fn test_removal_refuses_to_recurse() {
        let base = TempDir::new().unwrap();
        let workspace = Workspace::create_in(base.path()).unwrap();
        fs::write(workspace.rootfs().join("leftover"), b"x").unwrap();

        assert!(remove_run_dir(workspace.run_dir()).is_err());
        assert!(workspace.rootfs().join("leftover").exists());
    }

    #[test]
    fn test_mountinfo_parsing() {
        let mountinfo = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
40 22 0:35 / /tmp/with\\040space rw - tmpfs tmpfs rw
";
        assert!(mountinfo_contains(mountinfo, Path::new("/")));
        assert!(mountinfo_contains(mountinfo, Path::new("/tmp/with space")));
        assert!(!mountinfo_contains(mountinfo, Path::new("/tmp")));
    }
}
