/// Host-side mount planning
/// Every declared mount is checked and resolved here, before any process exists
use crate::config::types::{MountError, MountOptions, RunConfig};
use crate::config::validator::is_clean_absolute;
use nix::mount::MsFlags;
use std::path::{Path, PathBuf};

/// What a mount source is on the host. Decides the kind of mount point created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Directory,
}

/// Base of the sandbox root
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RootBase {
    /// Fresh, empty tmpfs
    Tmpfs,
    /// Host directory used as the lower layer of an overlay, with a
    /// read-only bind where overlayfs is refused
    Bind(PathBuf),
}

/// One resolved `from -> to` entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedMount {
    pub source: PathBuf,
    /// Absolute path inside the sandbox
    pub target: PathBuf,
    pub kind: SourceKind,
    pub options: MountOptions,
}

impl PlannedMount {
    /// Flags for the remount that follows the initial bind.
    pub fn remount_flags(&self) -> MsFlags {
        let mut flags =
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
        if !self.options.writable {
            flags |= MsFlags::MS_RDONLY;
        }
        if !self.options.exec {
            flags |= MsFlags::MS_NOEXEC;
        }
        flags
    }
}

/// Ordered mount plan for one run
#[derive(Clone, Debug)]
pub struct MountPlan {
    /// Host directory that becomes the sandbox `/`
    pub root: PathBuf,
    pub base: RootBase,
    pub entries: Vec<PlannedMount>,
    /// Host directory backing overlay upper and work layers. Never visible
    /// inside the sandbox.
    pub scratch: PathBuf,
}

impl MountPlan {
    /// Resolve the configured mounts against `root`. Declaration order is kept,
    /// so a later entry with the same target shadows an earlier one.
    pub fn resolve(config: &RunConfig, root: &Path, scratch: &Path) -> Result<Self, MountError> {
        let base = match &config.rootfs {
            None => RootBase::Tmpfs,
            Some(rootfs) if !rootfs.is_absolute() => {
                return Err(MountError::InvalidSource(rootfs.clone()))
            }
            Some(rootfs) if !rootfs.is_dir() => {
                return Err(MountError::SourceMissing(rootfs.clone()))
            }
            Some(rootfs) => RootBase::Bind(rootfs.clone()),
        };

        let mut entries = Vec::with_capacity(config.mounts.len());
        for mount in &config.mounts {
            if !mount.from.is_absolute() {
                return Err(MountError::InvalidSource(mount.from.clone()));
            }
            if !is_clean_absolute(&mount.to) || mount.to == Path::new("/") {
                return Err(MountError::InvalidTarget(mount.to.clone()));
            }

            let options = MountOptions::parse(&mount.options)?;

            // Follows symlinks: the bind exposes whatever `from` points at
            let kind = match std::fs::metadata(&mount.from) {
                Ok(meta) if meta.is_dir() => SourceKind::Directory,
                Ok(_) => SourceKind::File,
                Err(_) => return Err(MountError::SourceMissing(mount.from.clone())),
            };

            entries.push(PlannedMount {
                source: mount.from.clone(),
                target: mount.to.clone(),
                kind,
                options,
            });
        }

        Ok(Self {
            root: root.to_path_buf(),
            base,
            entries,
            scratch: scratch.to_path_buf(),
        })
    }

    /// Host-side location of a sandbox path under the prepared root.
    // TODO: resolve symlinks inside a user rootfs relative to the root instead of the host
    pub fn host_path(&self, sandbox_path: &Path) -> PathBuf {
        match sandbox_path.strip_prefix("/") {
            Ok(relative) => self.root.join(relative),
            Err(_) => self.root.join(sandbox_path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::MountConfig;
    use tempfile::TempDir;

    fn config_with(mounts: Vec<MountConfig>) -> RunConfig {
        let mut config = RunConfig::new(["main"]);
        config.mounts = mounts;
        config
    }

    #[test]
    fn test_resolve_records_kind_and_order() {
        let host = TempDir::new().unwrap();
        let file = host.path().join("main");
        std::fs::write(&file, b"#!/bin/sh\n").unwrap();

        let config = config_with(vec![
            MountConfig::new(host.path(), "/data", &["rw"]),
            MountConfig::new(&file, "/usr/local/bin/main", &["exec"]),
        ]);
        let plan = MountPlan::resolve(
            &config,
            Path::new("/run/sandbox/root"),
            Path::new("/run/sandbox/scratch"),
        )
        .unwrap();

        assert_eq!(plan.base, RootBase::Tmpfs);
        assert_eq!(plan.entries[0].kind, SourceKind::Directory);
        assert_eq!(plan.entries[1].kind, SourceKind::File);
        assert_eq!(
            plan.host_path(&plan.entries[1].target),
            PathBuf::from("/run/sandbox/root/usr/local/bin/main")
        );
    }

    #[test]
    fn test_remount_flags_follow_options() {
        let host = TempDir::new().unwrap();
        let config = config_with(vec![
            MountConfig::new(host.path(), "/ro", &[]),
            MountConfig::new(host.path(), "/rwx", &["rw", "exec"]),
        ]);
        let plan = MountPlan::resolve(&config, Path::new("/r"), Path::new("/s")).unwrap();

        let ro = plan.entries[0].remount_flags();
        assert!(ro.contains(MsFlags::MS_RDONLY | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID));

        let rwx = plan.entries[1].remount_flags();
        assert!(!rwx.contains(MsFlags::MS_RDONLY));
        assert!(!rwx.contains(MsFlags::MS_NOEXEC));
        assert!(rwx.contains(MsFlags::MS_NODEV));
    }

    #[test]
    fn test_missing_source_is_a_mount_error() {
        let config = config_with(vec![MountConfig::new(
            "/nonexistent/runj/source",
            "/x",
            &[],
        )]);
        let err = MountPlan::resolve(&config, Path::new("/r"), Path::new("/s")).unwrap_err();
        assert_eq!(
            err,
            MountError::SourceMissing(PathBuf::from("/nonexistent/runj/source"))
        );
    }

    #[test]
    fn test_bad_targets_are_rejected() {
        let host = TempDir::new().unwrap();
        for target in ["relative/path", "/a/../../etc", "/"] {
            let config = config_with(vec![MountConfig::new(host.path(), target, &[])]);
            let err = MountPlan::resolve(&config, Path::new("/r"), Path::new("/s")).unwrap_err();
            assert_eq!(err, MountError::InvalidTarget(PathBuf::from(target)));
        }
    }

    #[test]
    fn test_rootfs_base() {
        let host = TempDir::new().unwrap();
        let mut config = config_with(vec![]);
        config.rootfs = Some(host.path().to_path_buf());
        let plan = MountPlan::resolve(&config, Path::new("/r"), Path::new("/s")).unwrap();
        assert_eq!(plan.base, RootBase::Bind(host.path().to_path_buf()));

        config.rootfs = Some(host.path().join("missing"));
        assert!(matches!(
            MountPlan::resolve(&config, Path::new("/r"), Path::new("/s")),
            Err(MountError::SourceMissing(_))
        ));
    }
}
