/// Mount application inside the sandbox mount namespace
///
/// Every successful mount is recorded so a failure part way through can be
/// unwound in reverse order. Runs in the payload process between fork and exec.
use super::plan::{MountPlan, PlannedMount, RootBase, SourceKind};
use crate::config::types::{LaunchError, MountError};
use nix::mount::{MntFlags, MsFlags};
use nix::sys::statvfs::FsFlags;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

/// Device nodes exposed under the sandbox `/dev`
pub const DEVICE_NODES: [&str; 6] = ["null", "zero", "full", "random", "urandom", "tty"];

/// Mount syscalls used by [`MountTable`]
pub trait MountOps {
    fn mount(
        &mut self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()>;

    fn unmount(&mut self, target: &Path) -> nix::Result<()>;

    /// Per-mount flags of the filesystem holding `path`, which a user
    /// namespace cannot clear on remount.
    fn locked_flags(&self, path: &Path) -> MsFlags;
}

/// Real kernel mounts
#[derive(Debug, Default)]
pub struct KernelMounts;

impl MountOps for KernelMounts {
    fn mount(
        &mut self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()> {
        nix::mount::mount(source, target, fstype, flags, data)
    }

    fn unmount(&mut self, target: &Path) -> nix::Result<()> {
        nix::mount::umount2(target, MntFlags::MNT_DETACH)
    }

    fn locked_flags(&self, path: &Path) -> MsFlags {
        let Ok(stat) = nix::sys::statvfs::statvfs(path) else {
            return MsFlags::empty();
        };
        let fs_flags = stat.flags();
        let mut flags = MsFlags::empty();
        for (fs_flag, ms_flag) in [
            (FsFlags::ST_RDONLY, MsFlags::MS_RDONLY),
            (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
            (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
            (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
            (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
            (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
        ] {
            if fs_flags.contains(fs_flag) {
                flags |= ms_flag;
            }
        }
        flags
    }
}

/// Per-mount flags of the sealed sandbox root
const ROOT_SEAL: MsFlags = MsFlags::MS_BIND
    .union(MsFlags::MS_REMOUNT)
    .union(MsFlags::MS_RDONLY)
    .union(MsFlags::MS_NOSUID)
    .union(MsFlags::MS_NODEV);

/// What backs a subtree of the sandbox view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Backing {
    /// tmpfs or overlay private to this run. Mount points may be created.
    Sandbox,
    /// Host directory bound with these remount flags. Never written to.
    Host(MsFlags),
}

#[derive(Debug)]
struct Layer {
    target: PathBuf,
    backing: Backing,
}

/// Ordered record of established mounts
pub struct MountTable<O: MountOps> {
    ops: O,
    mounted: Vec<PathBuf>,
    layers: Vec<Layer>,
    /// Read-only remounts applied once every mount point exists
    seals: Vec<(PathBuf, MsFlags)>,
    scratch_mounted: bool,
    overlays: usize,
}

impl MountTable<KernelMounts> {
    pub fn kernel() -> Self {
        Self::new(KernelMounts)
    }
}

impl<O: MountOps> MountTable<O> {
    pub fn new(ops: O) -> Self {
        Self {
            ops,
            mounted: Vec::new(),
            layers: Vec::new(),
            seals: Vec::new(),
            scratch_mounted: false,
            overlays: 0,
        }
    }

    /// Established mount points, in mount order
    pub fn mounted(&self) -> &[PathBuf] {
        &self.mounted
    }

    /// Build the whole filesystem view described by `plan`. On failure every
    /// mount made so far is unwound before the error is returned.
    pub fn establish(&mut self, plan: &MountPlan) -> Result<(), MountError> {
        let result = self.establish_inner(plan);
        if result.is_err() {
            self.teardown();
        }
        result
    }

    fn establish_inner(&mut self, plan: &MountPlan) -> Result<(), MountError> {
        self.mount_root(plan)?;
        self.mount_proc(plan);
        self.mount_dev(plan)?;
        self.mount_tmp(plan)?;

        for entry in &plan.entries {
            self.mount_entry(plan, entry)?;
        }

        // Newest first, so the root is sealed last
        while let Some((target, flags)) = self.seals.pop() {
            self.remount(&target, &target, flags)?;
        }
        Ok(())
    }

    fn mount_root(&mut self, plan: &MountPlan) -> Result<(), MountError> {
        let root = plan.root.as_path();
        match &plan.base {
            RootBase::Tmpfs => {
                self.record(
                    Some(Path::new("tmpfs")),
                    root,
                    Some("tmpfs"),
                    MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                    Some("mode=0755,size=64m"),
                )?;
                self.push_layer(root, Backing::Sandbox);
                self.seals.push((root.to_path_buf(), ROOT_SEAL));
            }
            RootBase::Bind(rootfs) => {
                if self.mount_overlay(plan, rootfs, root).is_ok() {
                    self.push_layer(root, Backing::Sandbox);
                    self.seals.push((root.to_path_buf(), ROOT_SEAL));
                    return Ok(());
                }

                // No overlayfs: the rootfs is used as is and nothing is created in it
                self.record(
                    Some(rootfs.as_path()),
                    root,
                    None,
                    MsFlags::MS_BIND | MsFlags::MS_REC,
                    None,
                )?;
                self.remount(rootfs, root, ROOT_SEAL)?;
                self.push_layer(root, Backing::Host(ROOT_SEAL));
            }
        }
        Ok(())
    }

    /// Fresh procfs for the new PID namespace. Best-effort: some hosts refuse
    /// procfs in nested namespaces.
    fn mount_proc(&mut self, plan: &MountPlan) {
        let Ok(target) = self.system_dir(plan, "proc") else {
            return;
        };
        let _ = self.record(
            Some(Path::new("proc")),
            &target,
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None,
        );
    }

    fn mount_dev(&mut self, plan: &MountPlan) -> Result<(), MountError> {
        let Ok(dev) = self.system_dir(plan, "dev") else {
            return Ok(());
        };
        self.record(
            Some(Path::new("tmpfs")),
            &dev,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NOATIME,
            Some("mode=0755,size=64k"),
        )?;
        self.push_layer(&dev, Backing::Sandbox);

        for name in DEVICE_NODES {
            let host_node = Path::new("/dev").join(name);
            let node = dev.join(name);
            if !host_node.exists() || create_file_mount_point(&node).is_err() {
                continue;
            }
            // tty needs a controlling terminal on some hosts; skip what binds refuse
            let _ = self.record(
                Some(host_node.as_path()),
                &node,
                None,
                MsFlags::MS_BIND,
                None,
            );
        }

        for (link, target) in [
            ("fd", "/proc/self/fd"),
            ("stdin", "/proc/self/fd/0"),
            ("stdout", "/proc/self/fd/1"),
            ("stderr", "/proc/self/fd/2"),
        ] {
            let _ = std::os::unix::fs::symlink(target, dev.join(link));
        }
        Ok(())
    }

    fn mount_tmp(&mut self, plan: &MountPlan) -> Result<(), MountError> {
        let Ok(tmp) = self.system_dir(plan, "tmp") else {
            return Ok(());
        };
        self.record(
            Some(Path::new("tmpfs")),
            &tmp,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some("mode=1777"),
        )?;
        self.push_layer(&tmp, Backing::Sandbox);
        Ok(())
    }

    /// `/proc`, `/dev` and `/tmp` are created when the root is private to the
    /// run and only used when already present in a bound rootfs.
    fn system_dir(&self, plan: &MountPlan, name: &str) -> std::io::Result<PathBuf> {
        let dir = plan.root.join(name);
        match self.backing_of(&dir) {
            Some(Backing::Sandbox) => fs::create_dir_all(&dir).map(|_| dir),
            _ if dir.is_dir() => Ok(dir),
            _ => Err(std::io::ErrorKind::NotFound.into()),
        }
    }

    fn mount_entry(&mut self, plan: &MountPlan, entry: &PlannedMount) -> Result<(), MountError> {
        let target = plan.host_path(&entry.target);

        self.prepare_mount_point(plan, &entry.source, &target, entry.kind)
            .map_err(|e| with_sandbox_target(e, &entry.target))?;

        self.record(
            Some(entry.source.as_path()),
            &target,
            None,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None,
        )
        .map_err(|e| with_sandbox_target(e, &entry.target))?;

        let flags = entry.remount_flags();
        self.remount(&entry.source, &target, flags)
            .map_err(|e| with_sandbox_target(e, &entry.target))?;
        self.push_layer(&target, Backing::Host(flags));
        Ok(())
    }

    /// Make `target` exist without writing into a host directory. Missing
    /// points under a read-only bind get an overlay over the nearest existing
    /// ancestor; missing points under a writable bind are refused.
    fn prepare_mount_point(
        &mut self,
        plan: &MountPlan,
        source: &Path,
        target: &Path,
        kind: SourceKind,
    ) -> Result<(), MountError> {
        let ready = match kind {
            SourceKind::Directory => target.is_dir(),
            SourceKind::File => target.is_file(),
        };
        if ready {
            return Ok(());
        }

        match self.backing_of(target) {
            Some(Backing::Sandbox) => {}
            Some(Backing::Host(flags)) if !flags.contains(MsFlags::MS_RDONLY) => {
                return Err(refused(
                    source,
                    target,
                    "mount point would be created inside a writable host mount",
                ));
            }
            Some(Backing::Host(flags)) => {
                let ancestor = nearest_existing_dir(target)
                    .ok_or_else(|| refused(source, target, "no existing parent directory"))?;
                if self.mounted.iter().any(|m| m != &ancestor && m.starts_with(&ancestor)) {
                    return Err(refused(
                        source,
                        target,
                        "mount point would hide an earlier mount under a read-only bind",
                    ));
                }
                self.mount_overlay(plan, &ancestor, &ancestor)?;
                self.push_layer(&ancestor, Backing::Sandbox);
                self.seals.push((ancestor, flags));
            }
            None => return Err(refused(source, target, "outside the sandbox root")),
        }

        let created = match kind {
            SourceKind::Directory => fs::create_dir_all(target),
            SourceKind::File => create_file_mount_point(target),
        };
        created.map_err(|e| refused(source, target, &format!("cannot create mount point: {}", e)))
    }

    /// Writable overlay of `lower` at `target`, with upper and work layers on
    /// the run's scratch tmpfs.
    fn mount_overlay(
        &mut self,
        plan: &MountPlan,
        lower: &Path,
        target: &Path,
    ) -> Result<(), MountError> {
        self.mount_scratch(plan)?;

        let layer_dir = plan.scratch.join(self.overlays.to_string());
        self.overlays += 1;
        let upper = layer_dir.join("upper");
        let work = layer_dir.join("work");
        for dir in [&upper, &work] {
            fs::create_dir_all(dir)
                .map_err(|e| refused(lower, target, &format!("cannot create overlay layer: {}", e)))?;
        }
        // The merged directory takes its mode from the upper layer
        if let Ok(meta) = fs::metadata(lower) {
            let _ = fs::set_permissions(&upper, meta.permissions());
        }

        let data = overlay_options(lower, &upper, &work)
            .ok_or_else(|| refused(lower, target, "path cannot be passed to overlayfs"))?;
        self.record(
            Some(Path::new("overlay")),
            target,
            Some("overlay"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(&data),
        )
    }

    fn mount_scratch(&mut self, plan: &MountPlan) -> Result<(), MountError> {
        if self.scratch_mounted {
            return Ok(());
        }
        fs::create_dir_all(&plan.scratch)
            .map_err(|e| {
                refused(Path::new("tmpfs"), &plan.scratch, &format!("cannot create scratch: {}", e))
            })?;
        self.record(
            Some(Path::new("tmpfs")),
            &plan.scratch,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            Some("mode=0700,size=16m"),
        )?;
        self.scratch_mounted = true;
        Ok(())
    }

    fn push_layer(&mut self, target: &Path, backing: Backing) {
        self.layers.push(Layer {
            target: target.to_path_buf(),
            backing,
        });
    }

    /// Backing of the newest mount covering `path`.
    fn backing_of(&self, path: &Path) -> Option<Backing> {
        self.layers
            .iter()
            .rev()
            .find(|layer| path.starts_with(&layer.target))
            .map(|layer| layer.backing)
    }

    /// Bind remount with `flags`. Flags locked by a user namespace are kept
    /// and the remount retried once.
    fn remount(
        &mut self,
        source: impl AsRef<Path>,
        target: &Path,
        flags: MsFlags,
    ) -> Result<(), MountError> {
        let source = source.as_ref();
        match self.ops.mount(None, target, None, flags, None) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::EPERM) => {
                let locked = self.ops.locked_flags(target);
                self.ops
                    .mount(None, target, None, flags | locked, None)
                    .map_err(|e| rejected(source, target, e))
            }
            Err(e) => Err(rejected(source, target, e)),
        }
    }

    fn record(
        &mut self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<(), MountError> {
        self.ops
            .mount(source, target, fstype, flags, data)
            .map_err(|e| rejected(source.unwrap_or(Path::new("none")), target, e))?;
        self.mounted.push(target.to_path_buf());
        Ok(())
    }

    /// Detach every recorded mount, newest first. Calling it again is a no-op.
    /// Returns the number of mounts that refused to detach.
    pub fn teardown(&mut self) -> usize {
        let mut failures = 0;
        while let Some(target) = self.mounted.pop() {
            if self.ops.unmount(&target).is_err() {
                failures += 1;
            }
        }
        self.layers.clear();
        self.seals.clear();
        failures
    }

    /// Hand the mounts over to the namespace. After the root switch the
    /// recorded host paths no longer exist; the mounts go away with the namespace.
    pub fn commit(mut self) -> usize {
        let count = self.mounted.len();
        self.mounted.clear();
        count
    }
}

/// `lowerdir=..,upperdir=..,workdir=..`, or `None` when a path holds a
/// character overlayfs treats as a separator.
fn overlay_options(lower: &Path, upper: &Path, work: &Path) -> Option<String> {
    let mut parts = Vec::with_capacity(3);
    for (key, path) in [("lowerdir", lower), ("upperdir", upper), ("workdir", work)] {
        let path = path.to_str()?;
        if path.contains([',', ':', '\\']) {
            return None;
        }
        parts.push(format!("{}={}", key, path));
    }
    Some(parts.join(","))
}

fn nearest_existing_dir(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .skip(1)
        .find(|dir| dir.is_dir())
        .map(Path::to_path_buf)
}

fn refused(source: &Path, target: &Path, reason: &str) -> MountError {
    MountError::Rejected {
        from: source.display().to_string(),
        target: target.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn rejected(source: &Path, target: &Path, errno: nix::errno::Errno) -> MountError {
    MountError::Rejected {
        from: source.display().to_string(),
        target: target.to_path_buf(),
        reason: errno.desc().to_string(),
    }
}

/// Report the sandbox path rather than the host staging path.
fn with_sandbox_target(error: MountError, sandbox_target: &Path) -> MountError {
    match error {
        MountError::Rejected { from, reason, .. } => MountError::Rejected {
            from,
            target: sandbox_target.to_path_buf(),
            reason,
        },
        other => other,
    }
}

fn create_file_mount_point(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if path.is_file() {
        return Ok(());
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map(|_| ())
}

/// Make the prepared root the process root.
///
/// `pivot_root(".", ".")` stacks the old root on top of the new one, which is
/// then lazily detached. Falls back to `chroot` where pivoting is refused,
/// e.g. on an initramfs root.
pub fn switch_root(root: &Path) -> Result<(), LaunchError> {
    use nix::unistd::{chdir, chroot, pivot_root};

    chdir(root).map_err(|e| {
        LaunchError::Setup(format!("cannot enter sandbox root {}: {}", root.display(), e))
    })?;

    match pivot_root(".", ".") {
        Ok(()) => {
            nix::mount::umount2(".", MntFlags::MNT_DETACH).map_err(|e| {
                LaunchError::Setup(format!("cannot detach old root: {}", e))
            })?;
        }
        Err(_) => {
            chroot(".").map_err(|e| LaunchError::Setup(format!("chroot failed: {}", e)))?;
        }
    }

    chdir("/").map_err(|e| LaunchError::Setup(format!("chdir to new root failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{MountConfig, RunConfig};
    use nix::errno::Errno;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Mount {
            target: PathBuf,
            fstype: Option<String>,
            flags: MsFlags,
            data: Option<String>,
        },
        Unmount(PathBuf),
    }

    /// Records calls and fails the bind whose target ends with `fail_on`.
    #[derive(Default)]
    struct RecordingMounts {
        calls: Vec<Call>,
        fail_on: Option<&'static str>,
        eperm_once: bool,
        refuse_overlay: bool,
    }

    impl RecordingMounts {
        fn overlays(&self) -> Vec<(PathBuf, String)> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Mount {
                        target,
                        fstype: Some(fstype),
                        data: Some(data),
                        ..
                    } if fstype == "overlay" => Some((target.clone(), data.clone())),
                    _ => None,
                })
                .collect()
        }

        fn position(&self, target: &Path, with: MsFlags) -> Option<usize> {
            self.calls.iter().rposition(|c| {
                matches!(c, Call::Mount { target: t, flags, .. } if t == target && flags.contains(with))
            })
        }
    }

    impl MountOps for RecordingMounts {
        fn mount(
            &mut self,
            _source: Option<&Path>,
            target: &Path,
            fstype: Option<&str>,
            flags: MsFlags,
            data: Option<&str>,
        ) -> nix::Result<()> {
            if let Some(suffix) = self.fail_on {
                if target.ends_with(suffix) && flags.contains(MsFlags::MS_BIND) {
                    return Err(Errno::ENOENT);
                }
            }
            if self.eperm_once && flags.contains(MsFlags::MS_REMOUNT) {
                self.eperm_once = false;
                return Err(Errno::EPERM);
            }
            if self.refuse_overlay && fstype == Some("overlay") {
                return Err(Errno::EINVAL);
            }
            self.calls.push(Call::Mount {
                target: target.to_path_buf(),
                fstype: fstype.map(str::to_string),
                flags,
                data: data.map(str::to_string),
            });
            Ok(())
        }

        fn unmount(&mut self, target: &Path) -> nix::Result<()> {
            self.calls.push(Call::Unmount(target.to_path_buf()));
            Ok(())
        }

        fn locked_flags(&self, _path: &Path) -> MsFlags {
            MsFlags::MS_NOEXEC
        }
    }

    struct Fixture {
        host: TempDir,
        root: TempDir,
        scratch: TempDir,
        plan: MountPlan,
    }

    /// `from` paths are relative to a host directory holding a `main` file.
    fn fixture_with(mounts: Vec<MountConfig>, rootfs: bool) -> Fixture {
        let host = TempDir::new().unwrap();
        std::fs::write(host.path().join("main"), b"\x7fELF").unwrap();
        let root = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let mut config = RunConfig::new(["main"]);
        config.mounts = mounts
            .into_iter()
            .map(|mut m| {
                m.from = host.path().join(&m.from);
                m
            })
            .collect();
        if rootfs {
            config.rootfs = Some(host.path().to_path_buf());
        }
        let plan = MountPlan::resolve(&config, root.path(), scratch.path()).unwrap();
        Fixture {
            host,
            root,
            scratch,
            plan,
        }
    }

    fn fixture(mounts: Vec<MountConfig>) -> Fixture {
        fixture_with(mounts, false)
    }

    #[test]
    fn test_establish_builds_view_in_order() {
        let fx = fixture(vec![MountConfig::new(
            "main",
            "/usr/local/bin/main",
            &["exec"],
        )]);
        let root = fx.root.path();
        let mut table = MountTable::new(RecordingMounts::default());
        table.establish(&fx.plan).unwrap();

        assert_eq!(table.mounted()[0], root);
        assert!(table.mounted().contains(&root.join("proc")));
        assert!(table.mounted().contains(&root.join("tmp")));
        assert!(root.join("usr/local/bin/main").is_file());
        assert!(root.join("dev/null").exists());
        // A tmpfs root needs no overlay scratch
        assert!(!table.mounted().contains(&fx.scratch.path().to_path_buf()));

        let target = root.join("usr/local/bin/main");
        let remount = table.ops.calls.iter().rev().find_map(|c| match c {
            Call::Mount { target: t, flags, .. }
                if *t == target && flags.contains(MsFlags::MS_REMOUNT) =>
            {
                Some(*flags)
            }
            _ => None,
        });
        let remount = remount.unwrap();
        assert!(!remount.contains(MsFlags::MS_NOEXEC));
        assert!(remount.contains(MsFlags::MS_RDONLY));

        // Root is made read-only last
        match table.ops.calls.last().unwrap() {
            Call::Mount { target, flags, .. } => {
                assert_eq!(target, root);
                assert!(flags.contains(MsFlags::MS_RDONLY | MsFlags::MS_REMOUNT));
            }
            other => panic!("unexpected last call {:?}", other),
        }
    }

    #[test]
    fn test_failure_unwinds_in_reverse() {
        let fx = fixture(vec![
            MountConfig::new("", "/first", &[]),
            MountConfig::new("", "/second", &[]),
        ]);
        let ops = RecordingMounts {
            fail_on: Some("second"),
            ..Default::default()
        };
        let mut table = MountTable::new(ops);
        let err = table.establish(&fx.plan).unwrap_err();

        match err {
            MountError::Rejected { target, .. } => assert_eq!(target, PathBuf::from("/second")),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(table.mounted().is_empty());

        let unmounted: Vec<_> = table
            .ops
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Unmount(p) => Some(p.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(unmounted.first(), Some(&fx.root.path().join("first")));
        assert_eq!(unmounted.last(), Some(&fx.root.path().to_path_buf()));
    }

    #[test]
    fn test_teardown_twice_is_noop() {
        let fx = fixture(vec![]);
        let mut table = MountTable::new(RecordingMounts::default());
        table.establish(&fx.plan).unwrap();
        let established = table.mounted().len();

        assert_eq!(table.teardown(), 0);
        let after_first = table.ops.calls.len();
        assert_eq!(table.teardown(), 0);
        assert_eq!(table.ops.calls.len(), after_first);
        assert!(established > 0);
    }

    #[test]
    fn test_duplicate_target_mounts_twice() {
        let fx = fixture(vec![
            MountConfig::new("", "/data", &[]),
            MountConfig::new("", "/data", &["rw"]),
        ]);
        let mut table = MountTable::new(RecordingMounts::default());
        table.establish(&fx.plan).unwrap();

        let data = fx.root.path().join("data");
        let binds = table.mounted().iter().filter(|p| **p == data).count();
        assert_eq!(binds, 2);
    }

    #[test]
    fn test_locked_flags_retry() {
        let fx = fixture(vec![MountConfig::new("", "/data", &["exec"])]);
        let ops = RecordingMounts {
            eperm_once: true,
            ..Default::default()
        };
        let mut table = MountTable::new(ops);
        table.establish(&fx.plan).unwrap();

        // The retried remount keeps the locked noexec despite the exec option
        let data = fx.root.path().join("data");
        assert!(table.ops.calls.iter().any(|c| matches!(
            c,
            Call::Mount { target, flags, .. }
                if *target == data
                    && flags.contains(MsFlags::MS_REMOUNT | MsFlags::MS_NOEXEC)
        )));
    }

    #[test]
    fn test_commit_forgets_mounts() {
        let fx = fixture(vec![]);
        let mut table = MountTable::new(RecordingMounts::default());
        table.establish(&fx.plan).unwrap();
        assert!(table.commit() > 0);
    }

    #[test]
    fn test_nested_target_under_readonly_bind_gets_overlay() {
        let fx = fixture(vec![
            MountConfig::new("", "/usr", &["exec"]),
            MountConfig::new("main", "/usr/local/bin/main", &["exec"]),
        ]);
        let root = fx.root.path();
        let usr = root.join("usr");
        let mut table = MountTable::new(RecordingMounts::default());
        table.establish(&fx.plan).unwrap();

        let overlays = table.ops.overlays();
        assert_eq!(overlays.len(), 1, "{:?}", overlays);
        assert_eq!(overlays[0].0, usr);
        assert!(overlays[0].1.starts_with(&format!("lowerdir={},", usr.display())));
        assert!(overlays[0].1.contains(&fx.scratch.path().display().to_string()));
        assert!(table.mounted().contains(&fx.scratch.path().to_path_buf()));

        // The mount point was created in the overlay, never in the host /usr source
        assert!(root.join("usr/local/bin/main").is_file());
        assert!(!fx.host.path().join("local").exists());

        // Sealed read-only with the bind's options once the nested bind exists
        let nested = root.join("usr/local/bin/main");
        let bind = table.ops.position(&nested, MsFlags::MS_BIND).unwrap();
        let seal = table
            .ops
            .position(&usr, MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY)
            .unwrap();
        assert!(seal > bind);
        match &table.ops.calls[seal] {
            Call::Mount { flags, .. } => assert!(!flags.contains(MsFlags::MS_NOEXEC)),
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[test]
    fn test_nested_target_under_writable_bind_is_rejected() {
        let fx = fixture(vec![
            MountConfig::new("", "/data", &["rw"]),
            MountConfig::new("main", "/data/sub/main", &[]),
        ]);
        let mut table = MountTable::new(RecordingMounts::default());
        let err = table.establish(&fx.plan).unwrap_err();

        match err {
            MountError::Rejected { target, reason, .. } => {
                assert_eq!(target, PathBuf::from("/data/sub/main"));
                assert!(reason.contains("writable host mount"), "{}", reason);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!fx.root.path().join("data/sub").exists());
        assert!(table.mounted().is_empty());
        assert!(table.ops.overlays().is_empty());
    }

    #[test]
    fn test_existing_point_under_writable_bind_is_used() {
        let fx = fixture(vec![
            MountConfig::new("", "/data", &["rw"]),
            MountConfig::new("main", "/data/sub/main", &[]),
        ]);
        // Stands in for a path already present in the bound host directory
        std::fs::create_dir_all(fx.root.path().join("data/sub")).unwrap();
        std::fs::write(fx.root.path().join("data/sub/main"), b"").unwrap();

        let mut table = MountTable::new(RecordingMounts::default());
        table.establish(&fx.plan).unwrap();
        assert!(table
            .mounted()
            .contains(&fx.root.path().join("data/sub/main")));
    }

    #[test]
    fn test_rootfs_base_is_overlaid() {
        let fx = fixture_with(vec![], true);
        let root = fx.root.path();
        let mut table = MountTable::new(RecordingMounts::default());
        table.establish(&fx.plan).unwrap();

        assert_eq!(table.mounted()[0], fx.scratch.path());
        assert_eq!(table.mounted()[1], root);
        let overlays = table.ops.overlays();
        assert_eq!(overlays[0].0, root);
        assert!(overlays[0]
            .1
            .starts_with(&format!("lowerdir={},", fx.host.path().display())));

        // System directories are created in the overlay, not in the rootfs
        assert!(table.mounted().contains(&root.join("tmp")));
        assert!(!fx.host.path().join("tmp").exists());

        match table.ops.calls.last().unwrap() {
            Call::Mount { target, flags, .. } => {
                assert_eq!(target, root);
                assert!(flags.contains(MsFlags::MS_RDONLY | MsFlags::MS_REMOUNT));
            }
            other => panic!("unexpected last call {:?}", other),
        }
    }

    #[test]
    fn test_refused_overlay_falls_back_to_readonly_bind() {
        let fx = fixture_with(vec![MountConfig::new("main", "/bin/main", &["exec"])], true);
        let root = fx.root.path();
        let ops = RecordingMounts {
            refuse_overlay: true,
            ..Default::default()
        };
        let mut table = MountTable::new(ops);
        let err = table.establish(&fx.plan).unwrap_err();

        // The root is bound read-only, so the missing /bin cannot be created
        assert!(matches!(err, MountError::Rejected { ref target, .. } if target == Path::new("/bin/main")));
        assert!(table.ops.overlays().is_empty());
        assert!(table.ops.calls.iter().any(|c| matches!(
            c,
            Call::Mount { target, flags, fstype: None, .. }
                if target == root && flags.contains(MsFlags::MS_BIND | MsFlags::MS_REC)
        )));
        assert!(!root.join("bin").exists());
    }

    #[test]
    fn test_overlay_options_refuse_separators() {
        let ok = overlay_options(Path::new("/l"), Path::new("/u"), Path::new("/w")).unwrap();
        assert_eq!(ok, "lowerdir=/l,upperdir=/u,workdir=/w");
        assert!(overlay_options(Path::new("/a,b"), Path::new("/u"), Path::new("/w")).is_none());
        assert!(overlay_options(Path::new("/l"), Path::new("/u:x"), Path::new("/w")).is_none());
    }
}
