// Config validation
// Runs before any resource is provisioned and fails fast with actionable errors

use crate::config::types::{MountOptions, RunConfig, SandboxError, Result};
use std::collections::HashSet;
use std::path::{Component, Path};

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collapse into an error when any check failed.
    pub fn into_result(self) -> Result<Self> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(SandboxError::Config(self.errors.join("; ")))
        }
    }
}

/// Validate a run configuration.
pub fn validate_config(config: &RunConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_command(config, &mut result);
    validate_mounts(config, &mut result);
    validate_limits(config, &mut result);
    validate_cpu(config, &mut result);
    validate_identity(config, &mut result);
    validate_fd(config, &mut result);
    validate_paths(config, &mut result);

    result
}

fn validate_command(config: &RunConfig, result: &mut ValidationResult) {
    match config.command.first() {
        None => result.add_error("command must not be empty".to_string()),
        Some(program) if program.is_empty() => {
            result.add_error("command[0] must not be an empty string".to_string())
        }
        Some(_) => {}
    }

    if config.command.iter().any(|arg| arg.contains('\0')) {
        result.add_error("command arguments must not contain NUL bytes".to_string());
    }

    if !config.cwd.is_absolute() {
        result.add_error(format!("cwd must be an absolute path: {:?}", config.cwd));
    }
}

fn validate_mounts(config: &RunConfig, result: &mut ValidationResult) {
    let mut targets = HashSet::new();

    for (index, mount) in config.mounts.iter().enumerate() {
        if !mount.from.is_absolute() {
            result.add_error(format!(
                "mounts[{}].from must be an absolute path: {:?}",
                index, mount.from
            ));
        } else if !mount.from.exists() {
            result.add_warning(format!(
                "mounts[{}].from does not exist on the host: {:?}",
                index, mount.from
            ));
        }

        if !is_clean_absolute(&mount.to) {
            result.add_error(format!(
                "mounts[{}].to must be an absolute path without '..': {:?}",
                index, mount.to
            ));
        } else if mount.to == Path::new("/") {
            result.add_error(format!(
                "mounts[{}].to must not be the sandbox root, use rootfs instead",
                index
            ));
        }

        if let Err(e) = MountOptions::parse(&mount.options) {
            result.add_error(format!("mounts[{}]: {}", index, e));
        }

        if !targets.insert(mount.to.clone()) {
            result.add_warning(format!(
                "mounts[{}].to {:?} is already a mount target, the later mount shadows the earlier",
                index, mount.to
            ));
        }
    }

    if let Some(rootfs) = &config.rootfs {
        if !rootfs.is_absolute() {
            result.add_error(format!("rootfs must be an absolute path: {:?}", rootfs));
        } else if !rootfs.is_dir() {
            result.add_warning(format!("rootfs is not a directory: {:?}", rootfs));
        }
    }
}

fn validate_limits(config: &RunConfig, result: &mut ValidationResult) {
    let limits = &config.limits;
    let checks = [
        ("time_ms", limits.time_ms),
        ("memory_kib", limits.memory_kib),
        ("pids_count", limits.pids_count),
        ("fsize_kib", limits.fsize_kib),
        ("no_file", limits.no_file),
    ];
    for (name, value) in checks {
        if value == Some(0) {
            result.add_error(format!("limits.{} cannot be zero", name));
        }
    }

    if let Some(memory_kib) = limits.memory_kib {
        if memory_kib > 0 && memory_kib < 1024 {
            result.add_warning(format!(
                "limits.memory_kib {} is very low (< 1MiB), the program may be OOM-killed at start",
                memory_kib
            ));
        }
    }

    if let Some(no_file) = limits.no_file {
        if no_file > 0 && no_file < 4 {
            result.add_warning(format!(
                "limits.no_file {} leaves no room beyond stdio",
                no_file
            ));
        }
    }

    if config.needs_cgroup() && !config.cgroup_parent().is_absolute() {
        result.add_error(format!(
            "cgroup_path must be an absolute path: {:?}",
            config.cgroup_parent()
        ));
    }
}

fn validate_cpu(config: &RunConfig, result: &mut ValidationResult) {
    let limits = &config.limits;

    if let Some(shares) = limits.cpu_shares {
        if !(MIN_CPU_SHARES..=MAX_CPU_SHARES).contains(&shares) {
            result.add_error(format!(
                "limits.cpu_shares {} must be within {}..={}",
                shares, MIN_CPU_SHARES, MAX_CPU_SHARES
            ));
        }
    }

    if let Some(quota) = limits.cpu_quota {
        if quota < MIN_CPU_QUOTA_US {
            result.add_error(format!(
                "limits.cpu_quota {}us is below the {}us minimum",
                quota, MIN_CPU_QUOTA_US
            ));
        }
    }

    for (name, value) in [
        ("cpuset_cpus", &limits.cpuset_cpus),
        ("cpuset_mems", &limits.cpuset_mems),
    ] {
        if let Some(list) = value {
            if !is_cpu_list(list) {
                result.add_error(format!(
                    "limits.{} {:?} is not a list like \"0-3,6\"",
                    name, list
                ));
            }
        }
    }
}

fn validate_identity(config: &RunConfig, result: &mut ValidationResult) {
    if config.container_uid == 0 {
        result.add_error("container_uid must not be 0".to_string());
    }
    if config.container_gid == 0 {
        result.add_error("container_gid must not be 0".to_string());
    }

    if let Some(dir) = &config.workspace_dir {
        if !dir.is_absolute() {
            result.add_error(format!("workspace_dir must be an absolute path: {:?}", dir));
        }
    }
}

/// cgroup v1 `cpu.shares` bounds, converted to `cpu.weight` on write.
const MIN_CPU_SHARES: u64 = 2;
const MAX_CPU_SHARES: u64 = 262_144;

const MIN_CPU_QUOTA_US: u64 = 1000;

/// `0`, `0-3`, `0-3,6,8-9`
fn is_cpu_list(list: &str) -> bool {
    !list.is_empty()
        && list.split(',').all(|range| {
            let mut bounds = range.splitn(2, '-');
            let valid = |part: Option<&str>| {
                part.map_or(false, |p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
            };
            match (bounds.next(), bounds.next()) {
                (first, None) => valid(first),
                (first, second) => valid(first) && valid(second),
            }
        })
}

fn validate_fd(config: &RunConfig, result: &mut ValidationResult) {
    let Some(fd) = &config.fd else {
        return;
    };

    if fd.stdout_to_stderr && fd.stderr_to_stdout {
        result.add_error(
            "fd.stdout_to_stderr and fd.stderr_to_stdout cannot both be set".to_string(),
        );
    }
    if fd.stdout_to_stderr && fd.stdout.is_some() {
        result.add_error("fd.stdout cannot be set together with fd.stdout_to_stderr".to_string());
    }
    if fd.stderr_to_stdout && fd.stderr.is_some() {
        result.add_error("fd.stderr cannot be set together with fd.stderr_to_stdout".to_string());
    }

    if let Some(stdin) = &fd.stdin {
        if !stdin.exists() {
            result.add_error(format!("fd.stdin does not exist: {:?}", stdin));
        }
    }

    for (name, path) in [("stdout", &fd.stdout), ("stderr", &fd.stderr)] {
        if let Some(path) = path {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                if !parent.exists() {
                    result.add_error(format!(
                        "fd.{} parent directory does not exist: {:?}",
                        name, parent
                    ));
                }
            }
        }
    }
}

fn validate_paths(config: &RunConfig, result: &mut ValidationResult) {
    for path in &config.paths {
        if !path.is_absolute() {
            result.add_error(format!("paths entry must be absolute: {:?}", path));
        }
        if path.to_string_lossy().contains(':') {
            result.add_error(format!("paths entry must not contain ':': {:?}", path));
        }
    }

    for key in config.env.keys() {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            result.add_error(format!("env key {:?} is not a valid variable name", key));
        }
    }
}

/// Absolute, and free of `..` components.
pub fn is_clean_absolute(path: &Path) -> bool {
    path.is_absolute() && !path.components().any(|c| c == Component::ParentDir)
}
