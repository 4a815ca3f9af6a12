/// Core types for the runj sandbox: run configuration, report and errors
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Parent cgroup used for per-run cgroups when the config does not name one.
pub const DEFAULT_CGROUP_PARENT: &str = "/sys/fs/cgroup/runj";

/// uid and gid the program runs as when the config does not name them.
pub const DEFAULT_CONTAINER_ID: u32 = 1000;

/// `cpu.max` period paired with `cpu_quota`
pub const CPU_PERIOD_US: u64 = 100_000;

/// `PATH` seen by the sandboxed program before `paths` entries are prepended.
pub const DEFAULT_SANDBOX_PATH: &str =
    "/usr/local/bin:/usr/local/sbin:/usr/bin:/usr/sbin:/bin:/sbin";

/// Configuration of one sandboxed run. Immutable for the duration of the run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    /// Working directory inside the sandbox
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,

    /// Executable followed by its arguments. JSON accepts an array or a shell-style string.
    #[serde(deserialize_with = "deserialize_command")]
    pub command: Vec<String>,

    /// Bind mounts, applied in declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountConfig>,

    #[serde(default)]
    pub limits: LimitsConfig,

    /// Host directory used as the read-only base of the sandbox root.
    /// Without it the root is an empty private tmpfs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<PathBuf>,

    /// Directories prepended to the sandbox `PATH`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<PathBuf>,

    /// Extra environment variables; the environment is otherwise cleared
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fd: Option<FdConfig>,

    /// Run inside a new user namespace where the invoking uid/gid appear as
    /// `container_uid`/`container_gid`
    #[serde(default)]
    pub rootless: bool,

    /// Non-root uid the program runs as
    #[serde(default = "default_container_id")]
    pub container_uid: u32,

    /// Non-root gid the program runs as
    #[serde(default = "default_container_id")]
    pub container_gid: u32,

    /// Keep the inherited session keyring instead of joining a fresh one
    #[serde(default)]
    pub no_new_keyring: bool,

    /// Parent cgroup v2 directory for the per-run cgroup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgroup_path: Option<PathBuf>,

    /// Host directory holding per-run workspaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,
}

#[inline]
fn default_cwd() -> PathBuf {
    "/".into()
}

#[inline]
fn default_container_id() -> u32 {
    DEFAULT_CONTAINER_ID
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandRepr {
    Simple(String),
    Full(Vec<String>),
}

fn deserialize_command<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match CommandRepr::deserialize(deserializer)? {
        CommandRepr::Simple(line) => shell_words::split(&line).map_err(serde::de::Error::custom),
        CommandRepr::Full(parts) => Ok(parts),
    }
}

impl RunConfig {
    /// Minimal configuration: command only, everything else defaulted.
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cwd: default_cwd(),
            command: command.into_iter().map(Into::into).collect(),
            mounts: Vec::new(),
            limits: LimitsConfig::default(),
            rootfs: None,
            paths: Vec::new(),
            env: BTreeMap::new(),
            fd: None,
            rootless: false,
            container_uid: DEFAULT_CONTAINER_ID,
            container_gid: DEFAULT_CONTAINER_ID,
            no_new_keyring: false,
            cgroup_path: None,
            workspace_dir: None,
        }
    }

    /// Whether this run needs a per-run cgroup.
    pub fn needs_cgroup(&self) -> bool {
        let limits = &self.limits;
        limits.memory_kib.is_some()
            || limits.pids_count.is_some()
            || limits.cpu_shares.is_some()
            || limits.cpu_quota.is_some()
            || limits.cpuset_cpus.is_some()
            || limits.cpuset_mems.is_some()
    }

    pub fn cgroup_parent(&self) -> PathBuf {
        self.cgroup_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CGROUP_PARENT))
    }

    /// `PATH` for the sandboxed program.
    pub fn sandbox_path_var(&self) -> String {
        let mut parts: Vec<String> = self
            .paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        parts.push(DEFAULT_SANDBOX_PATH.to_string());
        parts.join(":")
    }
}

/// One `from -> to` bind mount.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MountConfig {
    /// Absolute host path, file or directory
    pub from: PathBuf,
    /// Absolute path inside the sandbox
    pub to: PathBuf,
    /// Flags from the fixed vocabulary; see [`MountOptions`]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl MountConfig {
    pub fn new(from: impl Into<PathBuf>, to: impl Into<PathBuf>, options: &[&str]) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }
}

/// Resolved mount options. Defaults: read-only, noexec.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MountOptions {
    pub exec: bool,
    pub writable: bool,
}

impl MountOptions {
    /// Parse the option vocabulary: `exec`, `noexec`, `readwrite`/`rw`, `readonly`/`ro`.
    pub fn parse(options: &[String]) -> std::result::Result<Self, MountError> {
        let mut exec = None;
        let mut writable = None;

        for option in options {
            let (slot, value) = match option.trim() {
                "exec" => (&mut exec, true),
                "noexec" => (&mut exec, false),
                "readwrite" | "rw" => (&mut writable, true),
                "readonly" | "ro" => (&mut writable, false),
                other => return Err(MountError::UnknownOption(other.to_string())),
            };
            if matches!(*slot, Some(previous) if previous != value) {
                return Err(MountError::ConflictingOptions(options.join(",")));
            }
            *slot = Some(value);
        }

        Ok(Self {
            exec: exec.unwrap_or(false),
            writable: writable.unwrap_or(false),
        })
    }
}

/// Resource ceilings. An unset field means no enforcement for that dimension.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Wall-clock budget measured from process start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,

    /// cgroup `memory.max`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_kib: Option<u64>,

    /// cgroup `pids.max`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids_count: Option<u64>,

    /// RLIMIT_FSIZE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fsize_kib: Option<u64>,

    /// RLIMIT_NOFILE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_file: Option<u64>,

    /// Relative CPU share (2..=262144), written as cgroup `cpu.weight`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u64>,

    /// CPU time in microseconds per [`CPU_PERIOD_US`], cgroup `cpu.max`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_quota: Option<u64>,

    /// cgroup `cpuset.cpus`, e.g. `0-3,6`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpuset_cpus: Option<String>,

    /// cgroup `cpuset.mems`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpuset_mems: Option<String>,
}

/// Stdio redirection, host paths. Missing streams go to `/dev/null`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FdConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<PathBuf>,

    #[serde(default)]
    pub stdout_to_stderr: bool,

    #[serde(default)]
    pub stderr_to_stdout: bool,
}

/// Outcome taxonomy. Closed set.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Exited with code 0
    Ok,
    /// Non-zero exit, fatal signal, or the command could not be executed
    RuntimeError,
    /// Killed by the wall-clock enforcer
    Timeout,
    /// The sandbox could not be provisioned or launched
    SetupError,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::RuntimeError => "RUNTIME_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::SetupError => "SETUP_ERROR",
        };
        f.write_str(name)
    }
}

/// Report of one run, produced exactly once after teardown.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub exit_code: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,

    #[serde(default)]
    pub wall_time_ms: u64,
    #[serde(default)]
    pub cpu_user_time_ms: u64,
    #[serde(default)]
    pub cpu_kernel_time_ms: u64,
    #[serde(default)]
    pub memory_usage_kib: u64,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub memory_limit_exceeded: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionReport {
    pub fn is_ok(&self) -> bool {
        self.status == ExecutionStatus::Ok
    }
}

/// Provisioning-time failures. Serializable so the sandbox child can ship them
/// back over its error pipe.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MountError {
    #[error("mount source {0} does not exist")]
    SourceMissing(PathBuf),

    #[error("mount source {0} must be an absolute path")]
    InvalidSource(PathBuf),

    #[error("mount target {0} must be an absolute path without '..' components")]
    InvalidTarget(PathBuf),

    #[error("unknown mount option '{0}'")]
    UnknownOption(String),

    #[error("conflicting mount options: {0}")]
    ConflictingOptions(String),

    #[error("failed to mount {from} at {target}: {reason}")]
    Rejected {
        from: String,
        target: PathBuf,
        reason: String,
    },
}

/// Pre-execution failures of the sandboxed process.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LaunchError {
    #[error("command must not be empty")]
    EmptyCommand,

    #[error("working directory {0} does not exist inside the sandbox")]
    CwdMissing(PathBuf),

    #[error("cannot execute {command}: {reason}")]
    Exec {
        command: String,
        errno: i32,
        reason: String,
    },

    #[error("namespace setup failed: {0}")]
    Namespace(String),

    #[error("stdio setup failed: {0}")]
    Stdio(String),

    #[error("privilege drop failed: {0}")]
    Privilege(String),

    #[error("sandbox setup failed: {0}")]
    Setup(String),

    #[error("failed to create sandbox process: {0}")]
    Spawn(String),
}

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Mount error: {0}")]
    Mount(#[from] MountError),

    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Cleanup error: {0}")]
    Cleanup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_config_deserializes() {
        let json = r#"{
            "cwd": "/",
            "command": ["main"],
            "mounts": [
                { "from": "/opt/stub/main", "to": "/usr/local/bin/main", "options": ["exec"] }
            ],
            "limits": { "time_ms": 1000 }
        }"#;

        let config: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.command, vec!["main".to_string()]);
        assert_eq!(config.mounts.len(), 1);
        assert_eq!(config.mounts[0].options, vec!["exec".to_string()]);
        assert_eq!(config.limits.time_ms, Some(1000));
        assert!(!config.rootless);
        assert!(!config.needs_cgroup());
        assert_eq!(config.container_uid, DEFAULT_CONTAINER_ID);
        assert_eq!(config.container_gid, DEFAULT_CONTAINER_ID);
        assert!(!config.no_new_keyring);
    }

    #[test]
    fn test_cpu_controls_need_a_cgroup() {
        let config: RunConfig = serde_json::from_str(
            r#"{
                "command": ["main"],
                "container_uid": 2000,
                "limits": { "cpu_shares": 512, "cpuset_cpus": "0-1" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.container_uid, 2000);
        assert_eq!(config.limits.cpu_shares, Some(512));
        assert_eq!(config.limits.cpuset_cpus.as_deref(), Some("0-1"));
        assert!(config.needs_cgroup());
    }

    #[test]
    fn test_shell_string_command_is_split() {
        let config: RunConfig =
            serde_json::from_str(r#"{ "command": "sh -c 'echo hi there'" }"#).unwrap();
        assert_eq!(config.command, vec!["sh", "-c", "echo hi there"]);
        assert_eq!(config.cwd, PathBuf::from("/"));
    }

    #[test]
    fn test_unbalanced_shell_string_is_rejected() {
        let result: std::result::Result<RunConfig, _> =
            serde_json::from_str(r#"{ "command": "sh -c 'oops" }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_status_serializes_screaming_snake_case() {
        let encoded = serde_json::to_string(&ExecutionStatus::RuntimeError).unwrap();
        assert_eq!(encoded, "\"RUNTIME_ERROR\"");
        assert_eq!(ExecutionStatus::Ok.to_string(), "OK");
        assert_eq!(ExecutionStatus::SetupError.to_string(), "SETUP_ERROR");
    }

    #[test]
    fn test_report_omits_empty_extension_fields() {
        let report = ExecutionReport {
            status: ExecutionStatus::Ok,
            exit_code: 0,
            signal: None,
            wall_time_ms: 3,
            cpu_user_time_ms: 1,
            cpu_kernel_time_ms: 1,
            memory_usage_kib: 512,
            memory_limit_exceeded: false,
            error: None,
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["status"], "OK");
        assert_eq!(value["exit_code"], 0);
        assert!(value.get("signal").is_none());
        assert!(value.get("memory_limit_exceeded").is_none());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_mount_options_defaults_and_aliases() {
        assert_eq!(MountOptions::parse(&[]).unwrap(), MountOptions::default());

        let opts = MountOptions::parse(&["exec".to_string(), "rw".to_string()]).unwrap();
        assert!(opts.exec);
        assert!(opts.writable);

        let opts = MountOptions::parse(&["readonly".to_string(), "noexec".to_string()]).unwrap();
        assert!(!opts.exec);
        assert!(!opts.writable);
    }

    #[test]
    fn test_mount_options_reject_unknown_and_conflicts() {
        assert_eq!(
            MountOptions::parse(&["suid".to_string()]),
            Err(MountError::UnknownOption("suid".to_string()))
        );
        assert!(matches!(
            MountOptions::parse(&["exec".to_string(), "noexec".to_string()]),
            Err(MountError::ConflictingOptions(_))
        ));
        // Repeating the same flag is not a conflict
        assert!(MountOptions::parse(&["exec".to_string(), "exec".to_string()]).is_ok());
    }

    #[test]
    fn test_sandbox_path_prepends_paths() {
        let mut config = RunConfig::new(["main"]);
        config.paths = vec![PathBuf::from("/sandbox/bin")];
        assert_eq!(
            config.sandbox_path_var(),
            format!("/sandbox/bin:{}", DEFAULT_SANDBOX_PATH)
        );
    }
}
