//! Pre-exec ordering enforcement for the sandboxed payload
//!
//! The payload runs a fixed setup sequence between fork and exec:
//! 1. prctl(PR_SET_PDEATHSIG, SIGKILL) and confirm it is PID 1 of the new PID namespace
//! 2. mount propagation hardening: / becomes MS_PRIVATE | MS_REC
//! 3. mount table established, root switched (pivot_root preferred, chroot fallback)
//! 4. chdir into the configured working directory
//! 5. stdio redirection and rlimits
//! 6. privilege drop: bounding and ambient capabilities, groups, gid, uid,
//!    session keyring, remaining capabilities, `no_new_privs`
//! 7. execve of the payload
//!
//! Each step consumes the previous state, so the order cannot drift:
//!
//! ```compile_fail
//! use runj::exec::preexec::{ExecPlan, FreshChild, Sandbox};
//!
//! fn early_exec(exec: &ExecPlan) {
//!     let sandbox = Sandbox::<FreshChild>::new();
//!     let _ = sandbox.exec_payload(exec);
//! }
//! ```
//!
//! ```compile_fail
//! use runj::exec::preexec::{FreshChild, Sandbox};
//! use runj::kernel::mount::MountPlan;
//!
//! fn skip_propagation_hardening(plan: &MountPlan) {
//!     let sandbox = Sandbox::<FreshChild>::new().confirm_namespaces().unwrap();
//!     let _ = sandbox.provision_root(plan);
//! }
//! ```
//!
//! ```compile_fail
//! use runj::exec::preexec::{ExecPlan, Sandbox, StdioFds, WorkdirReady};
//!
//! fn exec_with_privileges(sandbox: Sandbox<WorkdirReady>, stdio: StdioFds, exec: &ExecPlan) {
//!     let limited = sandbox.apply_runtime_hygiene(stdio, &exec.rlimits).unwrap();
//!     let _ = limited.exec_payload(exec);
//! }
//! ```
//!
//! ```compile_fail
//! use runj::exec::preexec::{FreshChild, Sandbox};
//!
//! fn reuse_state() {
//!     let sandbox = Sandbox::<FreshChild>::new();
//!     let _first = sandbox.confirm_namespaces();
//!     let _second = sandbox.confirm_namespaces();
//! }
//! ```

use crate::config::types::{LaunchError, MountError, RunConfig, SandboxError};
use crate::kernel::capabilities;
use crate::kernel::credentials::{transition_to_unprivileged, Credentials};
use crate::kernel::keyring::join_new_session_keyring;
use crate::kernel::mount::{switch_root, MountPlan, MountTable};
use crate::kernel::rlimit::RlimitSet;
use nix::errno::Errno;
use nix::unistd::{dup2, execve, getpid, Pid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::ffi::CString;
use std::marker::PhantomData;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

/// Failure record written by a sandbox process to its error pipe
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ChildFailure {
    Mount(MountError),
    Launch(LaunchError),
}

impl From<MountError> for ChildFailure {
    fn from(err: MountError) -> Self {
        Self::Mount(err)
    }
}

impl From<LaunchError> for ChildFailure {
    fn from(err: LaunchError) -> Self {
        Self::Launch(err)
    }
}

impl From<ChildFailure> for SandboxError {
    fn from(failure: ChildFailure) -> Self {
        match failure {
            ChildFailure::Mount(e) => SandboxError::Mount(e),
            ChildFailure::Launch(e) => SandboxError::Launch(e),
        }
    }
}

/// Everything the payload needs after fork, prepared on the host
#[derive(Clone, Debug)]
pub struct ExecPlan {
    pub plan: MountPlan,
    pub cwd: PathBuf,
    /// `command[0]` as configured, for error messages
    pub program: String,
    pub argv: Vec<CString>,
    pub envp: Vec<CString>,
    /// Paths tried in order by `exec_payload`
    pub candidates: Vec<CString>,
    pub rlimits: RlimitSet,
    pub credentials: Credentials,
    pub new_session_keyring: bool,
}

impl ExecPlan {
    pub fn prepare(config: &RunConfig, plan: MountPlan) -> Result<Self, LaunchError> {
        let program = config
            .command
            .first()
            .filter(|p| !p.is_empty())
            .ok_or(LaunchError::EmptyCommand)?
            .clone();

        let argv = config
            .command
            .iter()
            .map(|arg| to_cstring(arg, "command argument"))
            .collect::<Result<Vec<_>, _>>()?;

        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), config.sandbox_path_var());
        env.insert("HOME".to_string(), "/".to_string());
        for (key, value) in &config.env {
            env.insert(key.clone(), value.clone());
        }

        let candidates = resolve_candidates(&program, env.get("PATH").map(String::as_str))
            .iter()
            .map(|path| to_cstring(path, "program path"))
            .collect::<Result<Vec<_>, _>>()?;

        let envp = env
            .iter()
            .map(|(key, value)| to_cstring(&format!("{}={}", key, value), "environment entry"))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            plan,
            cwd: config.cwd.clone(),
            program,
            argv,
            envp,
            candidates,
            rlimits: RlimitSet::from_limits(&config.limits),
            credentials: Credentials::from_config(config),
            new_session_keyring: !config.no_new_keyring,
        })
    }
}

fn to_cstring(value: &str, what: &str) -> Result<CString, LaunchError> {
    CString::new(value).map_err(|_| LaunchError::Setup(format!("{} contains a NUL byte", what)))
}

/// execvp-style lookup: a name with a slash is used as is, anything else is
/// searched in each `PATH` directory.
fn resolve_candidates(program: &str, path_var: Option<&str>) -> Vec<String> {
    if program.contains('/') {
        return vec![program.to_string()];
    }
    path_var
        .unwrap_or_default()
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| format!("{}/{}", dir.trim_end_matches('/'), program))
        .collect()
}

/// Descriptors installed as the payload's stdin, stdout and stderr
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StdioFds {
    pub stdin: RawFd,
    pub stdout: RawFd,
    pub stderr: RawFd,
}

/// Set SIGKILL as parent death signal. Called in every process forked for a run.
pub fn setup_parent_death_signal() -> Result<(), LaunchError> {
    use nix::sys::prctl;
    use nix::sys::signal::Signal;

    prctl::set_pdeathsig(Signal::SIGKILL)
        .map_err(|e| LaunchError::Setup(format!("failed to set parent death signal: {}", e)))
}

/// Type-state marker: freshly forked payload
pub struct FreshChild;

/// Type-state marker: running as init of the sandbox namespaces
pub struct NamespacesReady;

/// Type-state marker: mount propagation hardened
pub struct MountsPrivate;

/// Type-state marker: sandbox root is the process root
pub struct RootReady;

/// Type-state marker: inside the working directory
pub struct WorkdirReady;

/// Type-state marker: stdio and rlimits in place
pub struct LimitsApplied;

/// Type-state marker: ready for exec (all gates passed)
pub struct ExecReady;

/// Payload process with type-state tracking
pub struct Sandbox<S> {
    pid: Pid,
    _state: PhantomData<S>,
}

impl<S> Sandbox<S> {
    fn advance<T>(self) -> Sandbox<T> {
        Sandbox {
            pid: self.pid,
            _state: PhantomData,
        }
    }
}

impl Default for Sandbox<FreshChild> {
    fn default() -> Self {
        Self::new()
    }
}

impl Sandbox<FreshChild> {
    pub fn new() -> Self {
        Self {
            pid: getpid(),
            _state: PhantomData,
        }
    }

    /// The proxy unshared the namespaces; the payload must be their init.
    pub fn confirm_namespaces(self) -> Result<Sandbox<NamespacesReady>, LaunchError> {
        setup_parent_death_signal()?;

        if self.pid != Pid::from_raw(1) {
            return Err(LaunchError::Namespace(format!(
                "payload runs as pid {} instead of the PID namespace init",
                self.pid
            )));
        }
        Ok(self.advance())
    }
}

impl Sandbox<NamespacesReady> {
    pub fn harden_mount_propagation(self) -> Result<Sandbox<MountsPrivate>, LaunchError> {
        crate::kernel::namespace::harden_mount_propagation()?;
        Ok(self.advance())
    }
}

impl Sandbox<MountsPrivate> {
    /// Establish every planned mount, then switch into the prepared root.
    pub fn provision_root(self, plan: &MountPlan) -> Result<Sandbox<RootReady>, ChildFailure> {
        let mut table = MountTable::kernel();
        table.establish(plan)?;

        if let Err(e) = switch_root(&plan.root) {
            table.teardown();
            return Err(e.into());
        }
        table.commit();

        Ok(self.advance())
    }
}

impl Sandbox<RootReady> {
    pub fn enter_workdir(self, cwd: &Path) -> Result<Sandbox<WorkdirReady>, LaunchError> {
        nix::unistd::chdir(cwd).map_err(|_| LaunchError::CwdMissing(cwd.to_path_buf()))?;
        Ok(self.advance())
    }
}

impl Sandbox<WorkdirReady> {
    /// Install stdio and apply rlimits.
    pub fn apply_runtime_hygiene(
        self,
        stdio: StdioFds,
        rlimits: &RlimitSet,
    ) -> Result<Sandbox<LimitsApplied>, LaunchError> {
        for (fd, target) in [(stdio.stdin, 0), (stdio.stdout, 1), (stdio.stderr, 2)] {
            dup2(fd, target).map_err(|e| {
                LaunchError::Stdio(format!("dup2({}, {}) failed: {}", fd, target, e))
            })?;
        }

        reset_signal_dispositions()?;
        nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(0o022));
        rlimits.apply()?;

        Ok(self.advance())
    }
}

impl Sandbox<LimitsApplied> {
    /// Become `credentials` with no capabilities left. The bounding set goes
    /// first, while `CAP_SETPCAP` is still held.
    pub fn drop_privileges(
        self,
        credentials: &Credentials,
        new_session_keyring: bool,
    ) -> Result<Sandbox<ExecReady>, LaunchError> {
        capabilities::drop_bounding_set()?;
        capabilities::clear_ambient()?;
        transition_to_unprivileged(credentials)?;
        if new_session_keyring {
            join_new_session_keyring()?;
        }
        // A user namespace keeps its capabilities across a uid change
        capabilities::zero_capabilities()?;
        capabilities::set_no_new_privs()?;

        Ok(self.advance())
    }
}

impl Sandbox<ExecReady> {
    /// Replace the process image. Only returns on failure.
    pub fn exec_payload(self, exec: &ExecPlan) -> Result<Infallible, LaunchError> {
        let mut denied = false;

        for candidate in &exec.candidates {
            match execve(candidate.as_c_str(), &exec.argv, &exec.envp) {
                Ok(never) => match never {},
                Err(Errno::EACCES) => denied = true,
                Err(Errno::ENOENT) | Err(Errno::ENOTDIR) => {}
                Err(errno) => return Err(exec_error(exec, errno)),
            }
        }

        let errno = if denied { Errno::EACCES } else { Errno::ENOENT };
        Err(exec_error(exec, errno))
    }
}

/// Ignored signals and the signal mask survive execve; the host ignores SIGPIPE.
fn reset_signal_dispositions() -> Result<(), LaunchError> {
    use nix::sys::signal::{signal, sigprocmask, SigHandler, SigSet, SigmaskHow, Signal};

    // SAFETY: restoring the default disposition installs no handler code.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) }
        .map_err(|e| LaunchError::Setup(format!("failed to reset SIGPIPE: {}", e)))?;
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
        .map_err(|e| LaunchError::Setup(format!("failed to clear signal mask: {}", e)))?;
    Ok(())
}

fn exec_error(exec: &ExecPlan, errno: Errno) -> LaunchError {
    LaunchError::Exec {
        command: exec.program.clone(),
        errno: errno as i32,
        reason: errno.desc().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::DEFAULT_SANDBOX_PATH;

    fn plan() -> MountPlan {
        MountPlan::resolve(
            &RunConfig::new(["x"]),
            Path::new("/tmp/runj-test-root"),
            Path::new("/tmp/runj-test-scratch"),
        )
        .unwrap()
    }

    #[test]
    fn test_bare_name_searches_path() {
        let mut config = RunConfig::new(["main", "--flag"]);
        config.paths.push("/sandbox/bin".into());
        let exec = ExecPlan::prepare(&config, plan()).unwrap();

        assert_eq!(exec.candidates[0].to_str().unwrap(), "/sandbox/bin/main");
        assert_eq!(exec.candidates[1].to_str().unwrap(), "/usr/local/bin/main");
        assert_eq!(
            exec.candidates.len(),
            1 + DEFAULT_SANDBOX_PATH.split(':').count()
        );
        assert_eq!(exec.argv.len(), 2);
    }

    #[test]
    fn test_slash_name_is_used_verbatim() {
        let exec = ExecPlan::prepare(&RunConfig::new(["./run.sh"]), plan()).unwrap();
        assert_eq!(exec.candidates.len(), 1);
        assert_eq!(exec.candidates[0].to_str().unwrap(), "./run.sh");
    }

    #[test]
    fn test_environment_is_cleared_and_overridable() {
        let mut config = RunConfig::new(["main"]);
        config.env.insert("LANG".into(), "C.UTF-8".into());
        config.env.insert("PATH".into(), "/opt/bin".into());
        let exec = ExecPlan::prepare(&config, plan()).unwrap();

        let env: Vec<&str> = exec.envp.iter().map(|e| e.to_str().unwrap()).collect();
        assert_eq!(env, vec!["HOME=/", "LANG=C.UTF-8", "PATH=/opt/bin"]);
        assert_eq!(exec.candidates[0].to_str().unwrap(), "/opt/bin/main");
    }

    #[test]
    fn test_empty_and_nul_commands_are_rejected() {
        let empty = ExecPlan::prepare(&RunConfig::new(Vec::<String>::new()), plan());
        assert_eq!(empty.unwrap_err(), LaunchError::EmptyCommand);

        let nul = ExecPlan::prepare(&RunConfig::new(["ma\0in"]), plan());
        assert!(matches!(nul, Err(LaunchError::Setup(_))));
    }

    #[test]
    fn test_exec_error_reports_errno() {
        let exec = ExecPlan::prepare(&RunConfig::new(["main"]), plan()).unwrap();
        match exec_error(&exec, Errno::EACCES) {
            LaunchError::Exec {
                command, errno, ..
            } => {
                assert_eq!(command, "main");
                assert_eq!(errno, libc::EACCES);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_child_failure_roundtrips_through_the_error_pipe_format() {
        let failure = ChildFailure::Launch(LaunchError::CwdMissing("/nope".into()));
        let encoded = serde_json::to_vec(&failure).unwrap();
        let decoded: ChildFailure = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, failure);
        assert!(matches!(
            SandboxError::from(decoded),
            SandboxError::Launch(LaunchError::CwdMissing(_))
        ));
    }

    #[test]
    fn test_credentials_and_keyring_follow_config() {
        let mut config = RunConfig::new(["main"]);
        config.container_gid = 2000;
        config.no_new_keyring = true;
        let exec = ExecPlan::prepare(&config, plan()).unwrap();
        assert_eq!(exec.credentials.uid, 1000);
        assert_eq!(exec.credentials.gid, 2000);
        assert!(exec.credentials.clear_groups);
        assert!(!exec.new_session_keyring);
    }
}
