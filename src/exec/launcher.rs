//! Process launcher: host -> proxy -> payload
//!
//! The host forks a proxy, which unshares the sandbox namespaces and then
//! forks the payload as PID 1 of the new PID namespace. Five close-on-exec
//! pipes connect them:
//!
//! - ready (proxy -> host): namespaces exist, id maps and cgroup may be applied
//! - sync (host -> proxy): go ahead and fork the payload
//! - error (proxy/payload -> host): JSON [`ChildFailure`]; EOF without data means execve succeeded
//! - status (proxy -> host): line-delimited JSON [`ProxyMessage`]
//! - control (host -> proxy): [`KILL_BYTE`] asks the proxy to SIGKILL the payload
//!
//! Only the proxy signals the payload, and only before reaping it, so a kill
//! can never reach a recycled pid. The host signals the proxy only while
//! the proxy is unreaped.
//!
//! The proxy and the payload allocate between fork and exec (fd listing
//! fallback, JSON reports). Only the forking thread survives fork; this
//! relies on the C library's malloc resetting its locks in the child, as
//! glibc and musl do.

use crate::config::types::{FdConfig, LaunchError, Result, SandboxError};
use crate::exec::preexec::{
    setup_parent_death_signal, ChildFailure, ExecPlan, FreshChild, Sandbox, StdioFds,
};
use crate::kernel::cgroup::CgroupV2;
use crate::kernel::namespace::{IdMapping, NamespaceIsolation};
use crate::utils::fd_closure::close_fds_except;
use crossbeam_channel::{bounded, Receiver};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, getpid, getppid, pipe2, setpgid, ForkResult, Pid};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

/// Proxy exit code when setup failed before the payload existed
const PROXY_SETUP_EXIT: i32 = 125;
/// Payload exit code when the pre-exec chain failed
const PAYLOAD_SETUP_EXIT: i32 = 127;

const READY_BYTE: u8 = b'R';
const GO_BYTE: u8 = b'G';
/// Sent on the control pipe to have the proxy SIGKILL the payload
pub const KILL_BYTE: u8 = b'K';

/// Poll interval of the proxy where pidfds are unavailable
const REAP_POLL_MS: libc::c_int = 10;

/// How a process ended, from its wait status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(i32),
}

/// `rusage` of the payload
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub user_ms: u64,
    pub sys_ms: u64,
    pub max_rss_kib: u64,
}

/// Status pipe protocol, one JSON object per line
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProxyMessage {
    Spawned {
        payload_pid: i32,
    },
    Finished {
        outcome: ExitOutcome,
        usage: ResourceUsage,
    },
}

/// Termination notification produced by the waiter thread
#[derive(Clone, Copy, Debug)]
pub struct ExitEvent {
    /// Payload wait status as reported by the proxy
    pub payload: Option<(ExitOutcome, ResourceUsage)>,
    /// Proxy wait status, `None` if it could not be reaped
    pub proxy: Option<ExitOutcome>,
    pub at: Instant,
}

/// Host-side stdio for the payload, opened before fork
#[derive(Debug)]
pub struct StdioFiles {
    stdin: File,
    stdout: File,
    stderr: File,
}

impl StdioFiles {
    /// Open the configured streams. Missing streams are bound to `/dev/null`,
    /// output files are created 0664 or truncated.
    pub fn open(fd: Option<&FdConfig>) -> Result<Self> {
        let default_fd = FdConfig::default();
        let fd = fd.unwrap_or(&default_fd);

        if fd.stdout_to_stderr && fd.stderr_to_stdout {
            return Err(stdio_error(
                "stdout_to_stderr and stderr_to_stdout are mutually exclusive".to_string(),
            ));
        }

        let stdin = match &fd.stdin {
            Some(path) => File::open(path),
            None => File::open("/dev/null"),
        }
        .map_err(|e| stdio_error(format!("cannot open stdin: {}", e)))?;

        let (stdout, stderr) = if fd.stdout_to_stderr {
            if fd.stdout.is_some() {
                return Err(stdio_error(
                    "stdout cannot be set together with stdout_to_stderr".to_string(),
                ));
            }
            let stderr = open_output(fd.stderr.as_deref(), "stderr")?;
            (clone_file(&stderr, "stdout")?, stderr)
        } else if fd.stderr_to_stdout {
            if fd.stderr.is_some() {
                return Err(stdio_error(
                    "stderr cannot be set together with stderr_to_stdout".to_string(),
                ));
            }
            let stdout = open_output(fd.stdout.as_deref(), "stdout")?;
            let stderr = clone_file(&stdout, "stderr")?;
            (stdout, stderr)
        } else {
            (
                open_output(fd.stdout.as_deref(), "stdout")?,
                open_output(fd.stderr.as_deref(), "stderr")?,
            )
        };

        Ok(Self {
            stdin,
            stdout,
            stderr,
        })
    }

    pub fn fds(&self) -> StdioFds {
        StdioFds {
            stdin: self.stdin.as_raw_fd(),
            stdout: self.stdout.as_raw_fd(),
            stderr: self.stderr.as_raw_fd(),
        }
    }
}

fn stdio_error(reason: String) -> SandboxError {
    SandboxError::Launch(LaunchError::Stdio(reason))
}

fn open_output(path: Option<&Path>, name: &str) -> Result<File> {
    let Some(path) = path else {
        return OpenOptions::new()
            .write(true)
            .open("/dev/null")
            .map_err(|e| stdio_error(format!("cannot open /dev/null for {}: {}", name, e)));
    };

    let existed = path.exists();
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o664)
        .open(path)
        .map_err(|e| stdio_error(format!("cannot open {} {}: {}", name, path.display(), e)))?;

    // The umask may have narrowed the creation mode
    if !existed {
        fs::set_permissions(path, fs::Permissions::from_mode(0o664)).map_err(|e| {
            stdio_error(format!("cannot chmod {} {}: {}", name, path.display(), e))
        })?;
    }
    Ok(file)
}

fn clone_file(file: &File, name: &str) -> Result<File> {
    file.try_clone()
        .map_err(|e| stdio_error(format!("cannot duplicate {}: {}", name, e)))
}

/// Everything needed to start one sandbox
pub struct LaunchRequest<'a> {
    pub namespaces: NamespaceIsolation,
    pub exec: &'a ExecPlan,
    pub stdio: &'a StdioFiles,
    /// Attached to the proxy before the payload is forked
    pub cgroup: Option<&'a CgroupV2>,
}

/// A payload that passed execve
#[derive(Debug)]
pub struct SandboxProcess {
    pub proxy_pid: Pid,
    /// Host pid of the PID-namespace init
    pub payload_pid: Pid,
    /// When execve succeeded
    pub started: Instant,
    status: Option<BufReader<File>>,
    control: File,
    /// Set once the waiter has reaped the proxy; held while signalling it
    reaped: Arc<Mutex<bool>>,
}

impl SandboxProcess {
    /// Start the waiter thread. It reads the proxy's report, reaps the proxy
    /// and sends exactly one [`ExitEvent`].
    pub fn spawn_waiter(&mut self) -> Result<Receiver<ExitEvent>> {
        let status = self.status.take().ok_or_else(|| {
            SandboxError::Process("waiter already started for this sandbox".to_string())
        })?;
        let proxy_pid = self.proxy_pid;
        let reaped = Arc::clone(&self.reaped);
        let (tx, rx) = bounded(1);

        thread::Builder::new()
            .name(format!("runj-wait-{}", proxy_pid))
            .spawn(move || {
                let (payload, at) = read_finished(status);
                let proxy = reap_proxy(proxy_pid, &reaped);
                let _ = tx.send(ExitEvent { payload, proxy, at });
            })
            .map_err(|e| SandboxError::Process(format!("failed to spawn waiter: {}", e)))?;

        Ok(rx)
    }

    /// Ask the proxy to SIGKILL the payload. Fails once the proxy is gone.
    pub fn request_kill(&self) -> std::io::Result<()> {
        (&self.control).write_all(&[KILL_BYTE])
    }

    /// SIGKILL the proxy's process group, payload included, unless the
    /// proxy has already been reaped. Returns whether a signal was sent.
    pub fn kill_group(&self) -> bool {
        let reaped = match self.reaped.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *reaped {
            return false;
        }
        match nix::sys::signal::killpg(self.proxy_pid, Signal::SIGKILL) {
            Ok(()) => true,
            Err(_) => kill(self.proxy_pid, Signal::SIGKILL).is_ok(),
        }
    }
}

fn read_finished(status: BufReader<File>) -> (Option<(ExitOutcome, ResourceUsage)>, Instant) {
    let mut payload = None;
    let mut at = None;
    for line in status.lines() {
        let Ok(line) = line else { break };
        if let Ok(ProxyMessage::Finished { outcome, usage }) = serde_json::from_str(&line) {
            payload = Some((outcome, usage));
            at = Some(Instant::now());
        }
    }
    (payload, at.unwrap_or_else(Instant::now))
}

/// Wait for the proxy to exit without reaping it, then reap it under the
/// `reaped` lock so [`SandboxProcess::kill_group`] never targets a freed pid.
fn reap_proxy(proxy_pid: Pid, reaped: &Mutex<bool>) -> Option<ExitOutcome> {
    loop {
        // SAFETY: siginfo_t is plain old data and outlives the call.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: `info` is a live, writable siginfo_t.
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                proxy_pid.as_raw() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 || Errno::last() != Errno::EINTR {
            break;
        }
    }

    let mut guard = match reaped.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let outcome = wait_proxy(proxy_pid);
    *guard = true;
    outcome
}

fn wait_proxy(proxy_pid: Pid) -> Option<ExitOutcome> {
    loop {
        match waitpid(proxy_pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Some(ExitOutcome::Exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Some(ExitOutcome::Signaled(sig as i32)),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                log::error!("waitpid(proxy {}) failed: {}", proxy_pid, e);
                return None;
            }
        }
    }
}

/// Pipe ends owned by the proxy
struct ProxyChannels {
    ready: File,
    sync: File,
    error: File,
    status: File,
    control: File,
}

fn cloexec_pipe(name: &str) -> Result<(File, File)> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| {
        SandboxError::Launch(LaunchError::Spawn(format!("pipe({}) failed: {}", name, e)))
    })?;
    // SAFETY: both descriptors are fresh and owned by nothing else.
    Ok(unsafe { (File::from_raw_fd(read), File::from_raw_fd(write)) })
}

/// Start the sandbox and wait until the payload has passed execve.
///
/// Every failure after the proxy exists kills and reaps it before returning.
pub fn launch_sandbox(request: &LaunchRequest<'_>) -> Result<SandboxProcess> {
    let (mut ready_read, ready_write) = cloexec_pipe("ready")?;
    let (sync_read, mut sync_write) = cloexec_pipe("sync")?;
    let (mut error_read, error_write) = cloexec_pipe("error")?;
    let (status_read, status_write) = cloexec_pipe("status")?;
    let (control_read, control_write) = cloexec_pipe("control")?;
    let host_pid = getpid();
    let stdio = request.stdio.fds();

    // SAFETY: the child only runs the proxy routine and leaves through _exit.
    let proxy_pid = match unsafe { fork() } {
        Err(e) => {
            return Err(SandboxError::Launch(LaunchError::Spawn(format!(
                "fork(proxy) failed: {}",
                e
            ))))
        }
        Ok(ForkResult::Child) => {
            drop(ready_read);
            drop(sync_write);
            drop(error_read);
            drop(status_read);
            drop(control_write);
            let channels = ProxyChannels {
                ready: ready_write,
                sync: sync_read,
                error: error_write,
                status: status_write,
                control: control_read,
            };
            let code = panic::catch_unwind(AssertUnwindSafe(|| {
                run_proxy(request, stdio, host_pid, channels)
            }))
            .unwrap_or(PROXY_SETUP_EXIT);
            // SAFETY: no destructors or atexit handlers of the host may run here.
            unsafe { libc::_exit(code) }
        }
        Ok(ForkResult::Parent { child }) => child,
    };

    drop(ready_write);
    drop(sync_read);
    drop(error_write);
    drop(status_write);
    drop(control_read);
    log::debug!("Forked sandbox proxy {}", proxy_pid);

    let mut byte = [0u8; 1];
    if !matches!(ready_read.read(&mut byte), Ok(1)) {
        let failure = read_failure(&mut error_read);
        reap(proxy_pid);
        return Err(failure.map(SandboxError::from).unwrap_or_else(|| {
            SandboxError::Launch(LaunchError::Spawn(
                "sandbox proxy exited before creating namespaces".to_string(),
            ))
        }));
    }
    drop(ready_read);

    if request.namespaces.is_rootless() {
        if let Err(e) = IdMapping::current(request.exec.credentials.uid, request.exec.credentials.gid).write_for(proxy_pid) {
            abort_proxy(proxy_pid);
            return Err(e);
        }
    }

    if let Some(cgroup) = request.cgroup {
        if let Err(e) = cgroup.attach_process(proxy_pid.as_raw()) {
            abort_proxy(proxy_pid);
            return Err(e);
        }
    }

    if let Err(e) = sync_write.write_all(&[GO_BYTE]) {
        abort_proxy(proxy_pid);
        return Err(SandboxError::Launch(LaunchError::Spawn(format!(
            "cannot release sandbox proxy: {}",
            e
        ))));
    }
    drop(sync_write);

    let mut data = Vec::new();
    if let Err(e) = error_read.read_to_end(&mut data) {
        abort_proxy(proxy_pid);
        return Err(SandboxError::Io(e));
    }
    if !data.is_empty() {
        reap(proxy_pid);
        return Err(decode_failure(&data).into());
    }
    let started = Instant::now();

    let mut status = BufReader::new(status_read);
    let mut line = String::new();
    let spawned = status
        .read_line(&mut line)
        .ok()
        .and_then(|_| serde_json::from_str::<ProxyMessage>(line.trim()).ok());
    let payload_pid = match spawned {
        Some(ProxyMessage::Spawned { payload_pid }) => Pid::from_raw(payload_pid),
        _ => {
            abort_proxy(proxy_pid);
            return Err(SandboxError::Launch(LaunchError::Spawn(
                "sandbox proxy did not report the payload pid".to_string(),
            )));
        }
    };

    log::info!(
        "Sandbox started: proxy {} payload {} ({})",
        proxy_pid,
        payload_pid,
        request.namespaces.enabled_namespaces().join(", ")
    );

    Ok(SandboxProcess {
        proxy_pid,
        payload_pid,
        started,
        status: Some(status),
        control: control_write,
        reaped: Arc::new(Mutex::new(false)),
    })
}

fn read_failure(error: &mut File) -> Option<ChildFailure> {
    let mut data = Vec::new();
    error.read_to_end(&mut data).ok()?;
    if data.is_empty() {
        return None;
    }
    Some(decode_failure(&data))
}

fn decode_failure(data: &[u8]) -> ChildFailure {
    serde_json::from_slice(data).unwrap_or_else(|e| {
        ChildFailure::Launch(LaunchError::Setup(format!(
            "unreadable failure report from sandbox: {}",
            e
        )))
    })
}

/// Kill the proxy's process group (payload included) and reap the proxy.
fn abort_proxy(proxy_pid: Pid) {
    if nix::sys::signal::killpg(proxy_pid, Signal::SIGKILL).is_err() {
        let _ = kill(proxy_pid, Signal::SIGKILL);
    }
    reap(proxy_pid);
}

fn reap(pid: Pid) {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            _ => return,
        }
    }
}

fn report_failure(error: &mut File, failure: &ChildFailure) {
    if let Ok(payload) = serde_json::to_vec(failure) {
        let _ = error.write_all(&payload);
    }
}

fn write_message(status: &mut File, message: &ProxyMessage) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    status.write_all(&line)
}

/// Proxy body. Runs in the forked child; the return value is its exit code.
fn run_proxy(
    request: &LaunchRequest<'_>,
    stdio: StdioFds,
    host_pid: Pid,
    mut channels: ProxyChannels,
) -> i32 {
    let mut keep = [
        channels.ready.as_raw_fd(),
        channels.sync.as_raw_fd(),
        channels.error.as_raw_fd(),
        channels.status.as_raw_fd(),
        channels.control.as_raw_fd(),
        stdio.stdin,
        stdio.stdout,
        stdio.stderr,
    ];
    let _ = close_fds_except(&mut keep);

    if setup_parent_death_signal().is_err() || getppid() != host_pid {
        return PROXY_SETUP_EXIT;
    }
    let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));

    if let Err(e) = request.namespaces.unshare() {
        report_failure(&mut channels.error, &e.into());
        return PROXY_SETUP_EXIT;
    }

    if channels.ready.write_all(&[READY_BYTE]).is_err() {
        return PROXY_SETUP_EXIT;
    }
    drop(channels.ready);

    let mut go = [0u8; 1];
    if !matches!(channels.sync.read(&mut go), Ok(1)) || go[0] != GO_BYTE {
        return PROXY_SETUP_EXIT;
    }
    drop(channels.sync);

    // Cosmetic; the payload does not depend on it
    let _ = request.namespaces.set_hostname();

    // SAFETY: the payload runs the pre-exec chain and leaves through execve or _exit.
    match unsafe { fork() } {
        Err(e) => {
            let failure = LaunchError::Spawn(format!("fork(payload) failed: {}", e));
            report_failure(&mut channels.error, &failure.into());
            PROXY_SETUP_EXIT
        }
        Ok(ForkResult::Child) => {
            drop(channels.status);
            drop(channels.control);
            let failure = match run_payload(request.exec, stdio) {
                Ok(never) => match never {},
                Err(failure) => failure,
            };
            report_failure(&mut channels.error, &failure);
            // SAFETY: see the proxy fork above.
            unsafe { libc::_exit(PAYLOAD_SETUP_EXIT) }
        }
        Ok(ForkResult::Parent { child }) => {
            drop(channels.error);
            let _ = write_message(
                &mut channels.status,
                &ProxyMessage::Spawned {
                    payload_pid: child.as_raw(),
                },
            );

            match supervise_payload(child, channels.control) {
                Some((outcome, usage)) => {
                    let _ = write_message(
                        &mut channels.status,
                        &ProxyMessage::Finished { outcome, usage },
                    );
                    0
                }
                None => PROXY_SETUP_EXIT,
            }
        }
    }
}

fn run_payload(exec: &ExecPlan, stdio: StdioFds) -> std::result::Result<Infallible, ChildFailure> {
    let sandbox = Sandbox::<FreshChild>::new().confirm_namespaces()?;
    let sandbox = sandbox.harden_mount_propagation()?;
    let sandbox = sandbox.provision_root(&exec.plan)?;
    let sandbox = sandbox.enter_workdir(&exec.cwd)?;
    let sandbox = sandbox.apply_runtime_hygiene(stdio, &exec.rlimits)?;
    let sandbox = sandbox.drop_privileges(&exec.credentials, exec.new_session_keyring)?;
    Ok(sandbox.exec_payload(exec)?)
}

enum Reap {
    Running,
    Done(ExitOutcome, ResourceUsage),
    Failed,
}

/// Wait for the payload while serving kill requests from the host. The
/// payload is signalled only while it is still unreaped.
fn supervise_payload(child: Pid, control: File) -> Option<(ExitOutcome, ResourceUsage)> {
    let mut control = Some(control);
    // SAFETY: pidfd_open takes a pid and flags; the result is a new fd or -1.
    let pidfd = unsafe { libc::syscall(libc::SYS_pidfd_open, child.as_raw(), 0) } as RawFd;

    let result = loop {
        match wait_payload(child, libc::WNOHANG) {
            Reap::Running => {}
            Reap::Done(outcome, usage) => break Some((outcome, usage)),
            Reap::Failed => break None,
        }

        let mut fds = Vec::with_capacity(2);
        if let Some(control) = &control {
            fds.push(libc::pollfd {
                fd: control.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
        }
        if pidfd >= 0 {
            fds.push(libc::pollfd {
                fd: pidfd,
                events: libc::POLLIN,
                revents: 0,
            });
        }
        let timeout = if pidfd >= 0 { -1 } else { REAP_POLL_MS };
        // SAFETY: `fds` holds initialized pollfd entries for its whole length.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if ready <= 0 {
            continue;
        }

        let Some(pipe) = control.as_mut() else {
            continue;
        };
        if fds[0].revents == 0 {
            continue;
        }
        let mut byte = [0u8; 1];
        match pipe.read(&mut byte) {
            Ok(1) if byte[0] == KILL_BYTE => {
                let _ = kill(child, Signal::SIGKILL);
            }
            Ok(1) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            // Host closed its end
            _ => control = None,
        }
    };

    if pidfd >= 0 {
        // SAFETY: pidfd is owned here and closed once.
        unsafe { libc::close(pidfd) };
    }
    result
}

/// wait4 on the payload, keeping its rusage
fn wait_payload(pid: Pid, flags: libc::c_int) -> Reap {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain old data.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };

    loop {
        // SAFETY: both out-pointers reference live locals.
        let rc = unsafe { libc::wait4(pid.as_raw(), &mut status, flags, &mut usage) };
        if rc == pid.as_raw() {
            break;
        }
        if rc == 0 {
            return Reap::Running;
        }
        if rc < 0 && Errno::last() == Errno::EINTR {
            continue;
        }
        return Reap::Failed;
    }

    if libc::WIFEXITED(status) {
        Reap::Done(
            ExitOutcome::Exited(libc::WEXITSTATUS(status)),
            usage_from_rusage(&usage),
        )
    } else if libc::WIFSIGNALED(status) {
        Reap::Done(
            ExitOutcome::Signaled(libc::WTERMSIG(status)),
            usage_from_rusage(&usage),
        )
    } else {
        Reap::Running
    }
}

fn usage_from_rusage(usage: &libc::rusage) -> ResourceUsage {
    let millis = |tv: libc::timeval| tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
    ResourceUsage {
        user_ms: millis(usage.ru_utime),
        sys_ms: millis(usage.ru_stime),
        // Linux reports ru_maxrss in KiB
        max_rss_kib: usage.ru_maxrss.max(0) as u64,
    }
}
