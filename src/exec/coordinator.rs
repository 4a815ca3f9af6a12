//! Execution coordinator
//!
//! Drives one run through `Init → Mounting → Launching → Running →
//! Terminated → CleanedUp`. Termination is observed at a single `select`
//! over the waiter thread, the deadline and caller cancellation. Cleanup
//! runs on every path.

use crate::config::types::{ExecutionReport, LaunchError, RunConfig, SandboxError};
use crate::exec::enforcer::{LimitEnforcer, KILL_GRACE};
use crate::exec::launcher::{
    launch_sandbox, ExitEvent, ExitOutcome, LaunchRequest, SandboxProcess, StdioFiles,
};
use crate::exec::preexec::ExecPlan;
use crate::kernel::cgroup::{CgroupEvidence, CgroupV2};
use crate::kernel::mount::MountPlan;
use crate::kernel::namespace::NamespaceIsolation;
use crate::safety::cleanup::{CleanupManager, ResourceType};
use crate::safety::workspace::{default_base_dir, Workspace};
use crate::verdict::{OutcomeClassifier, Termination};
use crossbeam_channel::{bounded, never, select, Receiver, Sender};
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Init,
    Mounting,
    Launching,
    Running,
    Terminated,
    CleanedUp,
}

/// Caller side of run cancellation. Cloneable; cancelling twice is harmless.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Sender<()>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Coordinator side of run cancellation
#[derive(Debug)]
pub struct CancelSignal {
    rx: Receiver<()>,
}

impl CancelSignal {
    /// A signal nobody can fire
    pub fn never() -> Self {
        Self { rx: never() }
    }

    fn is_cancelled(&self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = bounded(1);
    (CancelHandle { tx }, CancelSignal { rx })
}

/// What woke the coordinator's wait point
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Wake {
    Exit,
    Deadline,
    Cancel,
}

/// Per-run state owned by the coordinator
struct SandboxContext {
    state: RunState,
    cgroup: Option<CgroupV2>,
    cleanup: CleanupManager,
}

impl SandboxContext {
    fn new() -> Self {
        Self {
            state: RunState::Init,
            cgroup: None,
            cleanup: CleanupManager::new(),
        }
    }

    fn enter(&mut self, state: RunState) {
        log::debug!("Run state {:?} -> {:?}", self.state, state);
        self.state = state;
    }
}

/// Everything the wait point learned about the payload
struct Observed {
    termination: Termination,
    event: Option<ExitEvent>,
    started: Instant,
}

pub struct ExecutionCoordinator {
    config: RunConfig,
    enforcer: LimitEnforcer,
}

impl ExecutionCoordinator {
    pub fn new(config: RunConfig) -> Self {
        let enforcer = LimitEnforcer::new(&config.limits);
        Self { config, enforcer }
    }

    /// Execute the run and produce its report. Never fails: setup problems
    /// become `SETUP_ERROR` reports, and a teardown that left resources
    /// behind is noted in the report's `error`.
    pub fn run(&self, cancel: &CancelSignal) -> ExecutionReport {
        let mut ctx = SandboxContext::new();
        let outcome = self.execute(&mut ctx, cancel);

        // Evidence must be read before the cgroup is removed
        let evidence = ctx.cgroup.as_ref().map(CgroupV2::collect_evidence);
        let cleanup = ctx.cleanup.cleanup_all();
        ctx.enter(RunState::CleanedUp);

        let mut report = match outcome {
            Ok(observed) => build_report(&observed, evidence.as_ref()),
            Err(termination) => setup_report(&termination),
        };
        if let Err(e) = cleanup {
            log::error!("Run cleanup incomplete: {}", e);
            note_cleanup_failure(&mut report, &e);
        }

        log::info!(
            "Run finished: {} exit_code={} wall={}ms",
            report.status,
            report.exit_code,
            report.wall_time_ms
        );
        report
    }

    fn execute(
        &self,
        ctx: &mut SandboxContext,
        cancel: &CancelSignal,
    ) -> std::result::Result<Observed, Termination> {
        ctx.enter(RunState::Mounting);
        let base_dir = self
            .config
            .workspace_dir
            .clone()
            .unwrap_or_else(default_base_dir);
        let workspace = Workspace::create_in(&base_dir).map_err(setup_failed)?;
        ctx.cleanup.record(
            ResourceType::Workspace,
            workspace.run_id().to_string(),
            Some(workspace.run_dir().to_path_buf()),
        );
        let plan = MountPlan::resolve(&self.config, workspace.rootfs(), workspace.scratch())
            .map_err(|e| setup_failed(e.into()))?;

        if self.config.needs_cgroup() {
            let cgroup = self.create_cgroup(workspace.run_id())?;
            ctx.cleanup.record(
                ResourceType::Cgroup,
                workspace.run_id().to_string(),
                Some(cgroup.path().to_path_buf()),
            );
            cgroup.apply_limits(&self.config.limits).map_err(setup_failed)?;
            ctx.cgroup = Some(cgroup);
        }

        ctx.enter(RunState::Launching);
        let exec = ExecPlan::prepare(&self.config, plan).map_err(|e| setup_failed(e.into()))?;
        let stdio = StdioFiles::open(self.config.fd.as_ref()).map_err(setup_failed)?;
        if cancel.is_cancelled() {
            return Err(Termination::Cancelled);
        }

        let request = LaunchRequest {
            namespaces: NamespaceIsolation::new(self.config.rootless),
            exec: &exec,
            stdio: &stdio,
            cgroup: ctx.cgroup.as_ref(),
        };
        let mut process = launch_sandbox(&request).map_err(launch_failed)?;
        drop(stdio);
        let proxy_id = process.proxy_pid.to_string();
        ctx.cleanup.record(ResourceType::Process, proxy_id.clone(), None);

        ctx.enter(RunState::Running);
        let exit_rx = process.spawn_waiter().map_err(setup_failed)?;
        let deadline = self.enforcer.arm();
        let (wake, event) = self.wait(&process, &exit_rx, &deadline, cancel);
        ctx.enter(RunState::Terminated);

        // The waiter reaped the proxy or lost it; its pid is no longer ours
        if event.is_some() {
            ctx.cleanup.release(ResourceType::Process, &proxy_id);
        }

        Ok(Observed {
            termination: settle(wake, event.as_ref()),
            event,
            started: process.started,
        })
    }

    fn create_cgroup(&self, run_id: &str) -> std::result::Result<CgroupV2, Termination> {
        if !CgroupV2::is_available() {
            return Err(Termination::SetupFailed(
                "memory, pids and cpu limits need cgroup v2, which is not available".to_string(),
            ));
        }
        CgroupV2::create(&self.config.cgroup_parent(), run_id).map_err(setup_failed)
    }

    /// The single wait point.
    ///
    /// On deadline or cancellation a payload that already finished wins.
    /// Otherwise the init is killed and the proxy gets [`KILL_GRACE`] to
    /// report before its whole group is killed.
    fn wait(
        &self,
        process: &SandboxProcess,
        exit_rx: &Receiver<ExitEvent>,
        deadline: &Receiver<Instant>,
        cancel: &CancelSignal,
    ) -> (Wake, Option<ExitEvent>) {
        let closed = never();
        let mut cancel_open = true;
        let wake = loop {
            let cancel_rx = if cancel_open { &cancel.rx } else { &closed };
            select! {
                recv(exit_rx) -> event => return (Wake::Exit, event.ok()),
                recv(deadline) -> _ => break Wake::Deadline,
                recv(cancel_rx) -> msg => match msg {
                    Ok(()) => break Wake::Cancel,
                    // Every handle dropped: cancellation can no longer happen
                    Err(_) => cancel_open = false,
                },
            }
        };

        if let Ok(event) = exit_rx.try_recv() {
            return (Wake::Exit, Some(event));
        }

        log::info!("{:?}: killing sandbox {}", wake, process.payload_pid);
        self.enforcer.terminate(process);
        let event = match exit_rx.recv_timeout(KILL_GRACE) {
            Ok(event) => Some(event),
            Err(_) => {
                self.enforcer.escalate(process);
                exit_rx.recv().ok()
            }
        };
        (wake, event)
    }
}

/// Map the wake reason and the payload's reported end to one termination.
///
/// A forced kill only counts when the payload actually died of SIGKILL (or
/// nothing was reported); an exit that raced the kill keeps its own status.
fn settle(wake: Wake, event: Option<&ExitEvent>) -> Termination {
    let payload = event.and_then(|e| e.payload).map(|(outcome, _)| outcome);
    let forced = match wake {
        Wake::Exit => None,
        Wake::Deadline => Some(Termination::TimedOut),
        Wake::Cancel => Some(Termination::Cancelled),
    };

    match (payload, forced) {
        (Some(ExitOutcome::Signaled(libc::SIGKILL)) | None, Some(forced)) => forced,
        (Some(ExitOutcome::Exited(code)), _) => Termination::Exited(code),
        (Some(ExitOutcome::Signaled(signo)), _) => Termination::Signaled(signo),
        (None, None) => Termination::SetupFailed(format!(
            "sandbox proxy ended ({:?}) without reporting the payload status",
            event.and_then(|e| e.proxy)
        )),
    }
}

/// Append a teardown failure to the report without changing its verdict.
fn note_cleanup_failure(report: &mut ExecutionReport, err: &SandboxError) {
    let note = format!("cleanup incomplete: {}", err);
    report.error = Some(match report.error.take() {
        Some(error) => format!("{}; {}", error, note),
        None => note,
    });
}

fn setup_failed(err: SandboxError) -> Termination {
    Termination::SetupFailed(err.to_string())
}

/// Exec failures are the program's fault, everything else is setup
fn launch_failed(err: SandboxError) -> Termination {
    match err {
        SandboxError::Launch(LaunchError::Exec { command, reason, .. }) => {
            Termination::ExecFailed(format!("cannot execute {}: {}", command, reason))
        }
        other => setup_failed(other),
    }
}

fn setup_report(termination: &Termination) -> ExecutionReport {
    let verdict = OutcomeClassifier::classify(termination);
    ExecutionReport {
        status: verdict.status,
        exit_code: verdict.exit_code,
        signal: verdict.signal,
        wall_time_ms: 0,
        cpu_user_time_ms: 0,
        cpu_kernel_time_ms: 0,
        memory_usage_kib: 0,
        memory_limit_exceeded: false,
        error: verdict.error,
    }
}

fn build_report(observed: &Observed, evidence: Option<&CgroupEvidence>) -> ExecutionReport {
    let verdict = OutcomeClassifier::classify(&observed.termination);
    let usage = observed
        .event
        .and_then(|e| e.payload)
        .map(|(_, usage)| usage)
        .unwrap_or_default();
    let ended = observed.event.map(|e| e.at).unwrap_or_else(Instant::now);

    let memory_usage_kib = evidence
        .and_then(|e| e.memory_peak_bytes)
        .map(|bytes| bytes / 1024)
        .unwrap_or(usage.max_rss_kib);
    let memory_limit_exceeded = matches!(observed.termination, Termination::Signaled(_))
        && evidence.map_or(false, CgroupEvidence::oom_killed);

    ExecutionReport {
        status: verdict.status,
        exit_code: verdict.exit_code,
        signal: verdict.signal,
        wall_time_ms: ended.saturating_duration_since(observed.started).as_millis() as u64,
        cpu_user_time_ms: usage.user_ms,
        cpu_kernel_time_ms: usage.sys_ms,
        memory_usage_kib,
        memory_limit_exceeded,
        error: verdict.error,
    }
}
