/// Outcome classification
/// Deterministic mapping from one termination cause to `{status, exit_code}`
use crate::config::types::ExecutionStatus;
use nix::sys::signal::Signal;

/// `command[0]` could not be executed inside the sandbox
pub const EXEC_FAILED_EXIT_CODE: i64 = 1;
/// The deadline fired and the sandbox was killed
pub const TIMEOUT_EXIT_CODE: i64 = -256;
/// The run failed before a payload process existed
pub const SETUP_ERROR_EXIT_CODE: i64 = -257;
/// The caller cancelled the run
pub const CANCELLED_EXIT_CODE: i64 = -258;

/// The single cause that ended a run
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    /// Killed by a signal the enforcer did not send
    Signaled(i32),
    TimedOut,
    Cancelled,
    ExecFailed(String),
    SetupFailed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub status: ExecutionStatus,
    pub exit_code: i64,
    pub signal: Option<String>,
    pub error: Option<String>,
}

/// Pure function over [`Termination`]
pub struct OutcomeClassifier;

impl OutcomeClassifier {
    pub fn classify(termination: &Termination) -> Verdict {
        match termination {
            Termination::Exited(0) => Self::verdict(ExecutionStatus::Ok, 0),
            Termination::Exited(code) => {
                Self::verdict(ExecutionStatus::RuntimeError, i64::from(*code))
            }
            Termination::Signaled(signo) => Verdict {
                signal: Some(signal_name(*signo)),
                ..Self::verdict(ExecutionStatus::RuntimeError, -i64::from(*signo))
            },
            Termination::TimedOut => Verdict {
                signal: Some(signal_name(libc::SIGKILL)),
                ..Self::verdict(ExecutionStatus::Timeout, TIMEOUT_EXIT_CODE)
            },
            Termination::Cancelled => Verdict {
                error: Some("cancelled by caller".to_string()),
                ..Self::verdict(ExecutionStatus::RuntimeError, CANCELLED_EXIT_CODE)
            },
            Termination::ExecFailed(reason) => Verdict {
                error: Some(reason.clone()),
                ..Self::verdict(ExecutionStatus::RuntimeError, EXEC_FAILED_EXIT_CODE)
            },
            Termination::SetupFailed(reason) => Verdict {
                error: Some(reason.clone()),
                ..Self::verdict(ExecutionStatus::SetupError, SETUP_ERROR_EXIT_CODE)
            },
        }
    }

    fn verdict(status: ExecutionStatus, exit_code: i64) -> Verdict {
        Verdict {
            status,
            exit_code,
            signal: None,
            error: None,
        }
    }
}

/// `SIGKILL`-style name, `SIG<n>` for numbers nix does not know
pub fn signal_name(signo: i32) -> String {
    Signal::try_from(signo)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{}", signo))
}
