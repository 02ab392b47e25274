//! Crash classification for worker processes.
//!
//! A worker that goes silent is reaped and its wait status is turned into a
//! human-readable termination reason. Worker death is always fatal for the
//! pool; classification only serves the error message.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
    /// SIGKILL without the pool asking for it, usually the OOM killer.
    OutOfMemory,
    /// Process has not terminated.
    StillAlive,
    /// Could not determine the reason.
    Unknown,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(sig) => write!(f, "killed by signal {sig:?}"),
            Self::OutOfMemory => write!(f, "killed (SIGKILL, possibly the OOM killer)"),
            Self::StillAlive => write!(f, "still running"),
            Self::Unknown => write!(f, "unknown reason"),
        }
    }
}

/// Classify a `WaitStatus` from `waitpid`.
pub(crate) fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, Signal::SIGKILL, _) => TerminationReason::OutOfMemory,
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}
