use crate::config::types::ABNORMAL_EXIT;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

/// How a reaped child ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildStatus {
    Exited(i32),
    Signaled(i32),
    /// Stopped, continued or otherwise not a normal exit
    Other,
}

impl ChildStatus {
    pub fn outcome(self) -> SessionOutcome {
        match self {
            ChildStatus::Exited(code) => SessionOutcome::Exited(code),
            _ => SessionOutcome::Abnormal,
        }
    }
}

impl Default for ChildStatus {
    fn default() -> Self {
        ChildStatus::Exited(0)
    }
}

/// The one process the supervisor is currently following
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitoredProcess {
    Active(Pid),
    Ended(ChildStatus),
}

/// Session result as seen by the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOutcome {
    Exited(i32),
    Abnormal,
}

impl SessionOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            SessionOutcome::Exited(code) => code,
            SessionOutcome::Abnormal => ABNORMAL_EXIT,
        }
    }
}

/// Why the supervisor loop returned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisionEnd {
    /// No eligible process left; carries the last reaped status
    Completed(ChildStatus),
    /// Wall-clock limit hit, everything was killed
    TimedOut,
    /// Shutdown requested by this signal
    Shutdown(i32),
}

impl SupervisionEnd {
    /// Exit status of the sandbox init.
    pub fn exit_code(self) -> i32 {
        match self {
            SupervisionEnd::Completed(status) => status.outcome().exit_code(),
            SupervisionEnd::TimedOut => 1,
            SupervisionEnd::Shutdown(sig) => sig,
        }
    }
}
