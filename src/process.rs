//! Data structures for tracking unit state.
//!
//! This module defines the lifecycle states of a unit (`UnitState`), how a process
//! exit is described (`ExitOutcome`) and classified (`ExitClass`), and the
//! point-in-time status snapshot (`UnitStatus`) handed out to callers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// The current lifecycle state of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// No process and nothing scheduled.
    Stopped,
    /// A process is being launched.
    Starting,
    /// The process is up.
    Running,
    /// A stop was requested; waiting for the process to go away.
    Stopping,
    /// The process exited unexpectedly. Transient: always followed by
    /// `RestartPending` or `Stopped`.
    Crashed,
    /// Waiting out the backoff delay before the next launch.
    RestartPending,
}

impl UnitState {
    /// Whether a process handle is attached in this state.
    pub fn has_process(self) -> bool {
        matches!(
            self,
            UnitState::Starting | UnitState::Running | UnitState::Stopping
        )
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UnitState::Stopped => "stopped",
            UnitState::Starting => "starting",
            UnitState::Running => "running",
            UnitState::Stopping => "stopping",
            UnitState::Crashed => "crashed",
            UnitState::RestartPending => "restart pending",
        };
        f.write_str(label)
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ExitOutcome {
    /// Exit code, when the process exited on its own.
    pub code: Option<i32>,
    /// Terminating signal number (unix only).
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

/// Classification of a process exit, decided by the unit state at the time of exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitClass {
    /// The supervisor asked the process to stop.
    Intentional,
    /// The script finished with an expected exit code.
    Completed,
    /// Unexpected exit: drives the auto-restart policy.
    Crash,
}

/// The signal a graceful stop sends to a unit's process group.
#[cfg(unix)]
pub const STOP_SIGNAL: Option<i32> = Some(libc::SIGTERM);
#[cfg(not(unix))]
pub const STOP_SIGNAL: Option<i32> = None;

/// Classifies an exit observed while the unit was in `state`.
///
/// Exits while `Stopping` are always intentional. Otherwise an exit code listed in
/// `expected_codes` is a normal completion, and so is death by [`STOP_SIGNAL`] sent
/// from outside. Any other code or signal is a crash.
pub fn classify_exit(state: UnitState, outcome: ExitOutcome, expected_codes: &[i32]) -> ExitClass {
    if state == UnitState::Stopping {
        return ExitClass::Intentional;
    }
    match (outcome.code, outcome.signal) {
        (Some(code), _) if expected_codes.contains(&code) => ExitClass::Completed,
        (None, Some(signal)) if STOP_SIGNAL == Some(signal) => ExitClass::Completed,
        _ => ExitClass::Crash,
    }
}

/// Point-in-time view of a unit.
#[derive(Debug, Clone, Serialize)]
pub struct UnitStatus {
    pub name: String,
    pub state: UnitState,
    /// Process ID (if running).
    pub pid: Option<u32>,
    /// Time when the current (or last) run started.
    pub started_at: Option<DateTime<Utc>>,
    /// How the last run ended.
    pub last_exit: Option<ExitOutcome>,
    /// Consecutive crashes in the current streak.
    pub restart_attempts: u32,
    /// Last launch failure, if the most recent start did not succeed.
    pub last_error: Option<String>,
    /// Problems found when the configuration was validated.
    pub issues: Vec<String>,
    /// Set when the on-disk history could not be written.
    pub history_degraded: Option<String>,
}

impl UnitStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: UnitState::Stopped,
            pid: None,
            started_at: None,
            last_exit: None,
            restart_attempts: 0,
            last_error: None,
            issues: Vec::new(),
            history_degraded: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> ExitOutcome {
        ExitOutcome {
            code: Some(code),
            signal: None,
        }
    }

    #[test]
    fn exit_while_stopping_is_intentional() {
        let killed = ExitOutcome {
            code: None,
            signal: Some(9),
        };
        assert_eq!(
            classify_exit(UnitState::Stopping, killed, &[0]),
            ExitClass::Intentional
        );
        assert_eq!(
            classify_exit(UnitState::Stopping, exited(1), &[0]),
            ExitClass::Intentional
        );
    }

    #[test]
    fn expected_codes_complete_and_others_crash() {
        assert_eq!(
            classify_exit(UnitState::Running, exited(0), &[0]),
            ExitClass::Completed
        );
        assert_eq!(
            classify_exit(UnitState::Running, exited(2), &[0, 2]),
            ExitClass::Completed
        );
        assert_eq!(
            classify_exit(UnitState::Running, exited(1), &[0]),
            ExitClass::Crash
        );
        let signalled = ExitOutcome {
            code: None,
            signal: Some(11),
        };
        assert_eq!(
            classify_exit(UnitState::Running, signalled, &[0]),
            ExitClass::Crash
        );
    }

    #[cfg(unix)]
    #[test]
    fn stop_signal_is_not_a_crash() {
        let terminated = ExitOutcome {
            code: None,
            signal: Some(libc::SIGTERM),
        };
        assert_eq!(
            classify_exit(UnitState::Running, terminated, &[0]),
            ExitClass::Completed
        );
        let killed = ExitOutcome {
            code: None,
            signal: Some(libc::SIGKILL),
        };
        assert_eq!(
            classify_exit(UnitState::Running, killed, &[0]),
            ExitClass::Crash
        );
    }

    #[test]
    fn only_active_states_hold_a_process() {
        assert!(UnitState::Running.has_process());
        assert!(UnitState::Stopping.has_process());
        assert!(!UnitState::RestartPending.has_process());
        assert!(!UnitState::Crashed.has_process());
    }
}
