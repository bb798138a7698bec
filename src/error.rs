//! Error types raised by the supervision engine.
//!
//! - [`SpawnError`]: the OS process for a run could not be created.
//! - [`StoreError`]: log persistence failed.
//! - [`SupervisorError`]: a command against a unit or the registry was rejected.
//!
//! Every unit-scoped error names the unit and, where relevant, the state it was in,
//! so callers can report failures without digging through a backtrace.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::process::UnitState;

/// Failure to create the OS process for one run of a unit.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("interpreter not found: {}", path.display())]
    InterpreterNotFound { path: PathBuf },
    #[error("script not found: {}", path.display())]
    ScriptNotFound { path: PathBuf },
    #[error("working directory not found: {}", path.display())]
    WorkingDirNotFound { path: PathBuf },
    #[error("permission denied launching {}", path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SpawnError {
    pub(crate) fn from_io(path: PathBuf, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => SpawnError::InterpreterNotFound { path },
            io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied { path, source },
            _ => SpawnError::Io { path, source },
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            SpawnError::InterpreterNotFound { .. } => "spawn_interpreter_not_found",
            SpawnError::ScriptNotFound { .. } => "spawn_script_not_found",
            SpawnError::WorkingDirNotFound { .. } => "spawn_cwd_not_found",
            SpawnError::PermissionDenied { .. } => "spawn_permission_denied",
            SpawnError::Io { .. } => "spawn_io",
        }
    }
}

/// Failure to persist or read a unit's log history.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("log directory {} is unavailable: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("log history for `{unit}` failed: {source}")]
    Io {
        unit: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid search pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("no log for `{unit}`: {reason}")]
    InvalidName { unit: String, reason: String },
}

impl StoreError {
    pub fn as_label(&self) -> &'static str {
        match self {
            StoreError::Directory { .. } => "store_directory",
            StoreError::Io { .. } => "store_io",
            StoreError::Pattern(_) => "store_pattern",
            StoreError::InvalidName { .. } => "store_invalid_name",
        }
    }
}

/// Errors returned by unit and registry commands.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The run could not be launched. Terminal for that attempt.
    #[error("unit `{unit}` failed to start ({state}): {source}")]
    Spawn {
        unit: String,
        state: UnitState,
        #[source]
        source: SpawnError,
    },
    /// `start` was requested on a unit that is not stopped.
    #[error("unit `{unit}` is already active ({state})")]
    AlreadyRunning { unit: String, state: UnitState },
    /// `stop` was requested on a unit with nothing to stop.
    #[error("unit `{unit}` is not running ({state})")]
    NotRunning { unit: String, state: UnitState },
    /// A structural change was attempted on a unit that is not stopped.
    #[error("unit `{unit}` must be stopped first ({state})")]
    UnitBusy { unit: String, state: UnitState },
    #[error("unknown unit `{unit}`")]
    UnknownUnit { unit: String },
    #[error("unit `{unit}` already exists")]
    DuplicateUnit { unit: String },
    #[error("invalid unit name `{unit}`: {reason}")]
    InvalidName { unit: String, reason: String },
    /// The unit's actor has already shut down.
    #[error("unit `{unit}` supervisor is gone")]
    Unavailable { unit: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SupervisorError {
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorError::Spawn { .. } => "spawn_error",
            SupervisorError::AlreadyRunning { .. } => "already_running",
            SupervisorError::NotRunning { .. } => "not_running",
            SupervisorError::UnitBusy { .. } => "unit_busy",
            SupervisorError::UnknownUnit { .. } => "unknown_unit",
            SupervisorError::DuplicateUnit { .. } => "duplicate_unit",
            SupervisorError::InvalidName { .. } => "invalid_name",
            SupervisorError::Unavailable { .. } => "unit_unavailable",
            SupervisorError::Store(_) => "store_error",
        }
    }

    /// The unit this error concerns, if it is unit-scoped.
    pub fn unit(&self) -> Option<&str> {
        match self {
            SupervisorError::Spawn { unit, .. }
            | SupervisorError::AlreadyRunning { unit, .. }
            | SupervisorError::NotRunning { unit, .. }
            | SupervisorError::UnitBusy { unit, .. }
            | SupervisorError::UnknownUnit { unit }
            | SupervisorError::DuplicateUnit { unit }
            | SupervisorError::InvalidName { unit, .. }
            | SupervisorError::Unavailable { unit } => Some(unit),
            SupervisorError::Store(StoreError::Io { unit, .. })
            | SupervisorError::Store(StoreError::InvalidName { unit, .. }) => Some(unit),
            SupervisorError::Store(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_unit_and_state() {
        let err = SupervisorError::UnitBusy {
            unit: "bot".into(),
            state: UnitState::Running,
        };
        assert_eq!(err.to_string(), "unit `bot` must be stopped first (running)");
        assert_eq!(err.as_label(), "unit_busy");
        assert_eq!(err.unit(), Some("bot"));
    }

    #[test]
    fn io_errors_map_to_spawn_variants() {
        let missing = SpawnError::from_io(
            PathBuf::from("/nope/python"),
            io::Error::from(io::ErrorKind::NotFound),
        );
        assert!(matches!(missing, SpawnError::InterpreterNotFound { .. }));
        let denied = SpawnError::from_io(
            PathBuf::from("/root/python"),
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert_eq!(denied.as_label(), "spawn_permission_denied");
    }
}
