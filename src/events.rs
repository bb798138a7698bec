//! Outbound supervisor events.
//!
//! Units report every state transition, exit classification and restart decision as
//! a [`SupervisorEvent`] on a shared [`Bus`]. Collaborators (a GUI, the CLI) subscribe
//! to the bus instead of polling unit status.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::process::{ExitClass, ExitOutcome, UnitState};

/// An event published by a unit supervisor.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisorEvent {
    /// The unit moved from one state to another.
    StateChanged {
        unit: String,
        from: UnitState,
        to: UnitState,
    },
    /// A process was launched.
    Spawned { unit: String, pid: u32 },
    /// The unit's process exited and the exit was classified.
    Exited {
        unit: String,
        outcome: ExitOutcome,
        class: ExitClass,
    },
    /// A relaunch was scheduled after a crash.
    RestartScheduled {
        unit: String,
        attempt: u32,
        max: u32,
        #[serde(with = "duration_ms")]
        delay: Duration,
    },
    /// Restart attempts are exhausted; the unit stays stopped until started by hand.
    TerminalFailure {
        unit: String,
        attempts: u32,
        last_exit: Option<ExitOutcome>,
    },
    /// A launch failed before a process existed.
    SpawnFailed { unit: String, error: String },
}

impl SupervisorEvent {
    pub fn unit(&self) -> &str {
        match self {
            SupervisorEvent::StateChanged { unit, .. }
            | SupervisorEvent::Spawned { unit, .. }
            | SupervisorEvent::Exited { unit, .. }
            | SupervisorEvent::RestartScheduled { unit, .. }
            | SupervisorEvent::TerminalFailure { unit, .. }
            | SupervisorEvent::SpawnFailed { unit, .. } => unit,
        }
    }
}

/// Broadcast channel for supervisor events.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<SupervisorEvent>,
}

impl Bus {
    /// Creates a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to all subscribers. Dropped when nobody listens.
    pub fn publish(&self, event: SupervisorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
