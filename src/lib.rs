//! Scriptrack: a local supervisor for long-running scripts.
//!
//! A workspace (`scriptrack.toml`) lists units: an interpreter, a script, a
//! working directory and arguments. The [`Registry`] launches each unit as an OS
//! process, decodes its ANSI-colored output into persistent per-unit logs, applies
//! the unit's auto-restart policy when it crashes and samples its CPU and memory
//! usage.

pub mod ansi;
pub mod config;
pub mod error;
pub mod events;
pub mod handle;
pub mod output;
pub mod process;
pub mod registry;
pub mod sampler;
pub mod store;
pub mod unit;

pub use config::{load_workspace, save_workspace, BackoffPolicy, UnitConfig, Workspace};
pub use error::{SpawnError, StoreError, SupervisorError};
pub use events::SupervisorEvent;
pub use output::{LogEvent, Segment, StreamKind};
pub use process::{ExitClass, ExitOutcome, UnitState, UnitStatus};
pub use registry::{BatchReport, LogMode, LogSubscription, Registry};
pub use sampler::{Metrics, ResourceSample};
pub use store::{SearchMode, SearchQuery};
