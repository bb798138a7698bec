//! The set of supervised units.
//!
//! The [`Registry`] owns one [`UnitSupervisor`] per configured unit together with
//! the services they share: the log store, the event bus and the resource sampler.
//! The unit list sits behind a lock that is only held to look units up or edit the
//! list, never while a unit works through a command, so one unit waiting out its
//! stop grace period cannot hold up the others. When the registry was opened from a
//! workspace file, every structural change is written back to it.

use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::{self, UnitConfig, Workspace, WorkspaceSettings};
use crate::error::SupervisorError;
use crate::events::{Bus, SupervisorEvent};
use crate::output::LogEvent;
use crate::process::{UnitState, UnitStatus};
use crate::sampler::{PidTable, ResourceSample, ResourceSampler, SamplerHandle, SysinfoSource};
use crate::store::{LogStore, LogTail, SearchMode, SearchQuery, SearchResults, StoreSettings, UnitLog};
use crate::unit::{UnitContext, UnitSupervisor};

const EVENT_CAPACITY: usize = 1024;

/// How a log subscription should read a unit's output.
#[derive(Debug, Clone)]
pub enum LogMode {
    /// Replay from `from` (a sequence number) and keep following.
    Live { from: u64 },
    /// A fixed range of stored events.
    History { range: Range<u64> },
    /// Matching events, either from history or as they arrive.
    Search { query: SearchQuery, follow: bool },
}

pub enum LogSubscription {
    Live(LogTail),
    History(Vec<LogEvent>),
    Search(SearchResults),
}

/// Outcome of a batch command across all units.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    /// Units the command did not apply to (already running for a start, already
    /// stopped for a stop).
    pub skipped: Vec<String>,
    pub failed: Vec<SupervisorError>,
}

impl BatchReport {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} skipped, {} failed",
            self.succeeded.len(),
            self.skipped.len(),
            self.failed.len()
        )?;
        for err in &self.failed {
            write!(f, "\n  {}", err)?;
        }
        Ok(())
    }
}

struct UnitEntry {
    config: UnitConfig,
    supervisor: Arc<UnitSupervisor>,
}

pub struct Registry {
    path: Option<PathBuf>,
    template: Workspace,
    ctx: UnitContext,
    units: RwLock<Vec<UnitEntry>>,
    sampler: Mutex<SamplerHandle>,
}

impl Registry {
    /// Loads the workspace at `path` and supervises its units. Nothing is started.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let workspace = config::load_workspace(path)?;
        Self::new(workspace, Some(path.to_path_buf()))
            .with_context(|| format!("failed to open workspace {}", path.display()))
    }

    /// Builds a registry over `workspace`. With a `path`, structural changes are
    /// saved back to that file.
    ///
    /// Must be called from within a tokio runtime. Fails if a unit name is not a
    /// safe file name or the log directory cannot be created.
    pub fn new(mut workspace: Workspace, path: Option<PathBuf>) -> Result<Self, SupervisorError> {
        for unit in &workspace.units {
            check_name(&unit.name)?;
        }
        let settings = workspace.settings();
        let store = LogStore::open(StoreSettings {
            dir: settings.log_dir.clone(),
            max_bytes: settings.max_log_bytes,
            max_lines: settings.max_lines,
        })?;
        let pids = PidTable::default();
        let sampler = ResourceSampler::new(SysinfoSource::new(), pids.clone(), settings.sample_window)
            .spawn(settings.sample_interval);
        let ctx = UnitContext {
            settings,
            store: Arc::new(store),
            bus: Bus::new(EVENT_CAPACITY),
            pids,
        };

        let configs = std::mem::take(&mut workspace.units);
        let mut units: Vec<UnitEntry> = Vec::with_capacity(configs.len());
        for config in configs {
            if units.iter().any(|entry| entry.config.name == config.name) {
                warn!(unit = %config.name, "duplicate unit ignored");
                continue;
            }
            let supervisor = UnitSupervisor::spawn(config.clone(), ctx.clone())?;
            let issues = supervisor.status().issues;
            if !issues.is_empty() {
                warn!(unit = %config.name, issues = %issues.join("; "), "unit configuration has problems");
            }
            units.push(UnitEntry {
                config,
                supervisor: Arc::new(supervisor),
            });
        }

        Ok(Self {
            path,
            template: workspace,
            ctx,
            units: RwLock::new(units),
            sampler: Mutex::new(sampler),
        })
    }

    pub fn settings(&self) -> &WorkspaceSettings {
        &self.ctx.settings
    }

    /// Registers a new unit in the `Stopped` state.
    pub async fn add_unit(&self, config: UnitConfig) -> Result<(), SupervisorError> {
        check_name(&config.name)?;
        let mut units = self.units.write().await;
        if units.iter().any(|entry| entry.config.name == config.name) {
            return Err(SupervisorError::DuplicateUnit { unit: config.name });
        }
        info!(unit = %config.name, "unit added");
        let supervisor = UnitSupervisor::spawn(config.clone(), self.ctx.clone())?;
        units.push(UnitEntry {
            config,
            supervisor: Arc::new(supervisor),
        });
        self.save(&units);
        Ok(())
    }

    /// Removes a stopped unit. Its log file is kept on disk.
    ///
    /// The unit's actor is retired first, which only succeeds while it is
    /// `Stopped`; after that no command can launch it again.
    pub async fn remove_unit(&self, name: &str) -> Result<(), SupervisorError> {
        let supervisor = self.supervisor(name).await?;
        supervisor.retire().await.map_err(|err| match err {
            SupervisorError::Unavailable { unit } => SupervisorError::UnknownUnit { unit },
            err => err,
        })?;
        {
            let mut units = self.units.write().await;
            units.retain(|entry| !Arc::ptr_eq(&entry.supervisor, &supervisor));
            self.ctx.store.forget(name);
            self.save(&units);
        }
        supervisor.shutdown().await;
        info!(unit = name, "unit removed");
        Ok(())
    }

    /// Replaces a unit's configuration. A running unit keeps its current process;
    /// the new configuration applies from its next launch.
    pub async fn update_unit(&self, config: UnitConfig) -> Result<(), SupervisorError> {
        let supervisor = self.supervisor(&config.name).await?;
        supervisor.update(config.clone()).await?;
        let mut units = self.units.write().await;
        let entry = units
            .iter_mut()
            .find(|entry| Arc::ptr_eq(&entry.supervisor, &supervisor))
            .ok_or_else(|| SupervisorError::UnknownUnit {
                unit: config.name.clone(),
            })?;
        entry.config = config;
        self.save(&units);
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<(), SupervisorError> {
        self.supervisor(name).await?.start().await
    }

    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        self.supervisor(name).await?.stop().await
    }

    pub async fn restart(&self, name: &str) -> Result<(), SupervisorError> {
        self.supervisor(name).await?.restart().await
    }

    /// Starts every stopped unit concurrently.
    pub async fn start_all(&self) -> BatchReport {
        let units = self.snapshot().await;
        fan_out(units, |state| state == UnitState::Stopped, |unit| async move {
            unit.start().await
        })
        .await
    }

    /// Stops every active unit concurrently.
    pub async fn stop_all(&self) -> BatchReport {
        let units = self.snapshot().await;
        fan_out(units, |state| state != UnitState::Stopped, |unit| async move {
            unit.stop().await
        })
        .await
    }

    pub async fn get_status(&self, name: &str) -> Result<UnitStatus, SupervisorError> {
        Ok(self.supervisor(name).await?.status())
    }

    /// Status of every unit, in configuration order.
    pub async fn statuses(&self) -> Vec<UnitStatus> {
        let units = self.units.read().await;
        units.iter().map(|entry| entry.supervisor.status()).collect()
    }

    pub async fn unit_names(&self) -> Vec<String> {
        let units = self.units.read().await;
        units.iter().map(|entry| entry.config.name.clone()).collect()
    }

    pub async fn config(&self, name: &str) -> Result<UnitConfig, SupervisorError> {
        let units = self.units.read().await;
        let index = position(&units, name)?;
        Ok(units[index].config.clone())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.ctx.bus.subscribe()
    }

    pub fn subscribe_samples(&self) -> broadcast::Receiver<ResourceSample> {
        self.sampler.lock().subscribe()
    }

    /// Latest resource sample for a unit, or `None` while it is not running.
    pub async fn get_resource_sample(
        &self,
        name: &str,
    ) -> Result<Option<ResourceSample>, SupervisorError> {
        let units = self.units.read().await;
        position(&units, name)?;
        Ok(self.sampler.lock().latest(name))
    }

    /// Rolling window of recent samples for a unit.
    pub async fn resource_history(&self, name: &str) -> Result<Vec<ResourceSample>, SupervisorError> {
        let units = self.units.read().await;
        position(&units, name)?;
        Ok(self.sampler.lock().window(name))
    }

    pub async fn log(&self, name: &str) -> Result<Arc<UnitLog>, SupervisorError> {
        Ok(self.supervisor(name).await?.log().clone())
    }

    pub async fn subscribe_logs(
        &self,
        name: &str,
        mode: LogMode,
    ) -> Result<LogSubscription, SupervisorError> {
        let log = self.log(name).await?;
        Ok(match mode {
            LogMode::Live { from } => LogSubscription::Live(log.tail(from)),
            LogMode::History { range } => LogSubscription::History(log.history(range)),
            LogMode::Search { query, follow } => {
                let mode = if follow {
                    SearchMode::Live
                } else {
                    SearchMode::History
                };
                LogSubscription::Search(log.search(query, mode))
            }
        })
    }

    /// Discards a unit's stored log history.
    pub async fn clear_logs(&self, name: &str) -> Result<(), SupervisorError> {
        self.log(name).await?.clear()?;
        Ok(())
    }

    /// Stops every unit, ends their actors and stops the sampler.
    pub async fn shutdown(&self) {
        let units = std::mem::take(&mut *self.units.write().await);
        let mut tasks = JoinSet::new();
        for entry in units {
            tasks.spawn(async move { entry.supervisor.shutdown().await });
        }
        while tasks.join_next().await.is_some() {}
        self.sampler.lock().stop();
        info!("all units shut down");
    }

    // The read guard is dropped before returning, so callers can await the unit.
    async fn supervisor(&self, name: &str) -> Result<Arc<UnitSupervisor>, SupervisorError> {
        let units = self.units.read().await;
        let index = position(&units, name)?;
        Ok(units[index].supervisor.clone())
    }

    async fn snapshot(&self) -> Vec<(String, Arc<UnitSupervisor>)> {
        let units = self.units.read().await;
        units
            .iter()
            .map(|entry| (entry.config.name.clone(), entry.supervisor.clone()))
            .collect()
    }

    fn save(&self, units: &[UnitEntry]) {
        let Some(path) = &self.path else {
            return;
        };
        let mut workspace = self.template.clone();
        workspace.units = units.iter().map(|entry| entry.config.clone()).collect();
        if let Err(err) = config::save_workspace(path, &workspace) {
            warn!(path = %path.display(), error = %format!("{err:#}"), "failed to save workspace");
        }
    }
}

fn position(units: &[UnitEntry], name: &str) -> Result<usize, SupervisorError> {
    units
        .iter()
        .position(|entry| entry.config.name == name)
        .ok_or_else(|| SupervisorError::UnknownUnit {
            unit: name.to_string(),
        })
}

fn check_name(name: &str) -> Result<(), SupervisorError> {
    config::validate_name(name).map_err(|reason| SupervisorError::InvalidName {
        unit: name.to_string(),
        reason,
    })
}

async fn fan_out<F, Fut>(
    units: Vec<(String, Arc<UnitSupervisor>)>,
    applies: impl Fn(UnitState) -> bool,
    command: F,
) -> BatchReport
where
    F: Fn(Arc<UnitSupervisor>) -> Fut,
    Fut: std::future::Future<Output = Result<(), SupervisorError>> + Send + 'static,
{
    let mut report = BatchReport::default();
    let mut tasks = JoinSet::new();
    for (name, supervisor) in units {
        if !applies(supervisor.state()) {
            report.skipped.push(name);
            continue;
        }
        let fut = command(supervisor);
        tasks.spawn(async move { (name, fut.await) });
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => report.succeeded.push(name),
            Ok((_, Err(err))) => report.failed.push(err),
            Err(err) => warn!(error = %err, "batch command task failed"),
        }
    }
    report.succeeded.sort();
    report
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    use std::time::Duration;

    fn sh(name: &str, script: &str) -> UnitConfig {
        let mut config = UnitConfig::new(name, "/bin/sh");
        config.args = vec!["-c".into(), script.into()];
        config
    }

    fn workspace(dir: &Path, units: Vec<UnitConfig>) -> Workspace {
        Workspace {
            grace_ms: Some(500),
            units,
            base_dir: dir.to_path_buf(),
            ..Workspace::default()
        }
    }

    #[tokio::test]
    async fn rejects_duplicate_and_invalid_names() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(workspace(dir.path(), vec![sh("api", "true")]), None).unwrap();

        let err = registry.add_unit(sh("api", "true")).await.unwrap_err();
        assert!(matches!(err, SupervisorError::DuplicateUnit { .. }));
        let err = registry.add_unit(sh("../escape", "true")).await.unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidName { .. }));
        assert_eq!(registry.unit_names().await, vec!["api"]);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn running_unit_cannot_be_removed() {
        let dir = tempfile::tempdir().unwrap();
        let registry =
            Registry::new(workspace(dir.path(), vec![sh("server", "sleep 30")]), None).unwrap();

        registry.start("server").await.unwrap();
        let err = registry.remove_unit("server").await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::UnitBusy { state: UnitState::Running, .. }
        ));
        assert_eq!(registry.unit_names().await, vec!["server"]);
        assert_eq!(
            registry.get_status("server").await.unwrap().state,
            UnitState::Running
        );

        registry.stop("server").await.unwrap();
        registry.remove_unit("server").await.unwrap();
        assert!(registry.unit_names().await.is_empty());
        let err = registry.get_status("server").await.unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownUnit { .. }));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn batch_commands_collect_failures() {
        let dir = tempfile::tempdir().unwrap();
        let mut broken = UnitConfig::new("broken", "/bin/sh");
        broken.script = Some("missing.sh".into());
        let registry = Registry::new(
            workspace(
                dir.path(),
                vec![sh("a", "sleep 30"), broken, sh("b", "sleep 30")],
            ),
            None,
        )
        .unwrap();

        let report = registry.start_all().await;
        assert_eq!(report.succeeded, vec!["a", "b"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].unit(), Some("broken"));
        assert!(!report.is_ok());

        let report = registry.stop_all().await;
        assert_eq!(report.succeeded, vec!["a", "b"]);
        assert_eq!(report.skipped, vec!["broken"]);
        assert!(report.is_ok());
        for status in registry.statuses().await {
            assert_eq!(status.state, UnitState::Stopped);
        }
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_paths_are_flagged_not_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut broken = UnitConfig::new("broken", "/bin/sh");
        broken.script = Some("missing.sh".into());
        let registry = Registry::new(workspace(dir.path(), vec![broken]), None).unwrap();

        let status = registry.get_status("broken").await.unwrap();
        assert_eq!(status.state, UnitState::Stopped);
        assert!(status.issues.iter().any(|issue| issue.contains("missing.sh")));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn structural_changes_are_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(config::DEFAULT_CONFIG_FILE);
        config::save_workspace(&path, &workspace(dir.path(), vec![sh("api", "true")])).unwrap();
        let registry = Registry::open(&path).unwrap();

        registry.add_unit(sh("worker", "true")).await.unwrap();
        let mut updated = sh("api", "exit 0");
        updated.auto_restart = true;
        registry.update_unit(updated).await.unwrap();
        registry.remove_unit("worker").await.unwrap();
        registry.add_unit(sh("late", "true")).await.unwrap();

        let saved = config::load_workspace(&path).unwrap();
        let names: Vec<&str> = saved.units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["api", "late"]);
        assert!(saved.units[0].auto_restart);
        assert_eq!(saved.grace_ms, Some(500));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn log_subscriptions_serve_history_live_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(
            workspace(dir.path(), vec![sh("talker", "echo hello; echo world")]),
            None,
        )
        .unwrap();
        let mut events = registry.subscribe_events();
        registry.start("talker").await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let SupervisorEvent::StateChanged {
                    to: UnitState::Stopped,
                    ..
                } = events.recv().await.unwrap()
                {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let LogSubscription::History(history) = registry
            .subscribe_logs("talker", LogMode::History { range: 1..3 })
            .await
            .unwrap()
        else {
            panic!("expected history");
        };
        let texts: Vec<String> = history.iter().map(|e| e.text()).collect();
        assert_eq!(texts, vec!["hello", "world"]);

        let LogSubscription::Live(mut tail) = registry
            .subscribe_logs("talker", LogMode::Live { from: 2 })
            .await
            .unwrap()
        else {
            panic!("expected live tail");
        };
        assert_eq!(tail.next().await.unwrap().text(), "world");

        let query = SearchQuery::substring("WOR");
        let LogSubscription::Search(SearchResults::History(found)) = registry
            .subscribe_logs("talker", LogMode::Search { query, follow: false })
            .await
            .unwrap()
        else {
            panic!("expected history search");
        };
        assert_eq!(found.map(|e| e.seq).collect::<Vec<_>>(), vec![2]);

        assert_eq!(registry.log("talker").await.unwrap().line_count(), 2);
        registry.clear_logs("talker").await.unwrap();
        assert_eq!(registry.log("talker").await.unwrap().line_count(), 0);
        assert!(registry.get_resource_sample("talker").await.unwrap().is_none());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn stopping_one_unit_does_not_stall_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let mut stubborn = sh("stubborn", "trap '' TERM; echo ready; sleep 30");
        stubborn.grace_ms = Some(2000);
        let registry = Arc::new(
            Registry::new(
                workspace(dir.path(), vec![stubborn, sh("other", "sleep 30")]),
                None,
            )
            .unwrap(),
        );
        registry.start("stubborn").await.unwrap();
        registry.start("other").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stopping = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.stop("stubborn").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let adding = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.add_unit(sh("late", "true")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        let status = registry.get_status("other").await.unwrap();
        assert_eq!(status.state, UnitState::Running);
        registry.stop("other").await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1000));
        adding.await.unwrap().unwrap();
        assert_eq!(
            registry.get_status("stubborn").await.unwrap().state,
            UnitState::Stopping
        );

        stopping.await.unwrap().unwrap();
        assert_eq!(
            registry.get_status("stubborn").await.unwrap().state,
            UnitState::Stopped
        );
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn unsafe_names_in_the_workspace_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = Registry::new(
            workspace(dir.path(), vec![sh("../../escaped", "true")]),
            None,
        );
        let err = match result {
            Ok(_) => panic!("unsafe unit name accepted"),
            Err(err) => err,
        };
        assert!(matches!(err, SupervisorError::InvalidName { .. }));
        assert!(!dir.path().join("escaped.jsonl").exists());
    }

    #[tokio::test]
    async fn removed_unit_cannot_be_commanded() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(workspace(dir.path(), vec![sh("api", "sleep 30")]), None).unwrap();
        let log = registry.log("api").await.unwrap();

        registry.remove_unit("api").await.unwrap();
        let err = registry.start("api").await.unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownUnit { .. }));
        let err = registry.remove_unit("api").await.unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownUnit { .. }));
        assert_eq!(log.line_count(), 0);
        registry.shutdown().await;
    }
}
