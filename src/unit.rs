//! Per-unit supervision.
//!
//! Each unit is driven by a single actor task that owns its state machine, its
//! current [`ProcessHandle`] and its restart bookkeeping. Callers talk to it through a
//! [`UnitSupervisor`], which turns method calls into commands on the actor's queue.
//! Commands are processed one at a time, so a `restart` stops and starts with nothing
//! in between, and waiting out a stop grace period only suspends this unit.
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//!                        Running -> Crashed -> RestartPending -> Starting
//!                        Running -> Crashed -> Stopped
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::ansi::AnsiDecoder;
use crate::config::{UnitConfig, WorkspaceSettings};
use crate::error::SupervisorError;
use crate::events::{Bus, SupervisorEvent};
use crate::handle::{LaunchSpec, OutputSink, ProcessHandle};
use crate::output::StreamKind;
use crate::process::{classify_exit, ExitClass, ExitOutcome, UnitState, UnitStatus};
use crate::sampler::PidTable;
use crate::store::{LogStore, UnitLog};

const COMMAND_QUEUE: usize = 16;
/// How long to wait for a killed process to be reaped before giving up on it.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Shared services every unit reports into.
#[derive(Clone)]
pub struct UnitContext {
    pub settings: WorkspaceSettings,
    pub store: Arc<LogStore>,
    pub bus: Bus,
    pub pids: PidTable,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Start(Reply<Result<(), SupervisorError>>),
    Stop(Reply<Result<(), SupervisorError>>),
    Restart(Reply<Result<(), SupervisorError>>),
    Update(Box<UnitConfig>, Reply<()>),
    Retire(Reply<Result<(), SupervisorError>>),
    Shutdown(Reply<()>),
}

/// Handle to a unit's actor.
pub struct UnitSupervisor {
    name: String,
    tx: mpsc::Sender<Command>,
    status: watch::Receiver<UnitStatus>,
    log: Arc<UnitLog>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UnitSupervisor {
    /// Spawns the actor for `config`. The unit starts out `Stopped`, with any
    /// validation problems recorded on its status.
    ///
    /// Fails if the unit's log cannot be opened under that name.
    pub fn spawn(config: UnitConfig, ctx: UnitContext) -> Result<Self, SupervisorError> {
        Self::spawn_with(config, ctx, KILL_WAIT)
    }

    fn spawn_with(
        config: UnitConfig,
        ctx: UnitContext,
        kill_wait: Duration,
    ) -> Result<Self, SupervisorError> {
        let name = config.name.clone();
        let log = ctx.store.unit(&name)?;
        let mut status = UnitStatus::new(&name);
        status.issues = issue_strings(&config, &ctx.settings);
        let (status_tx, status_rx) = watch::channel(status);
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let actor = UnitActor {
            config,
            ctx,
            log: log.clone(),
            status: status_tx,
            handle: None,
            crashes: 0,
            restart_at: None,
            stable_at: None,
            kill_wait,
            rx,
        };
        let task = tokio::spawn(actor.run());
        Ok(Self {
            name,
            tx,
            status: status_rx,
            log,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log(&self) -> &Arc<UnitLog> {
        &self.log
    }

    /// Current status snapshot.
    pub fn status(&self) -> UnitStatus {
        let mut status = self.status.borrow().clone();
        status.history_degraded = self.log.degraded();
        status
    }

    pub fn state(&self) -> UnitState {
        self.status.borrow().state
    }

    /// Receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<UnitStatus> {
        self.status.clone()
    }

    /// Launches the unit. Only valid while `Stopped`.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.request(Command::Start).await?
    }

    /// Stops the unit, escalating to a kill after the grace period.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        self.request(Command::Stop).await?
    }

    pub async fn restart(&self) -> Result<(), SupervisorError> {
        self.request(Command::Restart).await?
    }

    /// Replaces the configuration. Takes effect on the next launch.
    pub async fn update(&self, config: UnitConfig) -> Result<(), SupervisorError> {
        self.request(|reply| Command::Update(Box::new(config), reply))
            .await
    }

    /// Ends the actor if the unit is `Stopped`, else fails with `UnitBusy`.
    /// Every later command fails with `Unavailable`.
    pub async fn retire(&self) -> Result<(), SupervisorError> {
        self.request(Command::Retire).await?
    }

    /// Stops any running process and ends the actor.
    pub async fn shutdown(&self) {
        let _ = self.request(Command::Shutdown).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.unavailable())
    }

    fn unavailable(&self) -> SupervisorError {
        SupervisorError::Unavailable {
            unit: self.name.clone(),
        }
    }
}

struct UnitActor {
    config: UnitConfig,
    ctx: UnitContext,
    log: Arc<UnitLog>,
    status: watch::Sender<UnitStatus>,
    handle: Option<ProcessHandle>,
    /// Consecutive crashes since the last manual start or stable run.
    crashes: u32,
    restart_at: Option<Instant>,
    stable_at: Option<Instant>,
    kill_wait: Duration,
    rx: mpsc::Receiver<Command>,
}

impl UnitActor {
    async fn run(mut self) {
        loop {
            let exit = self.handle.as_ref().map(|handle| handle.wait());
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            return;
                        }
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                outcome = async move {
                    match exit {
                        Some(exit) => exit.await,
                        None => std::future::pending().await,
                    }
                } => self.on_exit(outcome),
                _ = sleep_until(self.restart_at) => self.on_restart_due(),
                _ = sleep_until(self.stable_at) => self.on_stable(),
            }
        }
    }

    // Returns false once the actor should end.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start(reply) => {
                let result = self.start();
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                let result = self.stop().await;
                let _ = reply.send(result);
            }
            Command::Restart(reply) => {
                let result = self.restart().await;
                let _ = reply.send(result);
            }
            Command::Update(config, reply) => {
                debug!(unit = %self.config.name, "configuration updated");
                self.config = *config;
                let issues = issue_strings(&self.config, &self.ctx.settings);
                self.status.send_modify(|status| status.issues = issues);
                let _ = reply.send(());
            }
            Command::Retire(reply) => {
                let state = self.state();
                if state == UnitState::Stopped {
                    debug!(unit = %self.config.name, "unit retired");
                    let _ = reply.send(Ok(()));
                    return false;
                }
                let _ = reply.send(Err(SupervisorError::UnitBusy {
                    unit: self.config.name.clone(),
                    state,
                }));
            }
            Command::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn state(&self) -> UnitState {
        self.status.borrow().state
    }

    fn start(&mut self) -> Result<(), SupervisorError> {
        let state = self.state();
        if state != UnitState::Stopped {
            return Err(SupervisorError::AlreadyRunning {
                unit: self.config.name.clone(),
                state,
            });
        }
        self.crashes = 0;
        self.launch()
    }

    async fn stop(&mut self) -> Result<(), SupervisorError> {
        match self.state() {
            UnitState::RestartPending => {
                info!(unit = %self.config.name, "pending restart cancelled");
                self.restart_at = None;
                self.transition(UnitState::Stopped);
                Ok(())
            }
            UnitState::Starting | UnitState::Running => {
                self.terminate().await;
                Ok(())
            }
            UnitState::Stopping => {
                if let Some(handle) = &self.handle {
                    handle.kill();
                }
                Ok(())
            }
            state => Err(SupervisorError::NotRunning {
                unit: self.config.name.clone(),
                state,
            }),
        }
    }

    async fn restart(&mut self) -> Result<(), SupervisorError> {
        if self.state() != UnitState::Stopped {
            self.stop().await?;
        }
        self.start()
    }

    async fn shutdown(&mut self) {
        self.restart_at = None;
        if self.handle.is_some() && self.state() != UnitState::Stopping {
            self.terminate().await;
        }
        if let Some(handle) = self.handle.take() {
            handle.kill();
            self.detach();
        }
        self.transition(UnitState::Stopped);
    }

    fn launch(&mut self) -> Result<(), SupervisorError> {
        self.transition(UnitState::Starting);
        let spec = LaunchSpec::resolve(&self.config, &self.ctx.settings.base_dir);
        info!(unit = %self.config.name, command = %spec.display_command(), "starting unit");
        let sink = Arc::new(UnitOutput::new(self.log.clone()));
        match ProcessHandle::spawn(&spec, sink) {
            Ok(handle) => {
                let pid = handle.pid();
                let started_at = handle.started_at();
                self.ctx.pids.write().insert(self.config.name.clone(), pid);
                self.status.send_modify(|status| {
                    status.pid = Some(pid);
                    status.started_at = Some(started_at);
                    status.last_error = None;
                });
                self.handle = Some(handle);
                self.stable_at = Some(Instant::now() + self.ctx.settings.stable_for(&self.config));
                self.ctx.bus.publish(SupervisorEvent::Spawned {
                    unit: self.config.name.clone(),
                    pid,
                });
                self.transition(UnitState::Running);
                Ok(())
            }
            Err(source) => {
                warn!(
                    unit = %self.config.name,
                    error = %source,
                    kind = source.as_label(),
                    "failed to start unit"
                );
                let message = source.to_string();
                self.status
                    .send_modify(|status| status.last_error = Some(message.clone()));
                self.ctx.bus.publish(SupervisorEvent::SpawnFailed {
                    unit: self.config.name.clone(),
                    error: message,
                });
                self.transition(UnitState::Stopped);
                Err(SupervisorError::Spawn {
                    unit: self.config.name.clone(),
                    state: UnitState::Starting,
                    source,
                })
            }
        }
    }

    // Terminate, wait out the grace period, then kill. Ends `Stopped` once the exit
    // is seen; a process that outlives the kill keeps the unit `Stopping` until the
    // reaper reports it through `on_exit`.
    async fn terminate(&mut self) {
        let Some(handle) = self.handle.take() else {
            self.transition(UnitState::Stopped);
            return;
        };
        self.stable_at = None;
        self.transition(UnitState::Stopping);
        handle.signal_terminate();

        let grace = self.ctx.settings.grace_for(&self.config);
        let outcome = match tokio::time::timeout(grace, handle.wait()).await {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                warn!(
                    unit = %self.config.name,
                    pid = handle.pid(),
                    grace_ms = grace.as_millis() as u64,
                    "unit did not exit within grace period; killing"
                );
                handle.kill();
                tokio::time::timeout(self.kill_wait, handle.wait()).await.ok()
            }
        };
        match outcome {
            Some(outcome) => {
                self.detach();
                info!(unit = %self.config.name, %outcome, "unit stopped");
                self.record_exit(outcome, ExitClass::Intentional);
                self.transition(UnitState::Stopped);
            }
            None => {
                error!(
                    unit = %self.config.name,
                    pid = handle.pid(),
                    "process survived kill; unit stays stopping until it is reaped"
                );
                self.handle = Some(handle);
            }
        }
    }

    fn on_exit(&mut self, outcome: ExitOutcome) {
        if self.handle.take().is_none() {
            return;
        }
        let class = classify_exit(self.state(), outcome, &self.config.expected_exit_codes);
        self.detach();
        self.stable_at = None;
        self.record_exit(outcome, class);

        match class {
            ExitClass::Intentional | ExitClass::Completed => {
                info!(unit = %self.config.name, %outcome, "unit exited");
                self.transition(UnitState::Stopped);
            }
            ExitClass::Crash => self.on_crash(outcome),
        }
    }

    fn on_crash(&mut self, outcome: ExitOutcome) {
        self.crashes += 1;
        warn!(unit = %self.config.name, %outcome, crashes = self.crashes, "unit crashed");
        self.transition(UnitState::Crashed);

        if !self.config.auto_restart {
            self.transition(UnitState::Stopped);
            return;
        }
        let max = self.config.max_restart_attempts;
        if self.crashes < max {
            let delay = self.config.backoff.delay(self.crashes - 1);
            info!(
                unit = %self.config.name,
                attempt = self.crashes,
                max,
                delay_ms = delay.as_millis() as u64,
                "scheduling restart"
            );
            self.ctx.bus.publish(SupervisorEvent::RestartScheduled {
                unit: self.config.name.clone(),
                attempt: self.crashes,
                max,
                delay,
            });
            self.restart_at = Some(Instant::now() + delay);
            self.transition(UnitState::RestartPending);
        } else {
            error!(
                unit = %self.config.name,
                attempts = self.crashes,
                "restart attempts exhausted; unit stays stopped"
            );
            self.ctx.bus.publish(SupervisorEvent::TerminalFailure {
                unit: self.config.name.clone(),
                attempts: self.crashes,
                last_exit: Some(outcome),
            });
            self.transition(UnitState::Stopped);
        }
    }

    fn on_restart_due(&mut self) {
        self.restart_at = None;
        if self.state() == UnitState::RestartPending {
            // Failures are already reported by `launch`.
            let _ = self.launch();
        }
    }

    fn on_stable(&mut self) {
        self.stable_at = None;
        if self.crashes > 0 {
            debug!(unit = %self.config.name, "run is stable; crash counter reset");
            self.crashes = 0;
            self.status.send_modify(|status| status.restart_attempts = 0);
        }
    }

    fn record_exit(&mut self, outcome: ExitOutcome, class: ExitClass) {
        self.status
            .send_modify(|status| status.last_exit = Some(outcome));
        self.ctx.bus.publish(SupervisorEvent::Exited {
            unit: self.config.name.clone(),
            outcome,
            class,
        });
    }

    fn detach(&mut self) {
        self.ctx.pids.write().remove(&self.config.name);
        self.status.send_modify(|status| status.pid = None);
    }

    fn transition(&mut self, to: UnitState) {
        let from = self.state();
        let crashes = self.crashes;
        self.status.send_modify(|status| {
            status.state = to;
            status.restart_attempts = crashes;
        });
        if from == to {
            return;
        }
        debug!(unit = %self.config.name, %from, %to, "state changed");
        self.ctx.bus.publish(SupervisorEvent::StateChanged {
            unit: self.config.name.clone(),
            from,
            to,
        });
    }
}

/// Validation problems for `config`, rendered for display on the unit status.
pub fn issue_strings(config: &UnitConfig, settings: &WorkspaceSettings) -> Vec<String> {
    config
        .validate(&settings.base_dir)
        .iter()
        .map(ToString::to_string)
        .collect()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Decodes a unit's raw output and appends each line to its log.
struct UnitOutput {
    log: Arc<UnitLog>,
    stdout: Mutex<AnsiDecoder>,
    stderr: Mutex<AnsiDecoder>,
}

impl UnitOutput {
    fn new(log: Arc<UnitLog>) -> Self {
        Self {
            log,
            stdout: Mutex::new(AnsiDecoder::new()),
            stderr: Mutex::new(AnsiDecoder::new()),
        }
    }

    fn decoder(&self, stream: StreamKind) -> &Mutex<AnsiDecoder> {
        match stream {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        }
    }
}

impl OutputSink for UnitOutput {
    fn on_output(&self, stream: StreamKind, bytes: &[u8]) {
        let mut decoder = self.decoder(stream).lock();
        for line in decoder.feed(bytes) {
            self.log.append(stream, line);
        }
    }

    fn on_closed(&self, stream: StreamKind) {
        let mut decoder = self.decoder(stream).lock();
        if let Some(line) = decoder.finish() {
            self.log.append(stream, line);
        }
    }
}
