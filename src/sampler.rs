//! Periodic CPU and memory sampling for running units.
//!
//! The sampler reads a shared table of `unit -> pid` maintained by the unit
//! supervisors, measures each pid on a fixed interval and publishes one
//! [`ResourceSample`] per unit. It runs on its own thread, so a slow OS query never
//! holds up process I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const SAMPLE_CAPACITY: usize = 256;

/// Pids of running units, keyed by unit name.
pub type PidTable = Arc<RwLock<HashMap<String, u32>>>;

/// Result of probing one pid.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    /// The process no longer exists.
    Gone,
    /// Metrics could not be read.
    Unavailable(String),
    Usage { cpu_percent: f32, rss_bytes: u64 },
}

/// Where process metrics come from.
pub trait MetricsSource: Send + 'static {
    /// Refreshes the source's view of the process table.
    fn refresh(&mut self);
    /// Usage of `pid` and all of its descendants as of the last refresh.
    fn measure(&self, pid: u32) -> Reading;
}

/// Metrics read through `sysinfo`.
///
/// CPU usage is per core, as `top` reports it, so a process tree can exceed 100%.
pub struct SysinfoSource {
    system: System,
    children: HashMap<Pid, Vec<Pid>>,
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            children: HashMap::new(),
        }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SysinfoSource {
    fn refresh(&mut self) {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return;
        }
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );
        self.children.clear();
        for (pid, process) in self.system.processes() {
            if let Some(parent) = process.parent() {
                self.children.entry(parent).or_default().push(*pid);
            }
        }
    }

    fn measure(&self, pid: u32) -> Reading {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Reading::Unavailable("process metrics are not supported on this platform".into());
        }
        let root = Pid::from_u32(pid);
        if self.system.process(root).is_none() {
            return Reading::Gone;
        }
        let mut cpu_percent = 0.0f32;
        let mut rss_bytes = 0u64;
        let mut pending = vec![root];
        let mut seen = std::collections::HashSet::new();
        while let Some(current) = pending.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(process) = self.system.process(current) {
                cpu_percent += process.cpu_usage();
                rss_bytes += process.memory();
                if let Some(children) = self.children.get(&current) {
                    pending.extend(children.iter().copied());
                }
            }
        }
        Reading::Usage {
            cpu_percent,
            rss_bytes,
        }
    }
}

/// What a sample measured.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Metrics {
    Usage { cpu_percent: f32, rss_bytes: u64 },
    Unavailable { reason: String },
}

/// One measurement of a unit's process tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSample {
    pub unit: String,
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
    pub metrics: Metrics,
}

type Windows = Arc<RwLock<HashMap<String, VecDeque<ResourceSample>>>>;

/// Samples every registered pid once per [`tick`](Self::tick).
pub struct ResourceSampler<S> {
    source: S,
    pids: PidTable,
    window: usize,
    windows: Windows,
    tx: broadcast::Sender<ResourceSample>,
}

impl<S: MetricsSource> ResourceSampler<S> {
    pub fn new(source: S, pids: PidTable, window: usize) -> Self {
        let (tx, _rx) = broadcast::channel(SAMPLE_CAPACITY);
        Self {
            source,
            pids,
            window: window.max(1),
            windows: Arc::new(RwLock::new(HashMap::new())),
            tx,
        }
    }

    /// Takes one round of samples and returns what was published.
    pub fn tick(&mut self) -> Vec<ResourceSample> {
        self.source.refresh();
        let pids: Vec<(String, u32)> = self
            .pids
            .read()
            .iter()
            .map(|(unit, pid)| (unit.clone(), *pid))
            .collect();

        let now = Utc::now();
        let mut samples = Vec::with_capacity(pids.len());
        for (unit, pid) in &pids {
            let metrics = match self.source.measure(*pid) {
                Reading::Gone => continue,
                Reading::Unavailable(reason) => {
                    debug!(unit = %unit, pid, %reason, "resource metrics unavailable");
                    Metrics::Unavailable { reason }
                }
                Reading::Usage {
                    cpu_percent,
                    rss_bytes,
                } => Metrics::Usage {
                    cpu_percent,
                    rss_bytes,
                },
            };
            samples.push(ResourceSample {
                unit: unit.clone(),
                pid: *pid,
                timestamp: now,
                metrics,
            });
        }

        let mut windows = self.windows.write();
        windows.retain(|unit, _| pids.iter().any(|(name, _)| name == unit));
        for sample in &samples {
            let window = windows.entry(sample.unit.clone()).or_default();
            window.push_back(sample.clone());
            while window.len() > self.window {
                window.pop_front();
            }
            let _ = self.tx.send(sample.clone());
        }
        samples
    }

    /// Moves the sampler onto its own thread, ticking every `interval`.
    pub fn spawn(mut self, interval: Duration) -> SamplerHandle {
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let windows = self.windows.clone();
        let tx = self.tx.clone();
        let spawned = std::thread::Builder::new()
            .name("resource-sampler".into())
            .spawn(move || {
                // First refresh only establishes the CPU baseline.
                self.source.refresh();
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            self.tick();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            });
        let thread = match spawned {
            Ok(thread) => Some(thread),
            Err(err) => {
                warn!(error = %err, "failed to start resource sampler; no samples will be taken");
                None
            }
        };
        SamplerHandle {
            stop_tx,
            thread,
            windows,
            tx,
        }
    }
}

/// Access to a running sampler's results.
pub struct SamplerHandle {
    stop_tx: std_mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
    windows: Windows,
    tx: broadcast::Sender<ResourceSample>,
}

impl SamplerHandle {
    /// Most recent sample for `unit`, if it is running.
    pub fn latest(&self, unit: &str) -> Option<ResourceSample> {
        self.windows
            .read()
            .get(unit)
            .and_then(|window| window.back().cloned())
    }

    /// The retained rolling window for `unit`, oldest first.
    pub fn window(&self, unit: &str) -> Vec<ResourceSample> {
        self.windows
            .read()
            .get(unit)
            .map(|window| window.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceSample> {
        self.tx.subscribe()
    }

    /// Stops the sampling thread and waits for it to exit.
    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
