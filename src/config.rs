//! Workspace configuration for scriptrack.
//!
//! This module defines the structure of the `scriptrack.toml` workspace file, loads
//! and saves it, and validates each unit so that bad paths are flagged up front
//! rather than discovered at launch time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::handle::LaunchSpec;

pub const DEFAULT_CONFIG_FILE: &str = "scriptrack.toml";
const DEFAULT_LOG_DIR: &str = ".scriptrack/logs";
const DEFAULT_MAX_LOG_BYTES: u64 = 8 * 1024 * 1024;
const DEFAULT_MAX_LINES: usize = 2000;
const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 1000;
const DEFAULT_SAMPLE_WINDOW: usize = 120;
const DEFAULT_GRACE_MS: u64 = 3000;
const DEFAULT_STABLE_MS: u64 = 30_000;

/// Top-level structure corresponding to `scriptrack.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workspace {
    /// Directory holding per-unit log files, relative to the workspace file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    /// Persisted log size per unit before the oldest events are evicted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_log_bytes: Option<u64>,
    /// Maximum number of recent events kept in memory per unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lines: Option<usize>,
    /// Resource sampling interval in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_interval_ms: Option<u64>,
    /// Number of resource samples retained per unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_window: Option<usize>,
    /// Default time to wait after a terminate signal before killing (ms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_ms: Option<u64>,
    /// Default run time after which the crash counter resets (ms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_ms: Option<u64>,
    /// Configured units, in display order.
    #[serde(default, rename = "unit")]
    pub units: Vec<UnitConfig>,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Configuration for a single supervised unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Unique name of the unit.
    pub name: String,
    /// Interpreter or executable to launch.
    pub interpreter: PathBuf,
    /// Script passed as the first argument. Absent for plain commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,
    /// Working directory for the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Arguments, passed verbatim after the script.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Whether to relaunch the unit after a crash.
    #[serde(default)]
    pub auto_restart: bool,
    /// Consecutive crashes tolerated before giving up.
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    /// Exit codes that count as a normal completion rather than a crash.
    #[serde(default = "default_expected_exit_codes")]
    pub expected_exit_codes: Vec<i32>,
    /// Per-unit override of the stop grace period (ms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_ms: Option<u64>,
    /// Per-unit override of the stable-run duration (ms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_ms: Option<u64>,
    /// Environment variables to set for the process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Delay policy between crash and relaunch.
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

fn default_max_restart_attempts() -> u32 {
    5
}

fn default_expected_exit_codes() -> Vec<i32> {
    vec![0]
}

impl UnitConfig {
    pub fn new(name: impl Into<String>, interpreter: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            interpreter: interpreter.into(),
            script: None,
            cwd: None,
            args: Vec::new(),
            auto_restart: false,
            max_restart_attempts: default_max_restart_attempts(),
            expected_exit_codes: default_expected_exit_codes(),
            grace_ms: None,
            stable_ms: None,
            env: BTreeMap::new(),
            backoff: BackoffPolicy::default(),
        }
    }

    /// Checks the unit against the filesystem and returns every problem found.
    pub fn validate(&self, base_dir: &Path) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        if let Err(reason) = validate_name(&self.name) {
            issues.push(ConfigIssue::new("name", reason));
        }
        let spec = LaunchSpec::resolve(self, base_dir);
        if !spec.cwd.is_dir() {
            issues.push(ConfigIssue::new(
                "cwd",
                format!("working directory {} does not exist", spec.cwd.display()),
            ));
        }
        if !spec.interpreter_exists() {
            issues.push(ConfigIssue::new(
                "interpreter",
                format!("interpreter {} not found", spec.interpreter.display()),
            ));
        }
        if let Some(script) = &spec.script {
            if !script.is_file() {
                issues.push(ConfigIssue::new(
                    "script",
                    format!("script {} not found", script.display()),
                ));
            }
        }
        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                issues.push(ConfigIssue::new(
                    "env",
                    format!("invalid environment variable name {:?}", key),
                ));
            }
        }
        if let Err(reason) = self.backoff.check() {
            issues.push(ConfigIssue::new("backoff", reason));
        }
        issues
    }
}

/// A problem found while validating a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub field: &'static str,
    pub message: String,
}

impl ConfigIssue {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Restart delay policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Same delay before every relaunch.
    Fixed { delay_ms: u64 },
    /// `first_ms × factor^attempt`, capped at `max_ms`.
    Exponential {
        first_ms: u64,
        max_ms: u64,
        factor: f64,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed { delay_ms: 1000 }
    }
}

impl BackoffPolicy {
    /// Computes the delay before relaunch number `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffPolicy::Exponential {
                first_ms,
                max_ms,
                factor,
            } => {
                let max = Duration::from_millis(max_ms);
                let exp = attempt.min(i32::MAX as u32) as i32;
                let secs = Duration::from_millis(first_ms).as_secs_f64() * factor.powi(exp);
                if !secs.is_finite() || secs < 0.0 || secs > max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }

    fn check(&self) -> Result<(), String> {
        match *self {
            BackoffPolicy::Fixed { .. } => Ok(()),
            BackoffPolicy::Exponential {
                first_ms,
                max_ms,
                factor,
            } => {
                if !(factor.is_finite() && factor >= 1.0) {
                    return Err(format!("factor must be >= 1.0, got {}", factor));
                }
                if first_ms > max_ms {
                    return Err(format!("first_ms {} exceeds max_ms {}", first_ms, max_ms));
                }
                Ok(())
            }
        }
    }
}

/// Workspace-wide settings with defaults applied and paths resolved.
#[derive(Debug, Clone)]
pub struct WorkspaceSettings {
    pub base_dir: PathBuf,
    pub log_dir: PathBuf,
    pub max_log_bytes: u64,
    pub max_lines: usize,
    pub sample_interval: Duration,
    pub sample_window: usize,
    pub grace: Duration,
    pub stable: Duration,
}

impl WorkspaceSettings {
    /// Stop grace period for `unit`, honouring its override.
    pub fn grace_for(&self, unit: &UnitConfig) -> Duration {
        unit.grace_ms.map(Duration::from_millis).unwrap_or(self.grace)
    }

    /// Stable-run duration for `unit`, honouring its override.
    pub fn stable_for(&self, unit: &UnitConfig) -> Duration {
        unit.stable_ms
            .map(Duration::from_millis)
            .unwrap_or(self.stable)
    }
}

impl Workspace {
    pub fn settings(&self) -> WorkspaceSettings {
        let log_dir = self
            .log_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));
        WorkspaceSettings {
            base_dir: self.base_dir.clone(),
            log_dir: self.base_dir.join(log_dir),
            max_log_bytes: self.max_log_bytes.unwrap_or(DEFAULT_MAX_LOG_BYTES),
            max_lines: self.max_lines.unwrap_or(DEFAULT_MAX_LINES).max(1),
            sample_interval: Duration::from_millis(
                self.sample_interval_ms
                    .unwrap_or(DEFAULT_SAMPLE_INTERVAL_MS)
                    .max(100),
            ),
            sample_window: self.sample_window.unwrap_or(DEFAULT_SAMPLE_WINDOW).max(1),
            grace: Duration::from_millis(self.grace_ms.unwrap_or(DEFAULT_GRACE_MS)),
            stable: Duration::from_millis(self.stable_ms.unwrap_or(DEFAULT_STABLE_MS)),
        }
    }

    pub fn unit(&self, name: &str) -> Option<&UnitConfig> {
        self.units.iter().find(|u| u.name == name)
    }

    /// Rejects workspaces where two units share a name or a name is not a safe
    /// file name.
    pub fn ensure_valid_names(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for unit in &self.units {
            if let Err(reason) = validate_name(&unit.name) {
                bail!("invalid unit name {:?}: {}", unit.name, reason);
            }
            if !seen.insert(unit.name.as_str()) {
                bail!("duplicate unit name: {}", unit.name);
            }
        }
        Ok(())
    }
}

/// Unit names double as log file names, so they must be safe path components.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("name must not be empty".into());
    }
    if name == "." || name == ".." {
        return Err("name must not be a relative path component".into());
    }
    if name.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
        return Err("name must not contain path separators or control characters".into());
    }
    Ok(())
}

/// Loads and parses the workspace from a file path.
pub fn load_workspace(path: &Path) -> Result<Workspace> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workspace file {}", path.display()))?;
    let mut workspace: Workspace = toml::from_str(&raw)
        .with_context(|| format!("failed to parse workspace file {}", path.display()))?;
    workspace.ensure_valid_names()?;
    workspace.base_dir = base_dir_of(path)?;
    Ok(workspace)
}

/// Writes the workspace back to `path`, replacing the previous file atomically.
pub fn save_workspace(path: &Path, workspace: &Workspace) -> Result<()> {
    let raw = toml::to_string_pretty(workspace).context("failed to serialize workspace")?;
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, raw)
        .with_context(|| format!("failed to write workspace file {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace workspace file {}", path.display()))?;
    Ok(())
}

fn base_dir_of(path: &Path) -> Result<PathBuf> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    match parent {
        Some(dir) => Ok(dir.to_path_buf()),
        None => std::env::current_dir().context("failed to resolve current dir"),
    }
}
