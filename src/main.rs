//! Scriptrack command-line entry point.
//!
//! Parses arguments, installs logging and dispatches to a subcommand: `run`
//! supervises the workspace in the foreground and prints every unit's output with a
//! colored `[name]` prefix; the others inspect or edit the workspace and its logs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

use scriptrack::ansi::Color;
use scriptrack::config::{self, DEFAULT_CONFIG_FILE};
use scriptrack::store::LogFile;
use scriptrack::{
    LogEvent, Metrics, Registry, ResourceSample, SearchQuery, Segment, StreamKind,
    SupervisorEvent, UnitConfig, UnitState, Workspace,
};

/// How often `logs --follow` checks the log file for new records.
const FOLLOW_POLL: Duration = Duration::from_millis(250);

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "scriptrack",
    version,
    about = "Supervise a workspace of long-running scripts",
    styles = help_styles(),
    color = clap::ColorChoice::Always
)]
struct Cli {
    /// Path to the workspace file (defaults to ./scriptrack.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start units and stream their output until interrupted.
    Run {
        /// Only run these units (repeatable).
        #[arg(long = "unit")]
        units: Vec<String>,
        /// Time to wait after a terminate signal before killing (ms).
        #[arg(long)]
        grace_ms: Option<u64>,
        /// Prepend elapsed time to each line.
        #[arg(long)]
        timestamp: bool,
        /// Print CPU and memory samples.
        #[arg(long)]
        stats: bool,
        /// Print output without colors.
        #[arg(long)]
        no_color: bool,
    },
    /// Validate the workspace and report problems.
    Check,
    /// Print a unit's stored log history.
    Logs {
        name: String,
        /// First sequence number to print.
        #[arg(long)]
        from: Option<u64>,
        /// Last sequence number to print.
        #[arg(long)]
        to: Option<u64>,
        /// Print only the most recent N lines.
        #[arg(long, conflicts_with_all = ["from", "to"])]
        last: Option<u64>,
        /// Print bare text, without sequence numbers or timestamps.
        #[arg(long)]
        plain: bool,
        /// Keep printing new lines as they are written.
        #[arg(long, short, conflicts_with = "to")]
        follow: bool,
    },
    /// Search a unit's stored log history.
    Search {
        name: String,
        query: String,
        /// Treat the query as a regular expression.
        #[arg(long)]
        regex: bool,
    },
    /// Discard a unit's stored log history.
    Clear { name: String },
    /// Add a unit to the workspace.
    Add {
        name: String,
        /// Interpreter or executable to launch.
        #[arg(long)]
        interpreter: PathBuf,
        /// Script passed to the interpreter.
        #[arg(long)]
        script: Option<PathBuf>,
        /// Working directory, relative to the workspace file.
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Relaunch the unit when it crashes.
        #[arg(long)]
        auto_restart: bool,
        /// Environment entries (KEY=VALUE, repeatable).
        #[arg(long, value_parser = split_env)]
        env: Vec<(String, String)>,
        /// Arguments passed after the script.
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Remove a unit from the workspace.
    Remove { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let path = workspace_path(&cli);
    match cli.command {
        Commands::Run {
            units,
            grace_ms,
            timestamp,
            stats,
            no_color,
        } => {
            let options = RunOptions {
                units,
                grace_ms,
                timestamp,
                stats,
                color: !no_color,
            };
            run(&path, options).await
        }
        Commands::Check => check(&path),
        Commands::Logs {
            name,
            from,
            to,
            last,
            plain,
            follow,
        } => logs(&path, &name, from, to, last, plain, follow).await,
        Commands::Search { name, query, regex } => search(&path, &name, &query, regex),
        Commands::Clear { name } => {
            open_log(&path, &name)?.clear()?;
            println!("cleared log history for {}", name);
            Ok(())
        }
        Commands::Add {
            name,
            interpreter,
            script,
            cwd,
            auto_restart,
            env,
            args,
        } => {
            let mut unit = UnitConfig::new(name, interpreter);
            unit.script = script;
            unit.cwd = cwd;
            unit.auto_restart = auto_restart;
            unit.env = env.into_iter().collect();
            unit.args = args;
            add(&path, unit)
        }
        Commands::Remove { name } => remove(&path, &name),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SCRIPTRACK_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn workspace_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Options for the `run` subcommand, merged over the workspace settings.
#[derive(Debug, Clone)]
struct RunOptions {
    units: Vec<String>,
    grace_ms: Option<u64>,
    timestamp: bool,
    stats: bool,
    color: bool,
}

async fn run(path: &Path, options: RunOptions) -> Result<()> {
    let mut workspace = config::load_workspace(path)?;
    if let Some(grace_ms) = options.grace_ms {
        workspace.grace_ms = Some(grace_ms);
    }
    let registry = Registry::new(workspace, Some(path.to_path_buf()))
        .with_context(|| format!("failed to open workspace {}", path.display()))?;

    let all = registry.unit_names().await;
    let selected = if options.units.is_empty() {
        all
    } else {
        for name in &options.units {
            if !all.contains(name) {
                registry.shutdown().await;
                bail!("unknown unit: {}", name);
            }
        }
        options.units.clone()
    };
    if selected.is_empty() {
        registry.shutdown().await;
        bail!("no units defined in {}", path.display());
    }

    let printer = Printer::new(&selected, options.timestamp, options.color);
    let (line_tx, mut line_rx) = mpsc::channel::<LogEvent>(1024);
    for name in &selected {
        let log = registry.log(name).await?;
        let mut tail = log.tail(log.next_seq());
        let tx = line_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = tail.next().await {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(line_tx);

    let mut events = registry.subscribe_events();
    let mut samples = registry.subscribe_samples();
    let (signal_tx, mut signal_rx) = mpsc::channel(1);
    spawn_signal_listener(signal_tx);

    for name in &selected {
        if let Ok(status) = registry.get_status(name).await {
            for issue in &status.issues {
                printer.note(name, &format!("config issue: {}", issue));
            }
        }
        if let Err(err) = registry.start(name).await {
            printer.note(name, &err.to_string());
        }
    }

    let mut failed = HashSet::new();
    let mut interrupted = false;
    let mut done = all_stopped(&registry, &selected).await;
    while !done {
        tokio::select! {
            Some(event) = line_rx.recv() => printer.line(&event),
            event = events.recv() => match event {
                Ok(event) => {
                    if matches!(event, SupervisorEvent::TerminalFailure { .. } | SupervisorEvent::SpawnFailed { .. }) {
                        failed.insert(event.unit().to_string());
                    }
                    if selected.iter().any(|name| name == event.unit()) {
                        if let Some(message) = describe_event(&event) {
                            printer.note(event.unit(), &message);
                        }
                    }
                    done = all_stopped(&registry, &selected).await;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            sample = samples.recv(), if options.stats => {
                if let Ok(sample) = sample {
                    printer.note(&sample.unit, &describe_sample(&sample));
                }
            }
            Some(signal) = signal_rx.recv() => {
                printer.note_global(&format!("received {}, stopping units", signal));
                interrupted = true;
                break;
            }
        }
    }

    let report = registry.stop_all().await;
    if !report.is_ok() {
        printer.note_global(&format!("stop: {}", report));
    }
    // Flush output that was produced right before the units went away.
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), line_rx.recv()).await {
        printer.line(&event);
    }
    registry.shutdown().await;

    if !interrupted && !failed.is_empty() {
        let mut names: Vec<_> = failed.into_iter().collect();
        names.sort();
        return Err(anyhow!("units failed: {}", names.join(", ")));
    }
    Ok(())
}

async fn all_stopped(registry: &Registry, selected: &[String]) -> bool {
    registry
        .statuses()
        .await
        .iter()
        .filter(|status| selected.contains(&status.name))
        .all(|status| status.state == UnitState::Stopped)
}

fn check(path: &Path) -> Result<()> {
    let workspace = config::load_workspace(path)?;
    let mut invalid = 0;
    for unit in &workspace.units {
        let issues = unit.validate(&workspace.base_dir);
        if issues.is_empty() {
            println!("ok      {}", unit.name);
            continue;
        }
        invalid += 1;
        println!("invalid {}", unit.name);
        for issue in issues {
            println!("        {}", issue);
        }
    }
    if invalid > 0 {
        bail!("{} of {} units are invalid", invalid, workspace.units.len());
    }
    Ok(())
}

// Opens a unit's log for reading. A running `scriptrack run` may own the file, so it
// is never recovered or truncated from here.
fn open_log(path: &Path, name: &str) -> Result<LogFile> {
    let workspace = config::load_workspace(path)?;
    if workspace.unit(name).is_none() {
        bail!("unknown unit: {}", name);
    }
    Ok(LogFile::open(&workspace.settings().log_dir, name)?)
}

async fn logs(
    path: &Path,
    name: &str,
    from: Option<u64>,
    to: Option<u64>,
    last: Option<u64>,
    plain: bool,
    follow: bool,
) -> Result<()> {
    let log = open_log(path, name)?;
    let mut printed = from.unwrap_or(1).saturating_sub(1);
    let events: Box<dyn Iterator<Item = LogEvent>> = match last {
        Some(last) => Box::new(log.latest(usize::try_from(last).unwrap_or(usize::MAX))?.into_iter()),
        None => {
            let end = to.map(|to| to.saturating_add(1)).unwrap_or(u64::MAX);
            Box::new(log.iter(from.unwrap_or(1)..end, None)?)
        }
    };
    for event in events {
        printed = printed.max(event.seq);
        print_stored(&event, plain);
    }
    if !follow {
        return Ok(());
    }

    let mut follower = log.follow(printed);
    let (signal_tx, mut signal_rx) = mpsc::channel(1);
    spawn_signal_listener(signal_tx);
    let mut ticker = tokio::time::interval(FOLLOW_POLL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let events = follower
                    .poll()
                    .with_context(|| format!("failed to read log for {}", name))?;
                for event in events {
                    print_stored(&event, plain);
                }
            }
            _ = signal_rx.recv() => break,
        }
    }
    Ok(())
}

fn search(path: &Path, name: &str, query: &str, regex: bool) -> Result<()> {
    let query = if regex {
        SearchQuery::pattern(query)?
    } else {
        SearchQuery::substring(query)
    };
    let log = open_log(path, name)?;
    let mut hits = 0usize;
    for event in log.iter(0..u64::MAX, Some(query))? {
        hits += 1;
        print_stored(&event, false);
    }
    eprintln!("{} matching lines", hits);
    Ok(())
}

// Workspace edits go straight to the file; the logs of a running `run` are left alone.
fn add(path: &Path, unit: UnitConfig) -> Result<()> {
    if !path.exists() {
        config::save_workspace(path, &Workspace::default())
            .with_context(|| format!("failed to create workspace {}", path.display()))?;
    }
    let mut workspace = config::load_workspace(path)?;
    config::validate_name(&unit.name)
        .map_err(|reason| anyhow!("invalid unit name {:?}: {}", unit.name, reason))?;
    if workspace.unit(&unit.name).is_some() {
        bail!("unit already exists: {}", unit.name);
    }
    let name = unit.name.clone();
    let issues = unit.validate(&workspace.base_dir);
    workspace.units.push(unit);
    config::save_workspace(path, &workspace)?;
    println!("added {}", name);
    for issue in issues {
        println!("warning: {}", issue);
    }
    Ok(())
}

fn remove(path: &Path, name: &str) -> Result<()> {
    let mut workspace = config::load_workspace(path)?;
    let before = workspace.units.len();
    workspace.units.retain(|unit| unit.name != name);
    if workspace.units.len() == before {
        bail!("unknown unit: {}", name);
    }
    config::save_workspace(path, &workspace)?;
    println!("removed {}", name);
    Ok(())
}

fn print_stored(event: &LogEvent, plain: bool) {
    if plain {
        println!("{}", event.text());
        return;
    }
    let stream = match event.stream {
        StreamKind::Stdout => "out",
        StreamKind::Stderr => "err",
    };
    println!(
        "{:>6} {} {} {}",
        event.seq,
        event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
        stream,
        render_segments(&event.segments, true)
    );
}

/// Formats unit output for the terminal.
struct Printer {
    width: usize,
    names: Vec<String>,
    timestamp: bool,
    color: bool,
    start: Instant,
}

const PREFIX_COLORS: [&str; 6] = ["cyan", "green", "yellow", "magenta", "blue", "red"];

impl Printer {
    fn new(names: &[String], timestamp: bool, color: bool) -> Self {
        let width = names.iter().map(|n| n.chars().count()).max().unwrap_or(0) + 2;
        Self {
            width,
            names: names.to_vec(),
            timestamp,
            color,
            start: Instant::now(),
        }
    }

    fn line(&self, event: &LogEvent) {
        println!(
            "{}{}",
            self.format_prefix(&event.unit),
            render_segments(&event.segments, self.color)
        );
    }

    fn note(&self, name: &str, message: &str) {
        let text = format!("\u{bb} {}", message);
        let text = if self.color {
            format!("\u{1b}[2m{}\u{1b}[0m", text)
        } else {
            text
        };
        println!("{}{}", self.format_prefix(name), text);
    }

    fn note_global(&self, message: &str) {
        eprintln!("scriptrack: {}", message);
    }

    fn format_prefix(&self, name: &str) -> String {
        let index = self.names.iter().position(|n| n == name).unwrap_or(0);
        let prefix = apply_prefix_length(format!("[{}]", name), Some(self.width));
        let mut prefix = if self.color {
            apply_color(&prefix, Some(PREFIX_COLORS[index % PREFIX_COLORS.len()]))
        } else {
            prefix
        };
        if self.timestamp {
            prefix = format!("{} {}", self.elapsed(), prefix);
        }
        prefix.push(' ');
        prefix
    }

    fn elapsed(&self) -> String {
        let secs = self.start.elapsed().as_secs();
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }
}

fn describe_event(event: &SupervisorEvent) -> Option<String> {
    match event {
        SupervisorEvent::Spawned { pid, .. } => Some(format!("started (pid {})", pid)),
        SupervisorEvent::Exited { outcome, class, .. } => {
            Some(format!("exited with {} ({:?})", outcome, class).to_lowercase())
        }
        SupervisorEvent::RestartScheduled {
            attempt,
            max,
            delay,
            ..
        } => Some(format!(
            "restarting in {}ms (attempt {}/{})",
            delay.as_millis(),
            attempt,
            max
        )),
        SupervisorEvent::TerminalFailure { attempts, .. } => Some(format!(
            "gave up after {} consecutive crashes",
            attempts
        )),
        SupervisorEvent::SpawnFailed { error, .. } => Some(format!("failed to start: {}", error)),
        SupervisorEvent::StateChanged { .. } => None,
    }
}

fn describe_sample(sample: &ResourceSample) -> String {
    match &sample.metrics {
        Metrics::Usage {
            cpu_percent,
            rss_bytes,
        } => format!("cpu {:.1}% mem {}", cpu_percent, format_bytes(*rss_bytes)),
        Metrics::Unavailable { reason } => format!("metrics unavailable: {}", reason),
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Re-encodes decoded segments as SGR sequences, or as plain text without color.
fn render_segments(segments: &[Segment], color: bool) -> String {
    let mut out = String::new();
    for segment in segments {
        let mut codes = Vec::new();
        if color {
            if segment.bold {
                codes.push("1".to_string());
            }
            if segment.underline {
                codes.push("4".to_string());
            }
            if let Some(fg) = segment.fg {
                codes.push(color_code(fg));
            }
        }
        if codes.is_empty() {
            out.push_str(&segment.text);
        } else {
            out.push_str(&format!("\u{1b}[{}m{}\u{1b}[0m", codes.join(";"), segment.text));
        }
    }
    out
}

fn color_code(color: Color) -> String {
    let code = match color {
        Color::Black => "30",
        Color::Red => "31",
        Color::Green => "32",
        Color::Yellow => "33",
        Color::Blue => "34",
        Color::Magenta => "35",
        Color::Cyan => "36",
        Color::Gray => "37",
        Color::DarkGray => "90",
        Color::LightRed => "91",
        Color::LightGreen => "92",
        Color::LightYellow => "93",
        Color::LightBlue => "94",
        Color::LightMagenta => "95",
        Color::LightCyan => "96",
        Color::White => "97",
        Color::Indexed(index) => return format!("38;5;{}", index),
        Color::Rgb(r, g, b) => return format!("38;2;{};{};{}", r, g, b),
    };
    code.to_string()
}

fn spawn_signal_listener(tx: mpsc::Sender<&'static str>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = tx.send("SIGINT").await;
                }
                _ = sigterm.recv() => {
                    let _ = tx.send("SIGTERM").await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx.send("Ctrl-C").await;
        }
    });
}

fn split_env(value: &str) -> Result<(String, String)> {
    let (key, val) = value
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid env {}, expected KEY=VALUE", value))?;
    Ok((key.to_string(), val.to_string()))
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

fn apply_prefix_length(prefix: String, length: Option<usize>) -> String {
    let Some(length) = length else { return prefix };
    let mut out = prefix;
    let len = out.chars().count();
    if len < length {
        out.push_str(&" ".repeat(length - len));
    }
    out
}

fn apply_color(prefix: &str, color: Option<&str>) -> String {
    let code = match color.unwrap_or("").to_lowercase().as_str() {
        "black" => "30",
        "red" => "31",
        "green" => "32",
        "yellow" => "33",
        "blue" => "34",
        "magenta" => "35",
        "cyan" => "36",
        "gray" | "grey" => "90",
        _ => "0",
    };
    if code == "0" {
        prefix.to_string()
    } else {
        format!("\u{1b}[{}m{}\u{1b}[0m", code, prefix)
    }
}
