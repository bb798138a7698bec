//! Process handles.
//!
//! A [`ProcessHandle`] wraps one spawned OS process. Spawning starts two pump tasks
//! that read stdout and stderr and hand the raw bytes to an [`OutputSink`], plus a
//! reaper task that is the only thing ever waiting on the child. The reaper collects
//! the exit status, gives the pumps a short window to drain, closes the pipes and then
//! publishes the exit, so a handle is reaped exactly once no matter how many stops,
//! kills or restarts race around it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::UnitConfig;
use crate::error::SpawnError;
use crate::output::StreamKind;
use crate::process::ExitOutcome;

const READ_CHUNK: usize = 8192;
const PIPE_DRAIN: Duration = Duration::from_millis(500);

/// Receives the raw output of a process.
///
/// Calls for one stream are never concurrent with each other; calls for stdout and
/// stderr may be. Implementations may block briefly (they run on the blocking pool).
pub trait OutputSink: Send + Sync + 'static {
    fn on_output(&self, stream: StreamKind, bytes: &[u8]);
    /// The stream reached EOF or its pipe was closed at reap time.
    fn on_closed(&self, stream: StreamKind);
}

/// Fully resolved launch parameters for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub interpreter: PathBuf,
    pub script: Option<PathBuf>,
    pub cwd: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    /// Resolves `config` against `base_dir`.
    ///
    /// The working directory is relative to `base_dir`; the script and any
    /// interpreter given as a relative path with a directory part (such as
    /// `.venv/bin/python`) are relative to the working directory. A bare interpreter
    /// name is left for `PATH` lookup.
    pub fn resolve(config: &UnitConfig, base_dir: &Path) -> Self {
        let cwd = match &config.cwd {
            Some(cwd) => base_dir.join(cwd),
            None => base_dir.to_path_buf(),
        };
        let interpreter = if config.interpreter.is_relative()
            && config.interpreter.components().count() > 1
        {
            cwd.join(&config.interpreter)
        } else {
            config.interpreter.clone()
        };
        let script = config.script.as_ref().map(|script| cwd.join(script));
        Self {
            interpreter,
            script,
            cwd,
            args: config.args.clone(),
            env: config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Whether the interpreter can be found, either at its path or on `PATH`.
    pub fn interpreter_exists(&self) -> bool {
        if self.interpreter.components().count() > 1 {
            return self.interpreter.is_file();
        }
        let Some(paths) = std::env::var_os("PATH") else {
            return false;
        };
        std::env::split_paths(&paths).any(|dir| {
            let candidate = dir.join(&self.interpreter);
            candidate.is_file()
                || (cfg!(windows) && candidate.with_extension("exe").is_file())
        })
    }

    /// Human-readable command line, for logs only. Never executed through a shell.
    pub fn display_command(&self) -> String {
        let mut parts = Vec::with_capacity(2 + self.args.len());
        parts.push(self.interpreter.display().to_string());
        if let Some(script) = &self.script {
            parts.push(script.display().to_string());
        }
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }

    fn check_paths(&self) -> Result<(), SpawnError> {
        if !self.cwd.is_dir() {
            return Err(SpawnError::WorkingDirNotFound {
                path: self.cwd.clone(),
            });
        }
        if self.interpreter.components().count() > 1 && !self.interpreter.exists() {
            return Err(SpawnError::InterpreterNotFound {
                path: self.interpreter.clone(),
            });
        }
        if let Some(script) = &self.script {
            if !script.is_file() {
                return Err(SpawnError::ScriptNotFound {
                    path: script.clone(),
                });
            }
        }
        Ok(())
    }
}

/// One spawned OS process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    started_at: DateTime<Utc>,
    kill_tx: mpsc::Sender<()>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
}

impl ProcessHandle {
    /// Spawns the process described by `spec`, wiring its output into `sink`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(spec: &LaunchSpec, sink: Arc<dyn OutputSink>) -> Result<Self, SpawnError> {
        spec.check_paths()?;

        let mut command = Command::new(&spec.interpreter);
        if let Some(script) = &spec.script {
            command.arg(script);
        }
        command.args(&spec.args);
        command.current_dir(&spec.cwd);
        if !spec.env.is_empty() {
            command.envs(spec.env.iter().map(|(k, v)| (k, v)));
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|err| SpawnError::from_io(spec.interpreter.clone(), err))?;
        let pid = child.id().unwrap_or(0);
        let started_at = Utc::now();

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let pump = tokio::spawn(read_stream(StreamKind::Stdout, stdout, sink.clone()));
            pumps.push((StreamKind::Stdout, pump));
        }
        if let Some(stderr) = child.stderr.take() {
            let pump = tokio::spawn(read_stream(StreamKind::Stderr, stderr, sink.clone()));
            pumps.push((StreamKind::Stderr, pump));
        }

        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Some(()) = kill_rx.recv() => {
                    kill_process_group(pid);
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let outcome = match status {
                Ok(status) => ExitOutcome::from_status(status),
                Err(err) => {
                    warn!(pid, error = %err, "failed to collect exit status");
                    ExitOutcome::default()
                }
            };
            close_pipes(pumps, sink).await;
            debug!(pid, %outcome, "process reaped");
            let _ = exit_tx.send(Some(outcome));
        });

        Ok(Self {
            pid,
            started_at,
            kill_tx,
            exit_rx,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The exit outcome, once the process has been reaped.
    pub fn exit(&self) -> Option<ExitOutcome> {
        *self.exit_rx.borrow()
    }

    /// Asks the process (and its process group) to terminate.
    pub fn signal_terminate(&self) {
        if self.exit().is_some() {
            return;
        }
        send_terminate(self.pid);
    }

    /// Forcefully kills the process. The reaper still collects the exit.
    pub fn kill(&self) {
        let _ = self.kill_tx.try_send(());
    }

    /// Waits until the process has been reaped and its pipes closed.
    ///
    /// Only the calling task is suspended. The returned future does not borrow the
    /// handle and is cancel-safe.
    pub fn wait(&self) -> impl std::future::Future<Output = ExitOutcome> + Send + 'static {
        let mut rx = self.exit_rx.clone();
        async move {
            match rx.wait_for(|exit| exit.is_some()).await {
                Ok(exit) => exit.unwrap_or_default(),
                Err(_) => ExitOutcome::default(),
            }
        }
    }
}

async fn read_stream<R>(stream: StreamKind, mut reader: R, sink: Arc<dyn OutputSink>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let chunk = buffer[..n].to_vec();
        let sink = sink.clone();
        if tokio::task::spawn_blocking(move || sink.on_output(stream, &chunk))
            .await
            .is_err()
        {
            break;
        }
    }
}

// Descendants may keep a pipe open after the main process is gone; stop reading
// after a short drain so the descriptors are released with the handle.
async fn close_pipes(pumps: Vec<(StreamKind, JoinHandle<()>)>, sink: Arc<dyn OutputSink>) {
    for (stream, mut pump) in pumps {
        if tokio::time::timeout(PIPE_DRAIN, &mut pump).await.is_err() {
            pump.abort();
            let _ = pump.await;
        }
        let sink = sink.clone();
        let _ = tokio::task::spawn_blocking(move || sink.on_closed(stream)).await;
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    signal_group(pid, libc::SIGTERM);
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    signal_group(pid, libc::SIGKILL);
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: libc::c_int) {
    if pid == 0 {
        return;
    }
    unsafe {
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(windows)]
fn send_terminate(pid: u32) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // Windows has no SIGTERM; CTRL_BREAK is the closest console signal we can emit.
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(windows)]
fn kill_process_group(_pid: u32) {}

#[cfg(all(not(unix), not(windows)))]
fn send_terminate(_pid: u32) {}

#[cfg(all(not(unix), not(windows)))]
fn kill_process_group(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    use parking_lot::Mutex;

    #[derive(Default)]
    struct Capture {
        bytes: Mutex<Vec<(StreamKind, Vec<u8>)>>,
        closed: Mutex<Vec<StreamKind>>,
    }

    impl OutputSink for Capture {
        fn on_output(&self, stream: StreamKind, bytes: &[u8]) {
            self.bytes.lock().push((stream, bytes.to_vec()));
        }

        fn on_closed(&self, stream: StreamKind) {
            self.closed.lock().push(stream);
        }
    }

    impl Capture {
        fn collected(&self, stream: StreamKind) -> String {
            let bytes: Vec<u8> = self
                .bytes
                .lock()
                .iter()
                .filter(|(s, _)| *s == stream)
                .flat_map(|(_, b)| b.clone())
                .collect();
            String::from_utf8(bytes).unwrap()
        }
    }

    fn sh(script: &str) -> LaunchSpec {
        let mut config = UnitConfig::new("test", "/bin/sh");
        config.args = vec!["-c".into(), script.into()];
        LaunchSpec::resolve(&config, &std::env::temp_dir())
    }

    #[tokio::test]
    async fn captures_both_streams_and_exit_code() {
        let sink = Arc::new(Capture::default());
        let handle = ProcessHandle::spawn(&sh("echo out; echo err >&2; exit 3"), sink.clone())
            .unwrap();
        assert!(handle.pid() > 0);
        let outcome = handle.wait().await;
        assert_eq!(outcome.code, Some(3));
        assert_eq!(handle.exit(), Some(outcome));
        assert_eq!(sink.collected(StreamKind::Stdout), "out\n");
        assert_eq!(sink.collected(StreamKind::Stderr), "err\n");
        assert_eq!(sink.closed.lock().len(), 2);
    }

    #[tokio::test]
    async fn arguments_are_not_shell_interpreted() {
        let sink = Arc::new(Capture::default());
        let mut config = UnitConfig::new("test", "/bin/echo");
        config.args = vec!["$HOME".into(), "a b;c".into()];
        let spec = LaunchSpec::resolve(&config, &std::env::temp_dir());
        let handle = ProcessHandle::spawn(&spec, sink.clone()).unwrap();
        handle.wait().await;
        assert_eq!(sink.collected(StreamKind::Stdout), "$HOME a b;c\n");
    }

    #[tokio::test]
    async fn terminate_then_kill_reaps_stubborn_process() {
        let sink = Arc::new(Capture::default());
        let handle =
            ProcessHandle::spawn(&sh("trap '' TERM; echo ready; sleep 30"), sink.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.signal_terminate();
        let graceful = tokio::time::timeout(Duration::from_millis(300), handle.wait()).await;
        assert!(graceful.is_err());
        handle.kill();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert_eq!(outcome.signal, Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn missing_script_is_a_spawn_error() {
        let sink = Arc::new(Capture::default());
        let mut config = UnitConfig::new("test", "/bin/sh");
        config.script = Some(PathBuf::from("does-not-exist.sh"));
        let spec = LaunchSpec::resolve(&config, &std::env::temp_dir());
        let err = ProcessHandle::spawn(&spec, sink).unwrap_err();
        assert!(matches!(err, SpawnError::ScriptNotFound { .. }));
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_spawn_error() {
        let sink = Arc::new(Capture::default());
        let config = UnitConfig::new("test", "scriptrack-no-such-interpreter");
        let spec = LaunchSpec::resolve(&config, &std::env::temp_dir());
        let err = ProcessHandle::spawn(&spec, sink).unwrap_err();
        assert!(matches!(err, SpawnError::InterpreterNotFound { .. }));
    }

    #[test]
    fn relative_interpreter_resolves_against_cwd() {
        let mut config = UnitConfig::new("bot", ".venv/bin/python");
        config.cwd = Some(PathBuf::from("bots"));
        config.script = Some(PathBuf::from("main.py"));
        let spec = LaunchSpec::resolve(&config, Path::new("/srv"));
        assert_eq!(spec.cwd, PathBuf::from("/srv/bots"));
        assert_eq!(spec.interpreter, PathBuf::from("/srv/bots/.venv/bin/python"));
        assert_eq!(spec.script, Some(PathBuf::from("/srv/bots/main.py")));

        let bare = LaunchSpec::resolve(&UnitConfig::new("x", "python3"), Path::new("/srv"));
        assert_eq!(bare.interpreter, PathBuf::from("python3"));
    }
}
