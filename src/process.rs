//! Child process supervision.
//!
//! Plugins spawn auxiliary GUI processes (VNC listeners, PDF viewers, the
//! camera server) and talk to them over a line protocol. Each spawned child
//! gets three tokio tasks: one line reader per output stream and one watcher
//! that owns the child handle, reaps it on exit or kill, and removes its pid
//! file.
//!
//! Lines are posted to the host event loop as [`Event::ProcessOutput`] and
//! reach the owning plugin's `on_output` callback in per-stream emission
//! order, with line terminators stripped.
//!
//! # Pid files
//!
//! Every child's pid is recorded as `<pid>.pid` under the channel's pid
//! directory. A crashed neopult leaves those behind; [`sweep_stale_pids`]
//! runs at startup and terminates any survivors so a restarted channel
//! never fights a leftover VNC viewer for its windows.

use crate::events::{Event, OutputStream};
use crate::registry::{PluginInstance, ScopedLog};
use anyhow::{Context, Result};
use log::{debug, error, warn};
use mlua::RegistryKey;
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{ChildStdin, Command},
    sync::{broadcast, mpsc, oneshot},
};

const STALE_PROCESS_GRACE_PERIOD: Duration = Duration::from_millis(2500);
const STALE_PROCESS_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything a spawn needs besides the command line itself.
pub struct SpawnContext {
    pub event_tx: Arc<mpsc::Sender<Event>>,
    pub plugin_instance: Arc<PluginInstance>,
    /// Script callback for output lines. Without one, lines are still read
    /// (and logged at debug) so the child never blocks on a full pipe.
    pub on_output: Option<Arc<RegistryKey>>,
    pub pid_dir: PathBuf,
    /// Fired once at shutdown, after the cleanup callbacks ran; the watcher
    /// then kills the child.
    pub kill_all_rx: broadcast::Receiver<()>,
    /// Held by the watcher task; the event loop waits for all clones to
    /// drop before the process exits.
    pub exit_wait_tx: mpsc::Sender<()>,
}

/// A supervised child process.
///
/// Owns the stdin writer and the kill trigger; the child handle itself
/// lives in the watcher task. Killing an already-dead process is a no-op.
#[derive(Debug)]
pub struct SpawnedChild {
    pub cmd: String,
    pub pid: u32,
    pub stdin: ChildStdin,
    kill_tx: Option<oneshot::Sender<()>>,
    plugin_instance: Arc<PluginInstance>,
}

impl SpawnedChild {
    /// Request a SIGKILL for the child. Safe to call on a process that has
    /// already exited or was already killed.
    pub fn kill(&mut self) {
        self.plugin_instance
            .debug(format!("killing process {} (pid {})", self.cmd, self.pid));
        match self.kill_tx.take() {
            Some(kill_tx) => {
                if kill_tx.send(()).is_err() {
                    self.plugin_instance.warn(format!(
                        "tried to kill process {} (pid {}) which already exited",
                        self.cmd, self.pid
                    ));
                }
            }
            None => self.plugin_instance.warn(format!(
                "tried to kill process {} (pid {}) twice",
                self.cmd, self.pid
            )),
        }
    }
}

/// Spawn `cmd` with piped stdio and wire up its reader and watcher tasks.
///
/// Must be called from within a tokio runtime context. The working
/// directory is inherited from the host process.
///
/// # Errors
///
/// Fails when the executable cannot be started (not found, permission
/// denied, fork failure). Nothing is registered in that case.
pub fn spawn(
    cmd: String,
    args: Vec<String>,
    envs: HashMap<String, String>,
    ctx: SpawnContext,
) -> Result<SpawnedChild> {
    let mut child = Command::new(&cmd)
        .args(&args)
        .envs(&envs)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("couldn't spawn process {cmd} with args {args:?}"))?;

    let pid = child.id().context("spawned process has no pid")?;
    ctx.plugin_instance.debug(format!(
        "spawned process {cmd} with args {args:?} (pid {pid})"
    ));

    let stdout = child.stdout.take().expect("stdout was requested piped");
    let stderr = child.stderr.take().expect("stderr was requested piped");
    let stdin = child.stdin.take().expect("stdin was requested piped");

    tokio::spawn(forward_lines(
        stdout,
        OutputStream::Stdout,
        ctx.event_tx.clone(),
        cmd.clone(),
        pid,
        ctx.plugin_instance.clone(),
        ctx.on_output.clone(),
    ));
    tokio::spawn(forward_lines(
        stderr,
        OutputStream::Stderr,
        ctx.event_tx,
        cmd.clone(),
        pid,
        ctx.plugin_instance.clone(),
        ctx.on_output,
    ));

    let pid_file = ctx.pid_dir.join(format!("{pid}.pid"));
    if let Err(e) = fs::File::create(&pid_file) {
        ctx.plugin_instance.error(format!(
            "couldn't create pid file {}: {e}",
            pid_file.display()
        ));
    }

    let (kill_tx, kill_rx) = oneshot::channel();
    tokio::spawn(watch_child(
        child,
        cmd.clone(),
        pid,
        pid_file,
        kill_rx,
        ctx.kill_all_rx,
        ctx.exit_wait_tx,
    ));

    Ok(SpawnedChild {
        cmd,
        pid,
        stdin,
        kill_tx: Some(kill_tx),
        plugin_instance: ctx.plugin_instance,
    })
}

/// Read `source` line by line and post each line to the event loop.
///
/// Line terminators (`\n`, with an optional preceding `\r`) are stripped.
/// Reading continues until the stream closes, even without a callback, so
/// the child never stalls on a full pipe.
pub async fn forward_lines<R>(
    source: R,
    stream: OutputStream,
    event_tx: Arc<mpsc::Sender<Event>>,
    process_name: String,
    pid: u32,
    plugin_instance: Arc<PluginInstance>,
    callback_key: Option<Arc<RegistryKey>>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(source).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                plugin_instance.debug(format!(
                    "process {process_name} (pid {pid}) {} line: {line}",
                    stream.label()
                ));
                let Some(key) = callback_key.as_ref() else {
                    continue;
                };
                let event = Event::ProcessOutput {
                    line,
                    stream,
                    process_name: process_name.clone(),
                    pid,
                    plugin_instance: plugin_instance.clone(),
                    callback_key: key.clone(),
                };
                if event_tx.send(event).await.is_err() {
                    plugin_instance.warn(format!(
                        "event loop is gone, dropping {} of process {process_name}",
                        stream.label()
                    ));
                    return;
                }
            }
            Ok(None) => {
                plugin_instance.debug(format!(
                    "{} of process {process_name} (pid {pid}) closed",
                    stream.label()
                ));
                return;
            }
            Err(e) => {
                plugin_instance.error(format!(
                    "error reading {} of process {process_name} (pid {pid}): {e}",
                    stream.label()
                ));
            }
        }
    }
}

/// Own the child until it exits or a kill is requested.
async fn watch_child(
    mut child: tokio::process::Child,
    cmd: String,
    pid: u32,
    pid_file: PathBuf,
    kill_rx: oneshot::Receiver<()>,
    mut kill_all_rx: broadcast::Receiver<()>,
    exit_wait_tx: mpsc::Sender<()>,
) {
    tokio::select!(
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                error!("killing process {cmd} (pid {pid}) failed: {e}");
            }
            let _ = child.wait().await;
        },
        _ = kill_all_rx.recv() => {
            debug!("shutdown: killing process {cmd} (pid {pid})");
            if let Err(e) = child.kill().await {
                error!("killing process {cmd} (pid {pid}) at shutdown failed: {e}");
            }
            let _ = child.wait().await;
        },
        status = child.wait() => {
            match status {
                Ok(status) => debug!("process {cmd} (pid {pid}) exited with {status}"),
                Err(e) => error!("waiting on process {cmd} (pid {pid}) failed: {e}"),
            }
        },
    );

    if let Err(e) = tokio::fs::remove_file(&pid_file).await {
        warn!("couldn't remove pid file {}: {e}", pid_file.display());
    }
    drop(exit_wait_tx);
}

/// Terminate processes recorded in `pid_dir` by a previous run.
///
/// Each leftover pid gets a SIGINT and a grace period before a SIGKILL.
/// Pid files are removed either way.
pub fn sweep_stale_pids(pid_dir: &Path) {
    let entries = match fs::read_dir(pid_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Err(e) = fs::create_dir_all(pid_dir) {
                error!("couldn't create pid directory {}: {e}", pid_dir.display());
            }
            return;
        }
        Err(e) => {
            error!("couldn't read pid directory {}: {e}", pid_dir.display());
            return;
        }
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        let Some(pid_str) = name.strip_suffix(".pid") else {
            continue;
        };
        match pid_str.parse::<i32>() {
            Ok(pid) if pid > 0 => {
                let pid = Pid::from_raw(pid);
                if signal::kill(pid, None).is_ok() {
                    debug!("process {pid} from a previous run is still alive");
                    terminate_stale_process(pid);
                } else {
                    debug!("process {pid} from a previous run is already gone");
                }
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!("couldn't remove stale pid file {name}: {e}");
                }
            }
            Ok(pid) => warn!("ignoring pid file with non-positive pid {pid}"),
            Err(e) => error!("couldn't parse pid file name {name}: {e}"),
        }
    }
}

fn terminate_stale_process(pid: Pid) {
    if let Err(e) = signal::kill(pid, Signal::SIGINT) {
        warn!("couldn't send SIGINT to stale process {pid}: {e}");
        return;
    }
    let start = Instant::now();
    while start.elapsed() < STALE_PROCESS_GRACE_PERIOD {
        if signal::kill(pid, None).is_err() {
            return;
        }
        thread::sleep(STALE_PROCESS_POLL_INTERVAL);
    }
    debug!("stale process {pid} survived the grace period, sending SIGKILL");
    if let Err(e) = signal::kill(pid, Signal::SIGKILL) {
        warn!("couldn't send SIGKILL to stale process {pid}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use mlua::{Function, Lua};
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn test_instance() -> Arc<PluginInstance> {
        Registry::new()
            .register_instance("test".to_string(), None)
            .expect("instance")
    }

    fn test_callback_key(lua: &Lua) -> Arc<RegistryKey> {
        let f: Function = lua.load("function() end").eval().expect("chunk");
        Arc::new(lua.create_registry_value(f).expect("registry value"))
    }

    fn spawn_context(
        event_tx: Arc<mpsc::Sender<Event>>,
        on_output: Option<Arc<RegistryKey>>,
        pid_dir: &Path,
        kill_all_rx: broadcast::Receiver<()>,
        exit_wait_tx: mpsc::Sender<()>,
    ) -> SpawnContext {
        SpawnContext {
            event_tx,
            plugin_instance: test_instance(),
            on_output,
            pid_dir: pid_dir.to_path_buf(),
            kill_all_rx,
            exit_wait_tx,
        }
    }

    #[tokio::test]
    async fn test_lines_delivered_in_order_with_terminators_stripped() {
        let lua = Lua::new();
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (kill_all_tx, _) = broadcast::channel(1);
        let (exit_wait_tx, _exit_wait_rx) = mpsc::channel(1);
        let pid_dir = TempDir::new().expect("tempdir");

        let _child = spawn(
            "sh".to_string(),
            vec![
                "-c".to_string(),
                r"printf 'one\ntwo\r\nthree\n'".to_string(),
            ],
            HashMap::new(),
            spawn_context(
                Arc::new(event_tx),
                Some(test_callback_key(&lua)),
                pid_dir.path(),
                kill_all_tx.subscribe(),
                exit_wait_tx,
            ),
        )
        .expect("spawn should succeed");

        let mut lines = Vec::new();
        for _ in 0..3 {
            let event = timeout(Duration::from_secs(5), event_rx.recv())
                .await
                .expect("line should arrive")
                .expect("channel open");
            match event {
                Event::ProcessOutput { line, stream, .. } => {
                    assert_eq!(stream, OutputStream::Stdout);
                    lines.push(line);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_stderr_lines_are_delivered() {
        let lua = Lua::new();
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (kill_all_tx, _) = broadcast::channel(1);
        let (exit_wait_tx, _exit_wait_rx) = mpsc::channel(1);
        let pid_dir = TempDir::new().expect("tempdir");

        let _child = spawn(
            "sh".to_string(),
            vec!["-c".to_string(), "echo oops >&2".to_string()],
            HashMap::new(),
            spawn_context(
                Arc::new(event_tx),
                Some(test_callback_key(&lua)),
                pid_dir.path(),
                kill_all_tx.subscribe(),
                exit_wait_tx,
            ),
        )
        .expect("spawn should succeed");

        let event = timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .expect("line should arrive")
            .expect("channel open");
        match event {
            Event::ProcessOutput { line, stream, .. } => {
                assert_eq!(stream, OutputStream::Stderr);
                assert_eq!(line, "oops");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_registers_nothing() {
        let (event_tx, _event_rx) = mpsc::channel(1);
        let (kill_all_tx, _) = broadcast::channel(1);
        let (exit_wait_tx, mut exit_wait_rx) = mpsc::channel(1);
        let pid_dir = TempDir::new().expect("tempdir");

        let result = spawn(
            "/nonexistent/definitely-not-a-binary".to_string(),
            Vec::new(),
            HashMap::new(),
            spawn_context(
                Arc::new(event_tx),
                None,
                pid_dir.path(),
                kill_all_tx.subscribe(),
                exit_wait_tx,
            ),
        );
        assert!(result.is_err());
        // No watcher task holds the wait sender, so the channel closes.
        assert!(timeout(Duration::from_secs(1), exit_wait_rx.recv())
            .await
            .expect("channel should close")
            .is_none());
        assert_eq!(fs::read_dir(pid_dir.path()).expect("read dir").count(), 0);
    }

    #[tokio::test]
    async fn test_kill_reaps_child_and_removes_pid_file() {
        let (event_tx, _event_rx) = mpsc::channel(1);
        let (kill_all_tx, _) = broadcast::channel(1);
        let (exit_wait_tx, mut exit_wait_rx) = mpsc::channel(1);
        let pid_dir = TempDir::new().expect("tempdir");

        let mut child = spawn(
            "sleep".to_string(),
            vec!["30".to_string()],
            HashMap::new(),
            spawn_context(
                Arc::new(event_tx),
                None,
                pid_dir.path(),
                kill_all_tx.subscribe(),
                exit_wait_tx,
            ),
        )
        .expect("spawn should succeed");

        let pid_file = pid_dir.path().join(format!("{}.pid", child.pid));
        assert!(pid_file.exists());

        child.kill();
        // Second kill must be a harmless no-op.
        child.kill();

        // The watcher drops the wait sender once the child is reaped.
        assert!(timeout(Duration::from_secs(5), exit_wait_rx.recv())
            .await
            .expect("watcher should finish")
            .is_none());
        assert!(!pid_file.exists());
    }

    #[test]
    fn test_sweep_creates_missing_pid_dir() {
        let dir = TempDir::new().expect("tempdir");
        let pid_dir = dir.path().join("pids");
        sweep_stale_pids(&pid_dir);
        assert!(pid_dir.is_dir());
    }

    #[test]
    fn test_sweep_removes_dead_pid_files() {
        let dir = TempDir::new().expect("tempdir");
        // Spawn and reap a real process so the pid is known-dead.
        let child = std::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id();
        let mut child = child;
        child.wait().expect("wait");

        let pid_file = dir.path().join(format!("{pid}.pid"));
        fs::File::create(&pid_file).expect("pid file");
        fs::File::create(dir.path().join("not-a-pid.txt")).expect("other file");

        sweep_stale_pids(dir.path());

        assert!(!pid_file.exists());
        assert!(dir.path().join("not-a-pid.txt").exists());
    }
}
