//! Engine process lifecycle: spawn, probe, signal, reap.

use crate::config::EngineConfig;
use crate::error::EngineError;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

/// Interval between monitor-port readiness probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);
/// Total time the monitor port gets to come up.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);
/// Interval at which the background watcher polls for the exit status.
const WATCH_INTERVAL: Duration = Duration::from_millis(100);
/// How much captured engine output to keep, per stream.
const CAPTURE_CAP: usize = 16 * 1024;

/// Allocate a free TCP port on the loopback interface.
pub fn find_free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// A running engine process and the endpoints allocated for it.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    pub pid: u32,
    /// TCP port of the engine's text console.
    pub monitor_port: u16,
    /// TCP port the engine logs to.
    pub log_port: u16,
    /// Port reserved for analyzer socket terminals (`tweak/socket`).
    pub analyzer_port: u16,
    /// Present when a gdb binary was configured on the CLI.
    pub gdb_port: Option<u16>,
    pub cwd: PathBuf,
}

/// Lifecycle events published by the supervisor's watcher.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Exited {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Owns at most one engine child process and all of its endpoints.
///
/// The background watcher is the only place the child is reaped, so the
/// exit event has exactly one source regardless of who initiated the
/// termination.
pub struct EngineSupervisor {
    config: EngineConfig,
    child: Arc<Mutex<Option<Child>>>,
    handle: Arc<Mutex<Option<EngineHandle>>>,
    stdout_tail: Arc<Mutex<Vec<u8>>>,
    stderr_tail: Arc<Mutex<Vec<u8>>>,
    events: mpsc::Sender<EngineEvent>,
}

impl EngineSupervisor {
    /// Create a supervisor that publishes lifecycle events on `events`.
    pub fn new(config: EngineConfig, events: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            config,
            child: Arc::new(Mutex::new(None)),
            handle: Arc::new(Mutex::new(None)),
            stdout_tail: Arc::new(Mutex::new(Vec::new())),
            stderr_tail: Arc::new(Mutex::new(Vec::new())),
            events,
        }
    }

    /// Launch the engine and wait until its monitor port accepts
    /// connections (probed every 100 ms, for up to 10 s).
    pub async fn spawn(&self, cwd: &Path, gui: bool) -> Result<EngineHandle, EngineError> {
        if self.handle.lock().await.is_some() {
            return Err(EngineError::Busy);
        }

        let monitor_port = find_free_port()?;
        let log_port = find_free_port()?;
        let analyzer_port = find_free_port()?;
        let gdb_port = match self.config.gdb_binary {
            Some(_) => Some(find_free_port()?),
            None => None,
        };

        let mut command = Command::new(&self.config.binary);
        command
            .args(engine_arguments(cwd, monitor_port, log_port, gdb_port, gui))
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            binary = %self.config.binary.display(),
            monitor_port,
            log_port,
            gui,
            cwd = %cwd.display(),
            "spawning engine"
        );
        let mut child = command
            .spawn()
            .map_err(|e| EngineError::SpawnFailed(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| EngineError::SpawnFailed("engine exited before startup".into()))?;

        self.stdout_tail.lock().await.clear();
        self.stderr_tail.lock().await.clear();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(capture_stream(stdout, "stdout", Arc::clone(&self.stdout_tail)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(capture_stream(stderr, "stderr", Arc::clone(&self.stderr_tail)));
        }

        let handle = EngineHandle {
            pid,
            monitor_port,
            log_port,
            analyzer_port,
            gdb_port,
            cwd: cwd.to_path_buf(),
        };
        *self.child.lock().await = Some(child);
        *self.handle.lock().await = Some(handle.clone());
        self.spawn_watcher();

        // Block until the monitor socket is accepting connections.
        let start = Instant::now();
        loop {
            if TcpStream::connect(("127.0.0.1", monitor_port)).await.is_ok() {
                tracing::info!(
                    pid,
                    monitor_port,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "engine ready"
                );
                return Ok(handle);
            }
            if self.handle.lock().await.is_none() {
                // the watcher saw the process die during startup
                let tail = self.stderr_tail().await;
                tracing::warn!(pid, "engine exited during startup");
                return Err(EngineError::SpawnFailed(tail));
            }
            if start.elapsed() >= PROBE_TIMEOUT {
                tracing::warn!(pid, monitor_port, "monitor port never came up");
                self.abort_startup().await;
                return Err(EngineError::SpawnTimeout);
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }

    /// Terminate the engine gracefully: SIGTERM, a 2 s grace period, then
    /// SIGKILL. The watcher reaps the child and publishes the exit event.
    pub async fn kill(&self) -> Result<(), EngineError> {
        let pid = match self.handle.lock().await.as_ref() {
            Some(handle) => handle.pid,
            None => return Err(EngineError::NotRunning),
        };

        tracing::info!(pid, "terminating engine");
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if self.wait_reaped(KILL_GRACE).await {
            return Ok(());
        }

        tracing::warn!(pid, "engine ignored SIGTERM, escalating to SIGKILL");
        if let Some(child) = self.child.lock().await.as_mut() {
            let _ = child.start_kill();
        }
        if !self.wait_reaped(KILL_GRACE).await {
            tracing::error!(pid, "engine still not reaped after SIGKILL");
        }
        Ok(())
    }

    /// Snapshot of the current engine handle, if one is alive.
    pub async fn handle(&self) -> Option<EngineHandle> {
        self.handle.lock().await.clone()
    }

    /// Whether an engine process is currently alive.
    pub async fn is_running(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Tail of the engine's captured stderr, for spawn failure reporting.
    pub async fn stderr_tail(&self) -> String {
        String::from_utf8_lossy(&self.stderr_tail.lock().await).into_owned()
    }

    /// Poll until the watcher has cleared the handle or `limit` elapses.
    async fn wait_reaped(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if self.handle.lock().await.is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    /// Kill and reap inline during a failed startup; no exit event is
    /// published for an engine that never became ready.
    async fn abort_startup(&self) {
        let child = self.child.lock().await.take();
        *self.handle.lock().await = None;
        if let Some(mut child) = child {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    fn spawn_watcher(&self) {
        let child_slot = Arc::clone(&self.child);
        let handle_slot = Arc::clone(&self.handle);
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(WATCH_INTERVAL).await;
                let status = {
                    let mut guard = child_slot.lock().await;
                    let Some(child) = guard.as_mut() else {
                        // startup abort already cleaned up
                        return;
                    };
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            *guard = None;
                            Some(status)
                        }
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::error!(error = %e, "engine wait failed");
                            *guard = None;
                            None
                        }
                    }
                };
                *handle_slot.lock().await = None;
                let (exit_code, signal) = match status {
                    Some(status) => (status.code(), status.signal()),
                    None => (None, None),
                };
                tracing::info!(?exit_code, ?signal, "engine exited");
                let _ = events.send(EngineEvent::Exited { exit_code, signal }).await;
                return;
            }
        });
    }
}

/// Stable argument set for the engine binary: monitor and log ports, the
/// workspace search path, the GDB port when one was allocated, and the
/// windowing suppression flags unless a GUI was requested.
fn engine_arguments(
    cwd: &Path,
    monitor_port: u16,
    log_port: u16,
    gdb_port: Option<u16>,
    gui: bool,
) -> Vec<String> {
    let mut args = vec![
        "-P".to_string(),
        monitor_port.to_string(),
        "-e".to_string(),
        format!("logN {log_port}"),
        "-e".to_string(),
        format!("path add @{}", cwd.display()),
    ];
    if let Some(gdb_port) = gdb_port {
        args.push("--gdb-port".to_string());
        args.push(gdb_port.to_string());
    }
    if !gui {
        args.extend(
            ["--hide-monitor", "--hide-log", "--hide-analyzers", "--disable-xwt"]
                .map(String::from),
        );
    }
    args
}

async fn capture_stream(
    stream: impl tokio::io::AsyncRead + Unpin,
    name: &'static str,
    tail: Arc<Mutex<Vec<u8>>>,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(stream = name, %line, "engine output");
        let mut buf = tail.lock().await;
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        if buf.len() > CAPTURE_CAP {
            let cut = buf.len() - CAPTURE_CAP;
            buf.drain(..cut);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_arguments_bind_gdb_port_when_allocated() {
        let cwd = Path::new("/work/demo");
        let args = engine_arguments(cwd, 29170, 29171, Some(3333), false);
        assert_eq!(args[0..2], ["-P".to_string(), "29170".to_string()]);
        assert!(args.contains(&"logN 29171".to_string()));
        let gdb_flag = args.iter().position(|a| a == "--gdb-port").unwrap();
        assert_eq!(args[gdb_flag + 1], "3333");
        assert!(args.contains(&"--disable-xwt".to_string()));
    }

    #[test]
    fn test_engine_arguments_without_gdb_or_gui_suppression() {
        let args = engine_arguments(Path::new("/work"), 1000, 1001, None, true);
        assert!(!args.iter().any(|a| a == "--gdb-port"));
        assert!(!args.iter().any(|a| a == "--hide-monitor"));
        assert!(!args.iter().any(|a| a == "--disable-xwt"));
    }

    #[test]
    fn test_find_free_port_yields_bindable_port() {
        let port = find_free_port().unwrap();
        assert!(port > 0);
        // the port is free again once the probe listener is dropped
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[tokio::test]
    async fn test_kill_without_engine_is_not_running() {
        let (tx, _rx) = mpsc::channel(4);
        let supervisor = EngineSupervisor::new(EngineConfig::new("/bin/false"), tx);
        assert!(matches!(
            supervisor.kill().await,
            Err(EngineError::NotRunning)
        ));
        assert!(!supervisor.is_running().await);
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_stderr() {
        // A binary that exits immediately never opens the monitor port; the
        // watcher notices the exit and spawn reports the failure.
        let (tx, _rx) = mpsc::channel(4);
        let supervisor = EngineSupervisor::new(EngineConfig::new("/bin/false"), tx);
        let cwd = std::env::temp_dir();
        let err = supervisor.spawn(&cwd, false).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::SpawnFailed(_) | EngineError::SpawnTimeout
        ));
        assert!(!supervisor.is_running().await);
    }
}
