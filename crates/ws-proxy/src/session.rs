//! Control session: the per-workspace JSON-RPC dispatcher.
//!
//! Every request spawns its own task with a deadline; responses and
//! events interleave on a single writer task that owns the WS sink.
//! Actions that mutate engine state share one mutex per session, while
//! filesystem work runs freely alongside them.

use crate::state::ProxyState;
use axum::extract::ws::{Message, WebSocket};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use proxy_engine::{
    find_free_port, EngineEvent, EngineSupervisor, MonitorClient, DEFAULT_COMMAND_TIMEOUT,
    EXEC_MONITOR_TIMEOUT,
};
use proxy_fs::{FsService, SandboxRoot};
use proxy_protocol::{
    CommandParams, ErrorKind, Event, ExecMonitorParams, ExecRenodeParams, FsParams, KillParams,
    ProtocolVersion, Request, Response, SpawnParams, StatusParams, TweakParams, PROTOCOL_VERSION,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Deadline for most requests.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(60_000);
/// Deadline for `spawn`: the monitor probe window plus slack.
const SPAWN_REQUEST_TIMEOUT: Duration = Duration::from_millis(10_500);
/// Deadline for `exec-monitor`.
const EXEC_MONITOR_REQUEST_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Events are best-effort: dropped if the control WS stays backed up
/// this long.
const EVENT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);
/// Outbound frame queue between request tasks and the WS writer.
const OUTBOUND_QUEUE: usize = 256;

/// Session lifecycle, gating which actions are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Connected,
    EngineStarting,
    EngineRunning,
    EngineDown,
    Closed,
}

impl SessionPhase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::EngineStarting => "engine-starting",
            Self::EngineRunning => "engine-running",
            Self::EngineDown => "engine-down",
            Self::Closed => "closed",
        }
    }
}

struct ControlSession {
    workspace: String,
    state: Arc<ProxyState>,
    fs: FsService,
    supervisor: EngineSupervisor,
    /// Serializes spawn/kill/exec-* within the session.
    engine_lock: tokio::sync::Mutex<()>,
    /// Serializes access to the engine's monitor port.
    monitor_lock: tokio::sync::Mutex<()>,
    phase: std::sync::Mutex<SessionPhase>,
    outbound: mpsc::Sender<String>,
    pending: std::sync::Mutex<HashMap<u64, Option<AbortHandle>>>,
    cancel: CancellationToken,
    events_dropped: AtomicU64,
    created_at: DateTime<Utc>,
}

/// Accept a control WebSocket for `workspace` and run it to completion.
pub async fn run(state: Arc<ProxyState>, workspace: String, socket: WebSocket) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let Some(cancel) = state.register_session(&workspace) else {
        tracing::warn!(workspace, "workspace already has an active session");
        reject(&mut ws_sink, ErrorKind::Busy).await;
        return;
    };

    let root = match state.session_root(&workspace) {
        Ok(root) => root,
        Err(e) => {
            tracing::warn!(workspace, error = %e, "workspace root rejected");
            reject(&mut ws_sink, e.kind()).await;
            state.release_session(&workspace);
            return;
        }
    };
    let sandbox = match SandboxRoot::open(&root) {
        Ok(sandbox) => sandbox,
        Err(e) => {
            tracing::error!(workspace, error = %e, "workspace root unusable");
            reject(&mut ws_sink, ErrorKind::Io).await;
            state.release_session(&workspace);
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let (engine_tx, mut engine_rx) = mpsc::channel::<EngineEvent>(8);
    let session = Arc::new(ControlSession {
        fs: FsService::new(sandbox, state.staging.clone()),
        supervisor: EngineSupervisor::new(state.config.engine.clone(), engine_tx),
        workspace: workspace.clone(),
        state: Arc::clone(&state),
        engine_lock: tokio::sync::Mutex::new(()),
        monitor_lock: tokio::sync::Mutex::new(()),
        phase: std::sync::Mutex::new(SessionPhase::Connected),
        outbound: out_tx,
        pending: std::sync::Mutex::new(HashMap::new()),
        cancel,
        events_dropped: AtomicU64::new(0),
        created_at: Utc::now(),
    });
    tracing::info!(workspace, root = %root.display(), "control session started");

    // Sole owner of the WS sink.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    // Engine lifecycle events surface on the control channel.
    let lifecycle = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            while let Some(EngineEvent::Exited { exit_code, signal }) = engine_rx.recv().await {
                tracing::info!(
                    workspace = %session.workspace,
                    ?exit_code,
                    ?signal,
                    "engine quit"
                );
                session.set_phase(SessionPhase::EngineDown);
                session.state.release_engine_endpoints(&session.workspace);
                session.emit_event("renode-quitted", json!({})).await;
            }
        })
    };

    // Dispatcher loop: one task per incoming request.
    loop {
        let frame = tokio::select! {
            _ = session.cancel.cancelled() => break,
            frame = ws_stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => session.accept_frame(text.to_string()),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {
                // binary frames are reserved for TCP bridges
                tracing::debug!(workspace = %session.workspace, "ignoring non-text control frame");
            }
            Some(Err(e)) => {
                tracing::warn!(workspace = %session.workspace, error = %e, "control socket error");
                break;
            }
        }
    }

    session.shutdown().await;
    lifecycle.abort();
    drop(session);
    let _ = writer.await;
    tracing::info!(workspace, "control session closed");
}

async fn reject(sink: &mut SplitSink<WebSocket, Message>, kind: ErrorKind) {
    let frame = Response::failure(None, kind).to_json();
    let _ = sink.send(Message::Text(frame.into())).await;
    let _ = sink.close().await;
}

impl ControlSession {
    /// Validate an incoming frame and launch its handler task.
    fn accept_frame(self: &Arc<Self>, text: String) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let request = match Request::from_json(&text) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(error = %e, "rejecting malformed envelope");
                    session
                        .send_response(Response::failure(
                            Request::peek_id(&text),
                            ErrorKind::BadRequest,
                        ))
                        .await;
                    return;
                }
            };
            let id = request.id;

            match request.version.parse::<ProtocolVersion>() {
                Ok(requested) if PROTOCOL_VERSION.accepts(requested) => {}
                _ => {
                    tracing::warn!(id, version = %request.version, "version mismatch");
                    session
                        .send_response(Response::failure(Some(id), ErrorKind::VersionMismatch))
                        .await;
                    return;
                }
            }

            // exactly one waiter per id
            let duplicate = {
                let mut pending = session.pending.lock().expect("pending map poisoned");
                if pending.contains_key(&id) {
                    true
                } else {
                    pending.insert(id, None);
                    false
                }
            };
            if duplicate {
                tracing::warn!(id, "duplicate in-flight request id");
                session
                    .send_response(Response::failure(Some(id), ErrorKind::BadRequest))
                    .await;
                return;
            }

            let worker = {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    let limit = action_timeout(&request.action);
                    let action = request.action.clone();
                    let response =
                        match tokio::time::timeout(limit, Arc::clone(&session).dispatch(request))
                            .await
                        {
                            Ok(Ok(data)) => Response::success(id, data),
                            Ok(Err(kind)) => Response::failure(Some(id), kind),
                            Err(_) => {
                                tracing::warn!(id, action = %action, "request timed out");
                                Response::failure(Some(id), ErrorKind::Timeout)
                            }
                        };
                    session.pending.lock().expect("pending map poisoned").remove(&id);
                    session.send_response(response).await;
                })
            };
            if let Some(slot) = session
                .pending
                .lock()
                .expect("pending map poisoned")
                .get_mut(&id)
            {
                *slot = Some(worker.abort_handle());
            }
        });
    }

    async fn dispatch(self: Arc<Self>, request: Request) -> Result<Value, ErrorKind> {
        tracing::debug!(id = request.id, action = %request.action, "dispatching");
        let payload = request.payload;
        match request.action.as_str() {
            "spawn" => self.handle_spawn(payload).await,
            "kill" => self.handle_kill(payload).await,
            "status" => self.handle_status(payload).await,
            "command" => self.handle_command(payload).await,
            "exec-monitor" => self.handle_exec_monitor(payload).await,
            "exec-renode" => self.handle_exec_renode(payload).await,
            "tweak/socket" => self.handle_tweak_socket(payload).await,
            action if action.starts_with("fs/") => self.handle_fs(action, payload).await,
            action => {
                tracing::warn!(action, "unsupported action");
                Err(ErrorKind::UnsupportedAction)
            }
        }
    }

    async fn handle_spawn(self: &Arc<Self>, payload: Value) -> Result<Value, ErrorKind> {
        let params: SpawnParams = parse_params(payload)?;
        if params.name != "renode" {
            tracing::warn!(name = %params.name, "spawn supports only the engine");
            return Err(ErrorKind::BadRequest);
        }
        let _engine = self.engine_lock.lock().await;
        if self.supervisor.is_running().await {
            return Err(ErrorKind::EngineBusy);
        }

        let cwd = match &params.cwd {
            Some(rel) => self.fs.sandbox().resolve(rel).map_err(|e| e.kind())?,
            None => self.fs.sandbox().root().to_path_buf(),
        };
        match tokio::fs::metadata(&cwd).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(ErrorKind::Enotdir),
            Err(_) => return Err(ErrorKind::Enoent),
        }

        let gui = self.state.config.engine.gui_for_request(params.gui);
        self.set_phase(SessionPhase::EngineStarting);
        match self.supervisor.spawn(&cwd, gui).await {
            Ok(handle) => {
                self.set_phase(SessionPhase::EngineRunning);
                // the GDB port is allocated fresh per spawn, so the client
                // has to be told which /run/<port> reaches it
                if let Some(gdb_port) = handle.gdb_port {
                    self.emit_event("run-opened", json!({ "port": gdb_port, "name": "gdb" }))
                        .await;
                }
                // advertise the UARTs without delaying the response; the
                // task dies with the session
                let session = Arc::clone(self);
                let monitor_port = handle.monitor_port;
                tokio::spawn(async move {
                    let cancel = session.cancel.clone();
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = session.discover_uarts(monitor_port) => {}
                    }
                });
                Ok(json!({}))
            }
            Err(e) => {
                tracing::warn!(error = %e, "spawn failed");
                self.set_phase(SessionPhase::EngineDown);
                Err(e.kind())
            }
        }
    }

    async fn handle_kill(&self, payload: Value) -> Result<Value, ErrorKind> {
        let params: KillParams = parse_params(payload)?;
        if params.name != "renode" {
            tracing::warn!(name = %params.name, "kill supports only the engine");
            return Err(ErrorKind::BadRequest);
        }
        let _engine = self.engine_lock.lock().await;
        self.supervisor.kill().await.map_err(|e| e.kind())?;
        self.set_phase(SessionPhase::EngineDown);
        Ok(json!({}))
    }

    async fn handle_status(&self, payload: Value) -> Result<Value, ErrorKind> {
        let params: StatusParams = parse_params(default_payload(payload))?;
        match params.name.as_deref() {
            None => Ok(json!({
                "state": self.phase().as_str(),
                "version": PROTOCOL_VERSION.to_string(),
                "workspace": self.workspace,
                "uptimeSeconds": (Utc::now() - self.created_at).num_seconds(),
            })),
            Some("renode") => match self.supervisor.handle().await {
                // report the per-spawn endpoints so a reconnecting client
                // can find its way back to the bridges
                Some(handle) => Ok(json!({
                    "monitorPort": handle.monitor_port,
                    "analyzerPort": handle.analyzer_port,
                    "gdbPort": handle.gdb_port,
                })),
                None => Err(ErrorKind::EngineNotRunning),
            },
            Some("telnet") => Ok(json!(self.state.bridge_ports("telnet"))),
            Some("run") => Ok(json!(self.state.bridge_ports("run"))),
            Some(other) => {
                tracing::warn!(name = other, "status query for unknown software");
                Err(ErrorKind::BadRequest)
            }
        }
    }

    async fn handle_command(&self, payload: Value) -> Result<Value, ErrorKind> {
        let params: CommandParams = parse_params(payload)?;
        let mut parts = params.name.split_whitespace();
        let program = parts.next().ok_or(ErrorKind::BadRequest)?;
        tracing::info!(command = %params.name, "running host command");
        let output = tokio::process::Command::new(program)
            .args(parts)
            .output()
            .await
            .map_err(|e| {
                tracing::warn!(program, error = %e, "host command failed to start");
                ErrorKind::Io
            })?;
        if !output.status.success() {
            tracing::warn!(
                program,
                status = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr),
                "host command failed"
            );
            return Err(ErrorKind::Io);
        }
        Ok(json!({
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
        }))
    }

    async fn handle_exec_monitor(&self, payload: Value) -> Result<Value, ErrorKind> {
        self.ensure_engine_running()?;
        let params: ExecMonitorParams = parse_params(payload)?;
        let _engine = self.engine_lock.lock().await;
        let handle = self
            .supervisor
            .handle()
            .await
            .ok_or(ErrorKind::EngineNotRunning)?;
        let _monitor = self.monitor_lock.lock().await;
        let mut client = MonitorClient::connect(handle.monitor_port)
            .await
            .map_err(|e| e.kind())?;
        let mut results = Vec::with_capacity(params.commands.len());
        for command in &params.commands {
            let lines = client
                .execute(command, EXEC_MONITOR_TIMEOUT)
                .await
                .map_err(|e| e.kind())?;
            results.push(lines.join("\n"));
        }
        Ok(json!(results))
    }

    async fn handle_exec_renode(&self, payload: Value) -> Result<Value, ErrorKind> {
        self.ensure_engine_running()?;
        let params: ExecRenodeParams = parse_params(payload)?;
        let _engine = self.engine_lock.lock().await;
        let handle = self
            .supervisor
            .handle()
            .await
            .ok_or(ErrorKind::EngineNotRunning)?;
        let _monitor = self.monitor_lock.lock().await;
        let mut client = MonitorClient::connect(handle.monitor_port)
            .await
            .map_err(|e| e.kind())?;
        client
            .execute_structured(&params.command, &params.args, DEFAULT_COMMAND_TIMEOUT)
            .await
            .map_err(|e| e.kind())
    }

    async fn handle_tweak_socket(&self, payload: Value) -> Result<Value, ErrorKind> {
        self.ensure_engine_running()?;
        let params: TweakParams = parse_params(payload)?;
        let file = params.args.first().ok_or(ErrorKind::BadRequest)?;
        let handle = self
            .supervisor
            .handle()
            .await
            .ok_or(ErrorKind::EngineNotRunning)?;
        self.fs
            .replace_analyzer(file, handle.analyzer_port)
            .await
            .map_err(|e| e.kind())?;
        // the analyzer port is allocated fresh per spawn; hand it back so
        // the client knows which /run/<port> carries the terminal
        Ok(json!({ "port": handle.analyzer_port }))
    }

    async fn handle_fs(&self, action: &str, payload: Value) -> Result<Value, ErrorKind> {
        let params: FsParams = parse_params(payload)?;
        let arg = |index: usize| params.arg(index).ok_or(ErrorKind::BadRequest);
        match action {
            "fs/list" => {
                let entries = self.fs.list(arg(0)?).await.map_err(|e| e.kind())?;
                Ok(serde_json::to_value(entries).expect("listing serializes"))
            }
            "fs/stat" => {
                let stat = self.fs.stat(arg(0)?).await.map_err(|e| e.kind())?;
                Ok(serde_json::to_value(stat).expect("stat serializes"))
            }
            "fs/dwnl" => {
                let bytes = self.fs.download(arg(0)?).await.map_err(|e| e.kind())?;
                Ok(Value::String(BASE64.encode(bytes)))
            }
            "fs/upld" => {
                let encoded = params.data.as_deref().ok_or(ErrorKind::BadRequest)?;
                let bytes = BASE64.decode(encoded).map_err(|e| {
                    tracing::warn!(error = %e, "upload body is not valid base64");
                    ErrorKind::BadRequest
                })?;
                let path = self
                    .fs
                    .upload(arg(0)?, bytes)
                    .await
                    .map_err(|e| e.kind())?;
                Ok(json!({ "path": path }))
            }
            "fs/mkdir" => {
                self.fs.mkdir(arg(0)?).await.map_err(|e| e.kind())?;
                Ok(json!({}))
            }
            "fs/remove" => {
                let path = self.fs.remove(arg(0)?).await.map_err(|e| e.kind())?;
                Ok(json!({ "path": path }))
            }
            "fs/move" => {
                let (from, to) = self
                    .fs
                    .rename(arg(0)?, arg(1)?)
                    .await
                    .map_err(|e| e.kind())?;
                Ok(json!({ "from": from, "to": to }))
            }
            "fs/copy" => {
                let (from, to) = self
                    .fs
                    .copy(arg(0)?, arg(1)?)
                    .await
                    .map_err(|e| e.kind())?;
                Ok(json!({ "from": from, "to": to }))
            }
            "fs/fetch" => {
                let path = self.fs.fetch_url(arg(0)?).await.map_err(|e| e.kind())?;
                Ok(json!({ "path": path }))
            }
            "fs/zip" => {
                let path = self.fs.fetch_zip(arg(0)?).await.map_err(|e| e.kind())?;
                Ok(json!({ "path": path }))
            }
            _ => {
                tracing::warn!(action, "unsupported fs action");
                Err(ErrorKind::UnsupportedAction)
            }
        }
    }

    /// Ask the engine which UARTs exist, route each through a server
    /// socket terminal, and advertise them to the client.
    async fn discover_uarts(&self, monitor_port: u16) {
        let _monitor = self.monitor_lock.lock().await;
        let mut client = match MonitorClient::connect(monitor_port).await {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!(error = %e, "uart discovery skipped: monitor unreachable");
                return;
            }
        };
        let machines = match client
            .execute_structured("machines", &json!({}), DEFAULT_COMMAND_TIMEOUT)
            .await
        {
            Ok(Value::Array(machines)) => machines,
            Ok(_) | Err(_) => return,
        };

        for machine in machines.iter().filter_map(Value::as_str) {
            let uarts = match client
                .execute_structured("uarts", &json!({ "machine": machine }), DEFAULT_COMMAND_TIMEOUT)
                .await
            {
                Ok(Value::Array(uarts)) => uarts,
                Ok(_) | Err(_) => continue,
            };
            for uart in uarts.iter().filter_map(Value::as_str) {
                let Ok(port) = find_free_port() else { continue };
                let terminal = format!("term_{port}");
                let commands = [
                    format!("mach set \"{machine}\""),
                    format!("emulation CreateServerSocketTerminal {port} \"{terminal}\""),
                    format!("connector Connect {uart} {terminal}"),
                ];
                let mut wired = true;
                for command in &commands {
                    if let Err(e) = client.execute(command, DEFAULT_COMMAND_TIMEOUT).await {
                        tracing::warn!(machine, uart, error = %e, "uart socket setup failed");
                        wired = false;
                        break;
                    }
                }
                if !wired {
                    continue;
                }
                self.state
                    .register_uart(&self.workspace, machine, uart, port);
                tracing::info!(machine, uart, port, "uart endpoint opened");
                self.emit_event(
                    "uart-opened",
                    json!({ "port": port, "name": uart, "machineName": machine }),
                )
                .await;
            }
        }
    }

    async fn send_response(&self, response: Response) {
        let _ = self.outbound.send(response.to_json()).await;
    }

    /// Best-effort event emission: logged and counted when the control
    /// socket stays backed up past the enqueue timeout.
    async fn emit_event(&self, name: &str, data: Value) {
        let frame = Event::new(name, data).to_json();
        if self
            .outbound
            .send_timeout(frame, EVENT_ENQUEUE_TIMEOUT)
            .await
            .is_err()
        {
            let dropped = self.events_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(event = name, dropped, "event dropped on control backpressure");
        }
    }

    fn phase(&self) -> SessionPhase {
        *self.phase.lock().expect("phase lock poisoned")
    }

    fn set_phase(&self, next: SessionPhase) {
        let mut phase = self.phase.lock().expect("phase lock poisoned");
        if *phase == SessionPhase::Closed {
            return;
        }
        tracing::debug!(from = %phase.as_str(), to = %next.as_str(), "session phase");
        *phase = next;
    }

    fn ensure_engine_running(&self) -> Result<(), ErrorKind> {
        if self.phase() == SessionPhase::EngineRunning {
            Ok(())
        } else {
            Err(ErrorKind::EngineNotRunning)
        }
    }

    /// Closing the control WS cancels pending handlers, tears down every
    /// bridge, and terminates the engine.
    async fn shutdown(&self) {
        self.set_phase(SessionPhase::Closed);
        let handles: Vec<AbortHandle> = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.drain().filter_map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.abort();
        }
        if self.supervisor.is_running().await {
            let _ = self.supervisor.kill().await;
        }
        self.state.release_session(&self.workspace);
        let dropped = self.events_dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            tracing::info!(workspace = %self.workspace, dropped, "events dropped this session");
        }
    }
}

fn action_timeout(action: &str) -> Duration {
    match action {
        "spawn" => SPAWN_REQUEST_TIMEOUT,
        "exec-monitor" => EXEC_MONITOR_REQUEST_TIMEOUT,
        _ => DEFAULT_REQUEST_TIMEOUT,
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, ErrorKind> {
    serde_json::from_value(payload).map_err(|e| {
        tracing::warn!(error = %e, "invalid payload");
        ErrorKind::BadRequest
    })
}

/// A null payload means "no arguments" for actions where that is legal.
fn default_payload(payload: Value) -> Value {
    if payload.is_null() {
        json!({})
    } else {
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_timeouts() {
        assert_eq!(action_timeout("spawn"), Duration::from_millis(10_500));
        assert_eq!(
            action_timeout("exec-monitor"),
            Duration::from_millis(10_000)
        );
        assert_eq!(action_timeout("fs/list"), Duration::from_millis(60_000));
    }

    #[test]
    fn test_phase_tokens() {
        assert_eq!(SessionPhase::Connected.as_str(), "connected");
        assert_eq!(SessionPhase::EngineRunning.as_str(), "engine-running");
    }
}
