//! Process-wide proxy state: configuration, session registry, and the
//! endpoints advertised for bridging.

use proxy_engine::EngineConfig;
use proxy_fs::{FsError, SandboxRoot};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Configuration assembled once at startup from CLI flags and environment.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub engine: EngineConfig,
    /// Canonical workspace root passed on the CLI; the only writable area.
    pub root: PathBuf,
    pub port: u16,
}

#[derive(Debug)]
struct UartEndpoint {
    workspace: String,
    port: u16,
}

/// A live TCP⇄WS bridge, tracked so sessions can tear it down.
#[derive(Debug)]
struct ActiveBridge {
    id: u64,
    workspace: Option<String>,
    kind: &'static str,
    port: u16,
    cancel: CancellationToken,
}

/// Shared state behind every route handler.
pub struct ProxyState {
    pub config: ProxyConfig,
    /// Process-wide staging directory for archive downloads.
    pub staging: PathBuf,
    sessions: Mutex<HashMap<String, CancellationToken>>,
    uarts: Mutex<HashMap<(String, String), UartEndpoint>>,
    bridges: Mutex<Vec<ActiveBridge>>,
    next_bridge_id: AtomicU64,
}

impl ProxyState {
    pub fn new(config: ProxyConfig, staging: PathBuf) -> Self {
        Self {
            config,
            staging,
            sessions: Mutex::new(HashMap::new()),
            uarts: Mutex::new(HashMap::new()),
            bridges: Mutex::new(Vec::new()),
            next_bridge_id: AtomicU64::new(1),
        }
    }

    /// Claim a workspace for a new control session. Returns the session's
    /// cancellation token, or `None` while another session holds it.
    pub fn register_session(&self, workspace: &str) -> Option<CancellationToken> {
        let mut sessions = self.sessions.lock().expect("session registry poisoned");
        if sessions.contains_key(workspace) {
            return None;
        }
        let token = CancellationToken::new();
        sessions.insert(workspace.to_string(), token.clone());
        tracing::info!(workspace, "control session registered");
        Some(token)
    }

    /// Drop a workspace claim and cancel everything rooted in it.
    pub fn release_session(&self, workspace: &str) {
        self.release_engine_endpoints(workspace);
        let token = self
            .sessions
            .lock()
            .expect("session registry poisoned")
            .remove(workspace);
        if let Some(token) = token {
            token.cancel();
        }
        // orphaned bridges go down with the last session
        let orphans: Vec<CancellationToken> = {
            let sessions = self.sessions.lock().expect("session registry poisoned");
            if !sessions.is_empty() {
                Vec::new()
            } else {
                let mut bridges = self.bridges.lock().expect("bridge registry poisoned");
                bridges.drain(..).map(|b| b.cancel).collect()
            }
        };
        for cancel in orphans {
            cancel.cancel();
        }
        tracing::info!(workspace, "control session released");
    }

    /// Resolve a workspace id to its filesystem root under the CLI root,
    /// creating the directory if needed.
    pub fn session_root(&self, workspace: &str) -> Result<PathBuf, FsError> {
        let sandbox = SandboxRoot::open(&self.config.root)?;
        let root = sandbox.resolve(workspace)?;
        std::fs::create_dir_all(&root)?;
        Ok(root)
    }

    /// Record a UART endpoint discovered after spawn.
    pub fn register_uart(&self, workspace: &str, machine: &str, name: &str, port: u16) {
        self.uarts.lock().expect("uart registry poisoned").insert(
            (machine.to_string(), name.to_string()),
            UartEndpoint {
                workspace: workspace.to_string(),
                port,
            },
        );
    }

    /// Look up the TCP port backing `/uart/<machine>/<name>`.
    pub fn uart_port(&self, machine: &str, name: &str) -> Option<u16> {
        self.uarts
            .lock()
            .expect("uart registry poisoned")
            .get(&(machine.to_string(), name.to_string()))
            .map(|e| e.port)
    }

    /// Track a newly opened bridge. The returned token is a child of the
    /// owning session's token, so session teardown cascades into it.
    pub fn track_bridge(&self, kind: &'static str, port: u16) -> (u64, CancellationToken) {
        let workspace = self.owning_workspace(kind, port);
        let cancel = {
            let sessions = self.sessions.lock().expect("session registry poisoned");
            match workspace.as_deref().and_then(|w| sessions.get(w)) {
                Some(session_token) => session_token.child_token(),
                None => CancellationToken::new(),
            }
        };
        let id = self.next_bridge_id.fetch_add(1, Ordering::Relaxed);
        self.bridges
            .lock()
            .expect("bridge registry poisoned")
            .push(ActiveBridge {
                id,
                workspace,
                kind,
                port,
                cancel: cancel.clone(),
            });
        tracing::debug!(id, kind, port, "bridge tracked");
        (id, cancel)
    }

    /// Forget a bridge that has fully shut down.
    pub fn untrack_bridge(&self, id: u64) {
        self.bridges
            .lock()
            .expect("bridge registry poisoned")
            .retain(|b| b.id != id);
    }

    /// Ports of live bridges of one kind, for `status` queries.
    pub fn bridge_ports(&self, kind: &str) -> Vec<u16> {
        self.bridges
            .lock()
            .expect("bridge registry poisoned")
            .iter()
            .filter(|b| b.kind == kind)
            .map(|b| b.port)
            .collect()
    }

    /// Tear down everything tied to a workspace's engine: its UART
    /// registrations and every bridge it owns. Called when the engine
    /// exits and again on session close.
    pub fn release_engine_endpoints(&self, workspace: &str) {
        self.uarts
            .lock()
            .expect("uart registry poisoned")
            .retain(|_, e| e.workspace != workspace);
        let doomed: Vec<CancellationToken> = {
            let mut bridges = self.bridges.lock().expect("bridge registry poisoned");
            let mut doomed = Vec::new();
            bridges.retain(|b| {
                if b.workspace.as_deref() == Some(workspace) {
                    doomed.push(b.cancel.clone());
                    false
                } else {
                    true
                }
            });
            doomed
        };
        for cancel in doomed {
            cancel.cancel();
        }
    }

    /// Which workspace a fresh bridge belongs to: UART bridges follow the
    /// registry; other kinds adopt the sole active session, if any.
    fn owning_workspace(&self, kind: &str, port: u16) -> Option<String> {
        if kind == "uart" {
            let uarts = self.uarts.lock().expect("uart registry poisoned");
            return uarts
                .values()
                .find(|e| e.port == port)
                .map(|e| e.workspace.clone());
        }
        let sessions = self.sessions.lock().expect("session registry poisoned");
        if sessions.len() == 1 {
            sessions.keys().next().cloned()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> (tempfile::TempDir, ProxyState) {
        let dir = tempfile::tempdir().unwrap();
        let config = ProxyConfig {
            engine: EngineConfig::new("/bin/true"),
            root: dir.path().canonicalize().unwrap(),
            port: 0,
        };
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        (dir, ProxyState::new(config, staging))
    }

    #[test]
    fn test_second_session_is_rejected() {
        let (_dir, state) = state();
        let first = state.register_session("ws").unwrap();
        assert!(state.register_session("ws").is_none());
        state.release_session("ws");
        assert!(first.is_cancelled());
        // the workspace is claimable again
        assert!(state.register_session("ws").is_some());
    }

    #[test]
    fn test_session_root_is_contained() {
        let (_dir, state) = state();
        let root = state.session_root("alpha").unwrap();
        assert!(root.starts_with(&state.config.root));
        assert!(root.is_dir());
        assert!(state.session_root("../evil").is_err());
    }

    #[test]
    fn test_uart_registry_roundtrip() {
        let (_dir, state) = state();
        state.register_uart("ws", "m0", "sysbus.uart0", 4444);
        assert_eq!(state.uart_port("m0", "sysbus.uart0"), Some(4444));
        assert_eq!(state.uart_port("m0", "sysbus.uart1"), None);
        state.release_engine_endpoints("ws");
        assert_eq!(state.uart_port("m0", "sysbus.uart0"), None);
    }

    #[test]
    fn test_session_bridges_cancel_with_engine() {
        let (_dir, state) = state();
        state.register_session("ws").unwrap();
        let (_id, cancel) = state.track_bridge("telnet", 1234);
        assert_eq!(state.bridge_ports("telnet"), vec![1234]);
        state.release_engine_endpoints("ws");
        assert!(cancel.is_cancelled());
        assert!(state.bridge_ports("telnet").is_empty());
    }
}
