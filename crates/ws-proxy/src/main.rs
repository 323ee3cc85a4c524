//! ws-proxy entry point.
//!
//! Exit codes: 0 clean shutdown, 1 bind failure, 2 bad arguments,
//! 3 engine binary not executable.

use clap::Parser;
use proxy_engine::{env_flag, EngineConfig};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ws_proxy::router;
use ws_proxy::state::{ProxyConfig, ProxyState};

/// WebSocket based server for managing a remote engine instance.
#[derive(Debug, Parser)]
#[command(name = "ws-proxy", version)]
struct Args {
    /// Path to the engine binary.
    engine_binary: PathBuf,
    /// Directory used as the engine workspace root.
    working_dir: PathBuf,
    /// Path to the gdb binary used for debug sessions.
    #[arg(short = 'g', long = "gdb")]
    gdb: Option<PathBuf>,
    /// WebSocket server port.
    #[arg(short = 'p', long = "port", default_value_t = 21234)]
    port: u16,
}

#[tokio::main]
async fn main() {
    // clap exits with code 2 on bad usage before we get here
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let engine_binary = match which::which(&args.engine_binary) {
        Ok(path) => path,
        Err(e) => {
            tracing::error!(binary = %args.engine_binary.display(), error = %e, "engine binary is not executable");
            exit(3);
        }
    };
    let root = match args.working_dir.canonicalize() {
        Ok(root) if root.is_dir() => root,
        _ => {
            tracing::error!(dir = %args.working_dir.display(), "working directory does not exist");
            exit(2);
        }
    };
    let gdb_binary = match args.gdb {
        Some(gdb) => match which::which(&gdb) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!(binary = %gdb.display(), error = %e, "gdb binary is not executable");
                exit(2);
            }
        },
        None => None,
    };

    let mut engine = EngineConfig::new(engine_binary);
    engine.gdb_binary = gdb_binary;
    engine.gui_disabled = env_flag("RENODE_PROXY_GUI_DISABLED");
    engine.gui_forced = env_flag("RENODE_HYPERVISOR_GUI_ENABLED");
    if engine.gui_disabled {
        tracing::info!("RENODE_PROXY_GUI_DISABLED is set, the engine cannot run with a GUI");
    }

    // process-wide staging area for archive downloads, removed on exit
    let staging = match tempfile::tempdir() {
        Ok(staging) => staging,
        Err(e) => {
            tracing::error!(error = %e, "cannot create staging directory");
            exit(1);
        }
    };

    let state = Arc::new(ProxyState::new(
        ProxyConfig {
            engine,
            root: root.clone(),
            port: args.port,
        },
        staging.path().to_path_buf(),
    ));

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", args.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(port = args.port, error = %e, "cannot bind listener");
            exit(1);
        }
    };
    tracing::info!(port = args.port, root = %root.display(), "ws-proxy listening");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
    };
    if let Err(e) = router::serve(listener, state, shutdown).await {
        tracing::error!(error = %e, "server error");
        exit(1);
    }

    drop(staging);
    tracing::info!("ws-proxy stopped");
}
