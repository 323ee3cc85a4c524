//! WebSocket listener and route table.

use crate::bridge;
use crate::session;
use crate::state::ProxyState;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Upper bound for a single control frame; uploads arrive base64-encoded
/// inside one text frame, so this has to fit large binaries.
const MAX_CONTROL_FRAME: usize = 100_000_000;

/// Build the route table:
/// `/proxy/<workspace>` control channel, `/telnet/<port>` monitor console,
/// `/uart/<machine>/<name>` discovered UARTs, `/run/<port>` other
/// engine-bound endpoints. Anything else is a plain 404.
pub fn build_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/proxy/{workspace}", get(control))
        .route("/telnet/{port}", get(telnet))
        .route("/uart/{machine}/{name}", get(uart))
        .route("/run/{port}", get(run))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<ProxyState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn control(
    State(state): State<Arc<ProxyState>>,
    Path(workspace): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.max_message_size(MAX_CONTROL_FRAME)
        .on_upgrade(move |socket| session::run(state, workspace, socket))
}

async fn telnet(
    State(state): State<Arc<ProxyState>>,
    Path(port): Path<u16>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| bridge::run_bridge(state, "telnet", port, socket))
}

async fn uart(
    State(state): State<Arc<ProxyState>>,
    Path((machine, name)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(port) = state.uart_port(&machine, &name) else {
        tracing::warn!(machine, name, "no such uart endpoint");
        return StatusCode::NOT_FOUND.into_response();
    };
    ws.on_upgrade(move |socket| bridge::run_bridge(state, "uart", port, socket))
}

async fn run(
    State(state): State<Arc<ProxyState>>,
    Path(port): Path<u16>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| bridge::run_bridge(state, "run", port, socket))
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}
