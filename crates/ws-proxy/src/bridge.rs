//! Bidirectional TCP⇄WebSocket byte pump.
//!
//! Each bridge runs two independent pumps. A pump stops reading its
//! source while the opposite sink has more than [`HIGH_WATER`] bytes
//! queued and resumes once the queue drains below [`LOW_WATER`]. Either
//! side's EOF half-closes the other; the bridge is released when both
//! directions are done or the owning session cancels it.

use crate::state::ProxyState;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};

/// TCP read coalescing buffer.
const TCP_READ_BUF: usize = 4 * 1024;
/// Queued-byte level at which a pump stops reading its source.
const HIGH_WATER: usize = 1024 * 1024;
/// Queued-byte level at which a stopped pump resumes.
const LOW_WATER: usize = 256 * 1024;
/// WebSocket keepalive interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Missed pongs tolerated before the bridge is torn down.
const MAX_MISSED_PONGS: u32 = 3;

/// Bytes queued toward one sink, with high/low-watermark wakeups.
struct FlowGauge {
    queued: AtomicUsize,
    resume: Notify,
}

impl FlowGauge {
    fn new() -> Self {
        Self {
            queued: AtomicUsize::new(0),
            resume: Notify::new(),
        }
    }

    fn add(&self, n: usize) {
        self.queued.fetch_add(n, Ordering::SeqCst);
    }

    fn sub(&self, n: usize) {
        let before = self.queued.fetch_sub(n, Ordering::SeqCst);
        if before.saturating_sub(n) <= LOW_WATER {
            self.resume.notify_waiters();
        }
    }

    /// Block while the sink is above the high-water mark; return once the
    /// queue has drained below the low-water mark.
    async fn wait_capacity(&self) {
        if self.queued.load(Ordering::SeqCst) <= HIGH_WATER {
            return;
        }
        loop {
            let notified = self.resume.notified();
            if self.queued.load(Ordering::SeqCst) <= LOW_WATER {
                return;
            }
            notified.await;
        }
    }
}

enum WsOut {
    Data(Bytes),
    Ping,
    Close,
}

/// Bridge one WebSocket to a local TCP endpoint until either side closes,
/// the keepalive fails, or `kind`-owning session tears it down.
pub async fn run_bridge(state: Arc<ProxyState>, kind: &'static str, port: u16, socket: WebSocket) {
    let mut socket = socket;
    let tcp = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(tcp) => tcp,
        Err(e) => {
            tracing::warn!(kind, port, error = %e, "bridge target refused connection");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    let (bridge_id, cancel) = state.track_bridge(kind, port);
    tracing::info!(bridge_id, kind, port, "bridge opened");

    let (ws_sink, mut ws_stream) = socket.split();
    let (tcp_read, tcp_write) = tcp.into_split();

    let ws_gauge = Arc::new(FlowGauge::new());
    let tcp_gauge = Arc::new(FlowGauge::new());
    let last_pong = Arc::new(Mutex::new(Instant::now()));

    let (ws_out_tx, mut ws_out_rx) = mpsc::unbounded_channel::<WsOut>();
    let (tcp_out_tx, mut tcp_out_rx) = mpsc::unbounded_channel::<Bytes>();

    // Sole owner of the WS sink: data frames, pings, and the final close.
    let ws_writer = {
        let gauge = Arc::clone(&ws_gauge);
        let cancel = cancel.clone();
        let mut ws_sink = ws_sink;
        tokio::spawn(async move {
            while let Some(item) = ws_out_rx.recv().await {
                match item {
                    WsOut::Data(bytes) => {
                        let n = bytes.len();
                        if ws_sink.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                        gauge.sub(n);
                    }
                    WsOut::Ping => {
                        if ws_sink.send(Message::Ping(Bytes::new())).await.is_err() {
                            break;
                        }
                    }
                    WsOut::Close => {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            cancel.cancel();
        })
    };

    // Sole owner of the TCP write half; half-closes it when the WS side
    // stops producing.
    let tcp_writer = {
        let gauge = Arc::clone(&tcp_gauge);
        let cancel = cancel.clone();
        let mut tcp_write = tcp_write;
        tokio::spawn(async move {
            while let Some(bytes) = tcp_out_rx.recv().await {
                let n = bytes.len();
                if tcp_write.write_all(&bytes).await.is_err() {
                    break;
                }
                gauge.sub(n);
            }
            let _ = tcp_write.shutdown().await;
            cancel.cancel();
        })
    };

    // TCP → WS pump.
    let tcp_to_ws = {
        let gauge = Arc::clone(&ws_gauge);
        let cancel = cancel.clone();
        let ws_out_tx = ws_out_tx.clone();
        let mut tcp_read = tcp_read;
        tokio::spawn(async move {
            let mut buf = [0u8; TCP_READ_BUF];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = gauge.wait_capacity() => {}
                }
                let read = tokio::select! {
                    _ = cancel.cancelled() => break,
                    read = tcp_read.read(&mut buf) => read,
                };
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        gauge.add(n);
                        if ws_out_tx
                            .send(WsOut::Data(Bytes::copy_from_slice(&buf[..n])))
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            // TCP side is done; close the WS side after queued data drains
            let _ = ws_out_tx.send(WsOut::Close);
        })
    };

    // WS → TCP pump.
    let ws_to_tcp = {
        let gauge = Arc::clone(&tcp_gauge);
        let cancel = cancel.clone();
        let last_pong = Arc::clone(&last_pong);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = gauge.wait_capacity() => {}
                }
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = ws_stream.next() => message,
                };
                match message {
                    Some(Ok(Message::Binary(bytes))) => {
                        gauge.add(bytes.len());
                        if tcp_out_tx.send(bytes).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        let bytes = Bytes::copy_from_slice(text.as_bytes());
                        gauge.add(bytes.len());
                        if tcp_out_tx.send(bytes).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        *last_pong.lock().expect("pong clock poisoned") = Instant::now();
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // the WS layer answers pings itself
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                }
            }
            // dropping the sender lets the TCP writer drain and half-close
        })
    };

    // Keepalive: ping every 30 s, give up after three silent intervals.
    let keepalive = {
        let cancel = cancel.clone();
        let last_pong = Arc::clone(&last_pong);
        let ws_out_tx = ws_out_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let silent = last_pong
                    .lock()
                    .expect("pong clock poisoned")
                    .elapsed();
                if silent > PING_INTERVAL * MAX_MISSED_PONGS {
                    tracing::warn!(silent_secs = silent.as_secs(), "bridge peer stopped answering pings");
                    cancel.cancel();
                    break;
                }
                if ws_out_tx.send(WsOut::Ping).is_err() {
                    break;
                }
            }
        })
    };
    drop(ws_out_tx);

    let _ = tcp_to_ws.await;
    let _ = ws_to_tcp.await;
    cancel.cancel();
    let _ = keepalive.await;
    let _ = ws_writer.await;
    let _ = tcp_writer.await;

    state.untrack_bridge(bridge_id);
    tracing::info!(bridge_id, kind, port, "bridge closed");
}
