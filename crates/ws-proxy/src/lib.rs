//! Session-managing WebSocket proxy for a simulator engine.
//!
//! The binary accepts WebSocket connections on a handful of routes: a
//! per-workspace control channel speaking the JSON request/response
//! protocol from `proxy-protocol`, plus raw byte bridges onto the
//! engine's auxiliary TCP endpoints (monitor telnet, UARTs, GDB).

pub mod bridge;
pub mod router;
pub mod session;
pub mod state;
