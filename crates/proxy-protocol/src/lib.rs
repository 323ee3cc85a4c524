//! Wire protocol for the ws-proxy control channel.
//!
//! Defines the request/response/event envelopes exchanged as JSON text
//! frames on a control WebSocket, the protocol version type with its
//! acceptance rule, and the error taxonomy surfaced to clients.

mod envelope;
mod error;
mod version;

pub use envelope::{
    request, CommandParams, Event, ExecMonitorParams, ExecRenodeParams, FsParams, KillParams,
    Request, Response, SpawnParams, Status, StatusParams, TweakParams,
};
pub use error::{ErrorKind, ProtocolError};
pub use version::{ProtocolVersion, PROTOCOL_VERSION};
