//! Request, response, and event envelopes.
//!
//! All three are UTF-8 JSON carried in WebSocket text frames. Requests
//! reject unknown envelope fields; action payloads stay tolerant so newer
//! clients can add optional fields without breaking older servers.

use crate::error::{ErrorKind, ProtocolError};
use crate::version::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// An incoming control-channel request.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    /// Protocol version the client speaks, `MAJOR.MINOR.PATCH`.
    pub version: String,
    /// Client-assigned id echoed on the response.
    pub id: u64,
    /// Operation name, e.g. `spawn` or `fs/list`.
    pub action: String,
    /// Action-specific payload.
    #[serde(default)]
    pub payload: Value,
}

impl Request {
    /// Decode a request from a text frame.
    pub fn from_json(frame: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Best-effort extraction of the `id` field from a frame that failed
    /// full envelope validation, so the failure response can still name
    /// the offending request.
    pub fn peek_id(frame: &str) -> Option<u64> {
        serde_json::from_str::<Value>(frame)
            .ok()?
            .get("id")?
            .as_u64()
    }
}

/// Request/response outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
}

/// An outgoing response to a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Server protocol version.
    pub version: String,
    /// Id of the request this answers. Absent only when the request id
    /// could not be recovered from a malformed frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// A success response carrying `data`.
    pub fn success(id: u64, data: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            id: Some(id),
            status: Status::Success,
            data: Some(data),
            error: None,
        }
    }

    /// A failure response carrying an error taxonomy token.
    pub fn failure(id: Option<u64>, kind: ErrorKind) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            id,
            status: Status::Failure,
            data: None,
            error: Some(kind.as_str().to_string()),
        }
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("response serialization cannot fail")
    }
}

/// An asynchronous event pushed by the server. Events never carry an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub version: String,
    pub event: String,
    pub data: Value,
}

impl Event {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            event: event.into(),
            data,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("event serialization cannot fail")
    }
}

// Typed payloads, one per action family. These are deserialized out of
// `Request::payload` by the dispatcher; unknown fields are tolerated.

/// Payload for `spawn`.
#[derive(Debug, Clone, Deserialize)]
pub struct SpawnParams {
    /// Software to spawn; only `renode` is supported.
    pub name: String,
    /// Working directory, relative to the session root.
    pub cwd: Option<String>,
    /// Request a GUI-enabled launch (subject to host policy).
    #[serde(default)]
    pub gui: bool,
}

/// Payload for `kill`.
#[derive(Debug, Clone, Deserialize)]
pub struct KillParams {
    pub name: String,
}

/// Payload for `status`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusParams {
    /// Optional software to query: `renode`, `telnet`, or `run`.
    /// Without a name the reply is a session heartbeat.
    pub name: Option<String>,
}

/// Payload for `command`.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandParams {
    /// Whitespace-separated host command line.
    pub name: String,
}

/// Payload for `exec-monitor`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecMonitorParams {
    pub commands: Vec<String>,
}

/// Payload for `exec-renode`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecRenodeParams {
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

/// Payload for every `fs/*` action: positional path/url arguments plus an
/// optional base64 body (uploads only).
#[derive(Debug, Clone, Deserialize)]
pub struct FsParams {
    pub args: Vec<String>,
    pub data: Option<String>,
}

/// Payload for `tweak/socket`.
#[derive(Debug, Clone, Deserialize)]
pub struct TweakParams {
    pub args: Vec<String>,
}

impl FsParams {
    /// First positional argument, or `BadRequest` semantics for the caller.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

/// Convenience constructor used by tests and tooling.
pub fn request(id: u64, action: &str, payload: Value) -> Value {
    json!({
        "version": PROTOCOL_VERSION.to_string(),
        "id": id,
        "action": action,
        "payload": payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_decodes() {
        let frame = r#"{"version":"0.0.1","id":7,"action":"fs/list","payload":{"args":["."]}}"#;
        let req = Request::from_json(frame).unwrap();
        assert_eq!(req.id, 7);
        assert_eq!(req.action, "fs/list");
    }

    #[test]
    fn test_request_defaults_missing_payload() {
        let frame = r#"{"version":"0.0.1","id":1,"action":"status"}"#;
        let req = Request::from_json(frame).unwrap();
        assert!(req.payload.is_null());
    }

    #[test]
    fn test_request_rejects_unknown_envelope_field() {
        let frame = r#"{"version":"0.0.1","id":1,"action":"status","payload":{},"extra":true}"#;
        assert!(Request::from_json(frame).is_err());
    }

    #[test]
    fn test_request_rejects_missing_id() {
        let frame = r#"{"version":"0.0.1","action":"status","payload":{}}"#;
        assert!(Request::from_json(frame).is_err());
        assert_eq!(Request::peek_id(frame), None);
    }

    #[test]
    fn test_peek_id_survives_bad_envelope() {
        let frame = r#"{"id":42,"bogus":1}"#;
        assert_eq!(Request::peek_id(frame), Some(42));
    }

    #[test]
    fn test_response_wire_shape() {
        let resp = Response::success(3, json!({"path": "a/b.bin"}));
        let value: Value = serde_json::from_str(&resp.to_json()).unwrap();
        assert_eq!(value["version"], "0.0.1");
        assert_eq!(value["id"], 3);
        assert_eq!(value["status"], "success");
        assert_eq!(value["data"]["path"], "a/b.bin");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_failure_carries_taxonomy_token() {
        let resp = Response::failure(Some(1), ErrorKind::PathEscape);
        let value: Value = serde_json::from_str(&resp.to_json()).unwrap();
        assert_eq!(value["status"], "failure");
        assert_eq!(value["error"], "path-escape");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_event_has_no_id() {
        let event = Event::new("renode-quitted", json!({}));
        let value: Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["event"], "renode-quitted");
        assert!(value.get("id").is_none());
    }

    #[test]
    fn test_spawn_params_tolerate_unknown_fields() {
        let payload = json!({"name": "renode", "gui": true, "futureOption": 1});
        let params: SpawnParams = serde_json::from_value(payload).unwrap();
        assert_eq!(params.name, "renode");
        assert!(params.gui);
        assert!(params.cwd.is_none());
    }
}
