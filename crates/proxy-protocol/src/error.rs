//! Client-visible error taxonomy and protocol-level errors.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error kinds carried in the `error` field of a failure response.
///
/// The wire representation is the kebab-case token; anything more
/// descriptive belongs in the server log, not on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    PathEscape,
    Enoent,
    Eexist,
    Eisdir,
    Enotdir,
    Io,
    FetchFailed,
    ArchiveMalformed,
    EntryEscape,
    EngineNotRunning,
    EngineBusy,
    SpawnFailed,
    SpawnTimeout,
    Timeout,
    VersionMismatch,
    BadRequest,
    UnsupportedAction,
    Busy,
}

impl ErrorKind {
    /// The wire token for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PathEscape => "path-escape",
            Self::Enoent => "enoent",
            Self::Eexist => "eexist",
            Self::Eisdir => "eisdir",
            Self::Enotdir => "enotdir",
            Self::Io => "io",
            Self::FetchFailed => "fetch-failed",
            Self::ArchiveMalformed => "archive-malformed",
            Self::EntryEscape => "entry-escape",
            Self::EngineNotRunning => "engine-not-running",
            Self::EngineBusy => "engine-busy",
            Self::SpawnFailed => "spawn-failed",
            Self::SpawnTimeout => "spawn-timeout",
            Self::Timeout => "timeout",
            Self::VersionMismatch => "version-mismatch",
            Self::BadRequest => "bad-request",
            Self::UnsupportedAction => "unsupported-action",
            Self::Busy => "busy",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while decoding control-channel frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is not valid JSON or not a valid envelope.
    #[error("invalid envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    /// Version string does not parse as `MAJOR.MINOR.PATCH`.
    #[error("invalid version string: {0}")]
    BadVersion(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_tokens() {
        assert_eq!(ErrorKind::PathEscape.as_str(), "path-escape");
        assert_eq!(ErrorKind::UnsupportedAction.as_str(), "unsupported-action");
        assert_eq!(ErrorKind::Eexist.as_str(), "eexist");
    }

    #[test]
    fn test_serde_matches_as_str() {
        let json = serde_json::to_string(&ErrorKind::VersionMismatch).unwrap();
        assert_eq!(json, "\"version-mismatch\"");
        let kind: ErrorKind = serde_json::from_str("\"entry-escape\"").unwrap();
        assert_eq!(kind, ErrorKind::EntryEscape);
    }
}
