//! Error types for proxy-engine.

use proxy_protocol::ErrorKind;
use thiserror::Error;

/// Errors from engine supervision and monitor access.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A live engine already exists for this session.
    #[error("an engine process is already running")]
    Busy,

    /// The requested operation needs a running engine.
    #[error("no engine process is running")]
    NotRunning,

    /// The engine exited or failed to launch during startup.
    #[error("engine failed to start: {0}")]
    SpawnFailed(String),

    /// The monitor port never came up within the probe window.
    #[error("engine did not open its monitor port in time")]
    SpawnTimeout,

    /// The engine reported a command failure.
    #[error("engine command failed: {0}")]
    Command(String),

    /// A monitor command exceeded its deadline.
    #[error("monitor command timed out")]
    Timeout,

    /// The monitor stream misbehaved (closed early, oversized line, ...).
    #[error("monitor protocol error: {0}")]
    Protocol(String),

    /// Structured command serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error talking to the engine.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// The wire taxonomy token for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Busy => ErrorKind::EngineBusy,
            Self::NotRunning => ErrorKind::EngineNotRunning,
            Self::SpawnFailed(_) => ErrorKind::SpawnFailed,
            Self::SpawnTimeout => ErrorKind::SpawnTimeout,
            Self::Timeout => ErrorKind::Timeout,
            Self::Command(_) | Self::Protocol(_) | Self::Json(_) | Self::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<tokio_util::codec::LinesCodecError> for EngineError {
    fn from(err: tokio_util::codec::LinesCodecError) -> Self {
        match err {
            tokio_util::codec::LinesCodecError::Io(e) => Self::Io(e),
            other => Self::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tokens() {
        assert_eq!(EngineError::Busy.kind(), ErrorKind::EngineBusy);
        assert_eq!(EngineError::NotRunning.kind(), ErrorKind::EngineNotRunning);
        assert_eq!(EngineError::SpawnTimeout.kind(), ErrorKind::SpawnTimeout);
        assert_eq!(EngineError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(EngineError::Command("x".into()).kind(), ErrorKind::Io);
    }
}
