//! Client for the engine's line-oriented console on the monitor port.
//!
//! Plain commands are newline-terminated strings answered by output lines
//! up to the next prompt token. Structured commands use a JSON dialect:
//! one request object out, one response object back, both on single lines.

use crate::error::EngineError;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};

/// Prompt token marking the end of a plain command's output.
const PROMPT: &str = "(monitor)";

/// Default deadline for a single monitor command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline used for `exec-monitor` command batches.
pub const EXEC_MONITOR_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection to the engine's monitor console.
///
/// Access must be serialized by the caller; the wire protocol has no
/// request ids, so interleaved commands would corrupt each other.
pub struct MonitorClient {
    framed: Framed<TcpStream, LinesCodec>,
}

impl MonitorClient {
    /// Connect to the monitor console on the local engine.
    pub async fn connect(port: u16) -> Result<Self, EngineError> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        Ok(Self {
            framed: Framed::new(stream, LinesCodec::new()),
        })
    }

    /// Run one plain console command, collecting output lines until the
    /// prompt reappears.
    pub async fn execute(
        &mut self,
        command: &str,
        limit: Duration,
    ) -> Result<Vec<String>, EngineError> {
        timeout(limit, self.execute_inner(command))
            .await
            .map_err(|_| EngineError::Timeout)?
    }

    async fn execute_inner(&mut self, command: &str) -> Result<Vec<String>, EngineError> {
        tracing::debug!(command, "monitor command");
        self.framed.send(command).await?;
        let mut lines = Vec::new();
        while let Some(line) = self.framed.next().await {
            let line = line?;
            if line.trim_start().starts_with(PROMPT) {
                return Ok(lines);
            }
            if line.trim() == command.trim() {
                // console echo of our own input
                continue;
            }
            lines.push(line);
        }
        Err(EngineError::Protocol(
            "monitor connection closed before prompt".into(),
        ))
    }

    /// Run one structured command over the JSON dialect.
    pub async fn execute_structured(
        &mut self,
        command: &str,
        args: &Value,
        limit: Duration,
    ) -> Result<Value, EngineError> {
        timeout(limit, self.structured_inner(command, args))
            .await
            .map_err(|_| EngineError::Timeout)?
    }

    async fn structured_inner(
        &mut self,
        command: &str,
        args: &Value,
    ) -> Result<Value, EngineError> {
        let request = serde_json::to_string(&json!({ "command": command, "args": args }))?;
        tracing::debug!(command, "structured monitor command");
        self.framed.send(request.as_str()).await?;

        while let Some(line) = self.framed.next().await {
            let line = line?;
            // console echo and banner lines are not JSON; skip them
            let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
                continue;
            };
            let Some(status) = value.get("status").and_then(Value::as_str) else {
                continue;
            };
            return match status {
                "success" => Ok(value.get("data").cloned().unwrap_or(Value::Null)),
                _ => {
                    let message = value
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("engine command failed")
                        .to_string();
                    tracing::debug!(command, error = %message, "structured command failed");
                    Err(EngineError::Command(message))
                }
            };
        }
        Err(EngineError::Protocol(
            "monitor connection closed before response".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// A fake monitor console: answers each received line via `respond`.
    async fn fake_monitor<F>(respond: F) -> u16
    where
        F: Fn(&str) -> Vec<String> + Send + 'static,
    {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                for reply in respond(&line) {
                    write.write_all(reply.as_bytes()).await.unwrap();
                    write.write_all(b"\n").await.unwrap();
                }
            }
        });
        port
    }

    #[tokio::test]
    async fn test_execute_collects_lines_until_prompt() {
        let port = fake_monitor(|cmd| {
            vec![
                cmd.to_string(), // echo
                "line one".to_string(),
                "line two".to_string(),
                "(monitor) ".to_string(),
            ]
        })
        .await;

        let mut client = MonitorClient::connect(port).await.unwrap();
        let lines = client
            .execute("version", DEFAULT_COMMAND_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(lines, vec!["line one", "line two"]);
    }

    #[tokio::test]
    async fn test_execute_times_out_without_prompt() {
        let port = fake_monitor(|_| vec!["still thinking".to_string()]).await;
        let mut client = MonitorClient::connect(port).await.unwrap();
        let err = client
            .execute("hang", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout));
    }

    #[tokio::test]
    async fn test_structured_success_returns_data() {
        let port = fake_monitor(|line| {
            let req: Value = serde_json::from_str(line).unwrap();
            assert_eq!(req["command"], "machines");
            vec![
                "noise before the reply".to_string(),
                r#"{"status":"success","data":["m0","m1"]}"#.to_string(),
            ]
        })
        .await;

        let mut client = MonitorClient::connect(port).await.unwrap();
        let data = client
            .execute_structured("machines", &json!({}), DEFAULT_COMMAND_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(data, json!(["m0", "m1"]));
    }

    #[tokio::test]
    async fn test_structured_failure_surfaces_error() {
        let port = fake_monitor(|_| {
            vec![r#"{"status":"failure","error":"no such machine"}"#.to_string()]
        })
        .await;

        let mut client = MonitorClient::connect(port).await.unwrap();
        let err = client
            .execute_structured("uarts", &json!({"machine": "nope"}), DEFAULT_COMMAND_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Command(_)));
    }
}
