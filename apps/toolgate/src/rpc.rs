//! The unix-socket RPC frame between CLI and daemon: one JSON `Command` in,
//! one JSON `Response` out, newline-agnostic, connection closed after the
//! exchange.

use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::UnixStream;

use toolgate_mcp::McpError;
use toolgate_store::StatePaths;

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// One request to the daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl Command {
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            ..Self::default()
        }
    }
}

/// The closed error code set carried in `Response.error.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    DaemonNotRunning,
    ConnectionFailed,
    Timeout,
    AuthExpired,
    UnknownTool,
    InvalidArgs,
    SchemaError,
    McpError,
    ParseError,
    NotFound,
    Exists,
    InvalidJson,
    DaemonError,
    UnknownAction,
}

impl ErrorCode {
    /// Map an MCP client failure onto the wire code.
    pub fn from_mcp_error(e: &McpError) -> Self {
        match e {
            McpError::Connect(_) => ErrorCode::ConnectionFailed,
            McpError::Timeout => ErrorCode::Timeout,
            _ => ErrorCode::McpError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// Every daemon reply and every CLI stdout document has this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(data: impl Serialize) -> Self {
        Self {
            ok: true,
            data: serde_json::to_value(data).ok(),
            error: None,
        }
    }

    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Send one command to the daemon and wait for its reply.
pub async fn send_command(paths: &StatePaths, command: &Command) -> anyhow::Result<Response> {
    let socket = paths.socket_file();
    if !socket.exists() {
        return Ok(Response::err(
            ErrorCode::DaemonNotRunning,
            "Daemon not running. Start with `toolgate daemon start`.",
        ));
    }

    let exchange = async {
        let mut stream = UnixStream::connect(&socket)
            .await
            .with_context(|| format!("connect {}", socket.display()))?;
        let payload = serde_json::to_vec(command).context("encode command")?;
        stream.write_all(&payload).await.context("write command")?;
        // Half-close so the daemon sees a complete request even if it reads
        // to EOF.
        stream.shutdown().await.context("shutdown write half")?;

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.context("read response")?;
        serde_json::from_slice::<Response>(&buf).context("decode response")
    };

    tokio::time::timeout(RPC_TIMEOUT, exchange)
        .await
        .context("daemon request timed out")?
}

/// True when a daemon is listening and answers `ping`.
pub async fn ping(paths: &StatePaths) -> bool {
    if !paths.socket_file().exists() {
        return false;
    }
    matches!(send_command(paths, &Command::new("ping")).await, Ok(r) if r.ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_roundtrip() -> anyhow::Result<()> {
        let cmd = Command {
            action: "call".to_string(),
            server: Some("github".to_string()),
            tool: Some("search".to_string()),
            arguments: Some(serde_json::json!({"query": "rust", "count": 42})),
        };
        let v = serde_json::to_value(&cmd)?;
        let back: Command = serde_json::from_value(v)?;
        assert_eq!(back.action, "call");
        assert_eq!(back.server.as_deref(), Some("github"));
        assert_eq!(back.arguments.unwrap()["count"], 42);
        Ok(())
    }

    #[test]
    fn minimal_command_omits_empty_fields() -> anyhow::Result<()> {
        let v = serde_json::to_value(Command::new("ping"))?;
        assert_eq!(v, serde_json::json!({"action": "ping"}));
        Ok(())
    }

    #[test]
    fn response_roundtrip() -> anyhow::Result<()> {
        let resp = Response::ok(serde_json::json!({"n": 1}));
        let back: Response = serde_json::from_value(serde_json::to_value(&resp)?)?;
        assert_eq!(back, resp);

        let resp = Response::err(ErrorCode::NotFound, "server 'x' not configured");
        let v = serde_json::to_value(&resp)?;
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["code"], "NOT_FOUND");
        assert!(v.get("data").is_none());
        let back: Response = serde_json::from_value(v)?;
        assert_eq!(back, resp);
        Ok(())
    }

    #[test]
    fn error_codes_serialize_screaming_snake() -> anyhow::Result<()> {
        for (code, expect) in [
            (ErrorCode::DaemonNotRunning, "DAEMON_NOT_RUNNING"),
            (ErrorCode::ConnectionFailed, "CONNECTION_FAILED"),
            (ErrorCode::Timeout, "TIMEOUT"),
            (ErrorCode::AuthExpired, "AUTH_EXPIRED"),
            (ErrorCode::UnknownTool, "UNKNOWN_TOOL"),
            (ErrorCode::InvalidArgs, "INVALID_ARGS"),
            (ErrorCode::SchemaError, "SCHEMA_ERROR"),
            (ErrorCode::McpError, "MCP_ERROR"),
            (ErrorCode::ParseError, "PARSE_ERROR"),
            (ErrorCode::NotFound, "NOT_FOUND"),
            (ErrorCode::Exists, "EXISTS"),
            (ErrorCode::InvalidJson, "INVALID_JSON"),
            (ErrorCode::DaemonError, "DAEMON_ERROR"),
            (ErrorCode::UnknownAction, "UNKNOWN_ACTION"),
        ] {
            assert_eq!(serde_json::to_value(code)?, serde_json::json!(expect));
        }
        Ok(())
    }

    #[tokio::test]
    async fn send_command_without_socket_is_daemon_not_running() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let paths = StatePaths::new(dir.path());
        let resp = send_command(&paths, &Command::new("ping")).await?;
        assert!(!resp.ok);
        assert_eq!(resp.error.unwrap().code, ErrorCode::DaemonNotRunning);
        assert!(!ping(&paths).await);
        Ok(())
    }
}
