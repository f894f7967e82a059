use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context as _;
use http::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::sse::parse_sse_response;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Session ID header, set by the server on `initialize` and echoed by the
/// client on every subsequent request.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Failure classes surfaced by the transport and client layers.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("connection failed: {0}")]
    Connect(#[source] reqwest::Error),
    #[error("request timed out")]
    Timeout,
    #[error("mcp http status {0}")]
    Status(StatusCode),
    #[error("failed to parse response: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("invalid header {0:?}")]
    Header(String),
    #[error("{0}")]
    Rpc(String),
    #[error("unexpected response format")]
    UnexpectedFormat,
}

impl From<reqwest::Error> for McpError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            McpError::Timeout
        } else if e.is_connect() {
            McpError::Connect(e)
        } else {
            McpError::Transport(e)
        }
    }
}

/// One HTTP/1.1 client for one MCP server.
///
/// Pooled mode is a plain client with a per-request timeout. Pinned mode
/// keeps exactly one connection alive forever: one idle slot, no idle
/// timeout, HTTP/1.1 only (no h2 coalescing), and a request gate so a second
/// concurrent request can never force the pool to dial a second connection
/// (a reconnect would silently invalidate the server-assigned session).
pub struct Transport {
    http: reqwest::Client,
    url: Url,
    static_headers: HashMap<String, String>,
    gate: Option<tokio::sync::Mutex<()>>,
}

impl Transport {
    /// Standard pooled client for stateless servers.
    pub fn pooled(url: &str, static_headers: HashMap<String, String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build pooled http client")?;
        Ok(Self {
            http,
            url: Url::parse(url).with_context(|| format!("parse server url {url}"))?,
            static_headers,
            gate: None,
        })
    }

    /// Single-connection client for session-based servers.
    pub fn pinned(url: &str, static_headers: HashMap<String, String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .http1_only()
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(None)
            .tcp_keepalive(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(30))
            // No overall timeout; the read timeout bounds hangs instead.
            .read_timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build pinned http client")?;
        Ok(Self {
            http,
            url: Url::parse(url).with_context(|| format!("parse server url {url}"))?,
            static_headers,
            gate: Some(tokio::sync::Mutex::new(())),
        })
    }

    pub fn is_pinned(&self) -> bool {
        self.gate.is_some()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// POST one JSON-RPC request and decode the response, which may arrive as
    /// plain JSON or as an SSE stream. Returns the decoded response plus the
    /// value of the session header, if the server sent one.
    pub async fn send(
        &self,
        request: &JsonRpcRequest,
        bearer: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<(JsonRpcResponse, Option<String>), McpError> {
        // Requests on a pinned transport are strictly sequential.
        let _serialized = match &self.gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        let headers = self.compose_headers(bearer, session_id)?;
        let resp = self
            .http
            .post(self.url.clone())
            .headers(headers)
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        let new_session = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = resp.text().await.map_err(McpError::from)?;

        debug!(method = %request.method, status = %status, content_type = %content_type, "mcp response");

        let decoded = if content_type.contains("text/event-stream") {
            parse_sse_response(&body)
        } else {
            serde_json::from_str::<JsonRpcResponse>(&body).map_err(McpError::Decode)
        };

        match decoded {
            Ok(response) => Ok((response, new_session)),
            // Non-2xx bodies are still decoded above so a JSON-RPC error
            // object can surface; only when that fails does the status win.
            Err(_) if !status.is_success() => Err(McpError::Status(status)),
            Err(e) => Err(e),
        }
    }

    /// Default headers, then server static headers, then the bearer token
    /// (overriding any static `Authorization`), then the session ID.
    fn compose_headers(
        &self,
        bearer: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<HeaderMap, McpError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );

        for (name, value) in &self.static_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| McpError::Header(name.clone()))?;
            let value =
                HeaderValue::from_str(value).map_err(|_| McpError::Header(name.to_string()))?;
            headers.insert(name, value);
        }

        if let Some(token) = bearer {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| McpError::Header(AUTHORIZATION.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        if let Some(sid) = session_id {
            if !sid.is_empty() {
                let value = HeaderValue::from_str(sid)
                    .map_err(|_| McpError::Header(SESSION_HEADER.to_string()))?;
                headers.insert(SESSION_HEADER, value);
            }
        }

        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooled_and_pinned_modes() -> anyhow::Result<()> {
        let pooled = Transport::pooled("http://127.0.0.1:9/mcp", HashMap::new())?;
        assert!(!pooled.is_pinned());
        let pinned = Transport::pinned("http://127.0.0.1:9/mcp", HashMap::new())?;
        assert!(pinned.is_pinned());
        Ok(())
    }

    #[test]
    fn bearer_overrides_static_authorization() -> anyhow::Result<()> {
        let mut static_headers = HashMap::new();
        static_headers.insert("Authorization".to_string(), "Bearer static".to_string());
        static_headers.insert("X-Custom".to_string(), "yes".to_string());
        let transport = Transport::pooled("http://127.0.0.1:9/mcp", static_headers)?;

        let headers = transport.compose_headers(Some("dynamic"), Some("sess-9"))?;
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer dynamic");
        assert_eq!(headers.get("x-custom").unwrap(), "yes");
        assert_eq!(headers.get(SESSION_HEADER).unwrap(), "sess-9");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(
            headers.get(ACCEPT).unwrap(),
            "application/json, text/event-stream"
        );
        Ok(())
    }

    #[test]
    fn static_authorization_survives_without_token() -> anyhow::Result<()> {
        let mut static_headers = HashMap::new();
        static_headers.insert("Authorization".to_string(), "Bearer static".to_string());
        let transport = Transport::pooled("http://127.0.0.1:9/mcp", static_headers)?;

        let headers = transport.compose_headers(None, None)?;
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer static");
        assert!(headers.get(SESSION_HEADER).is_none());
        Ok(())
    }

    #[test]
    fn empty_session_id_is_not_sent() -> anyhow::Result<()> {
        let transport = Transport::pooled("http://127.0.0.1:9/mcp", HashMap::new())?;
        let headers = transport.compose_headers(None, Some(""))?;
        assert!(headers.get(SESSION_HEADER).is_none());
        Ok(())
    }

    #[test]
    fn invalid_static_header_name_is_rejected() -> anyhow::Result<()> {
        let mut static_headers = HashMap::new();
        static_headers.insert("bad header".to_string(), "v".to_string());
        let transport = Transport::pooled("http://127.0.0.1:9/mcp", static_headers)?;
        assert!(matches!(
            transport.compose_headers(None, None),
            Err(McpError::Header(_))
        ));
        Ok(())
    }
}
