use serde_json::Value;
use tracing::{debug, warn};

use toolgate_store::{CredStore, ServerSpec};

use crate::jsonrpc::JsonRpcRequest;
use crate::transport::{McpError, Transport};
use crate::types::{Tool, WireTool};
use crate::{CLIENT_NAME, PROTOCOL_VERSION};

#[derive(Default)]
struct SessionState {
    session_id: Option<String>,
    initialized: bool,
}

/// One JSON-RPC session with one configured MCP server.
///
/// Safe to share behind an `Arc`: session state sits behind an async mutex
/// and the transport serializes pinned traffic itself.
pub struct McpClient {
    name: String,
    spec: ServerSpec,
    transport: Transport,
    store: CredStore,
    token: std::sync::Mutex<Option<String>>,
    session: tokio::sync::Mutex<SessionState>,
}

impl McpClient {
    pub fn new(name: &str, spec: ServerSpec, store: CredStore) -> anyhow::Result<Self> {
        let transport = if spec.session_based {
            Transport::pinned(&spec.url, spec.headers.clone())?
        } else {
            Transport::pooled(&spec.url, spec.headers.clone())?
        };
        Ok(Self {
            name: name.to_string(),
            spec,
            transport,
            store,
            token: std::sync::Mutex::new(None),
            session: tokio::sync::Mutex::new(SessionState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    pub fn is_pinned(&self) -> bool {
        self.transport.is_pinned()
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = token;
    }

    fn current_token(&self) -> Option<String> {
        self.token.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Establish the MCP session. Idempotent after the first success.
    ///
    /// For servers that are not session-based, a session ID cached from a
    /// previous daemon lifetime is adopted without an RPC. Session-based
    /// servers always handshake: their IDs die with the TCP connection, so a
    /// cached value would be stale by construction.
    pub async fn initialize(&self) -> Result<(), McpError> {
        let mut session = self.session.lock().await;
        if session.initialized {
            return Ok(());
        }

        if !self.spec.session_based {
            if let Some(sid) = self.store.session_for(&self.name) {
                debug!(server = %self.name, "adopting cached session");
                session.session_id = Some(sid);
                session.initialized = true;
                return Ok(());
            }
        }

        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let (resp, new_session) = self
            .send("initialize", Some(params), session.session_id.as_deref())
            .await?;

        if let Some(err) = resp.error {
            return Err(McpError::Rpc(format!("initialize failed: {}", err.message)));
        }

        if let Some(sid) = new_session.filter(|s| !s.is_empty()) {
            session.session_id = Some(sid.clone());
            if !self.spec.session_based {
                if let Err(e) = self.store.put_session(&self.name, &sid) {
                    warn!(server = %self.name, error = %e, "failed to persist session id");
                }
            }
        }

        session.initialized = true;
        Ok(())
    }

    /// `tools/list`, initializing first if needed.
    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        self.initialize().await?;
        let session_id = self.session.lock().await.session_id.clone();

        let (resp, _) = self.send("tools/list", None, session_id.as_deref()).await?;
        if let Some(err) = resp.error {
            return Err(McpError::Rpc(format!("list tools failed: {}", err.message)));
        }

        let result = resp.result.ok_or(McpError::UnexpectedFormat)?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or(McpError::UnexpectedFormat)?;
        let wire: Vec<WireTool> =
            serde_json::from_value(tools).map_err(|_| McpError::UnexpectedFormat)?;
        Ok(wire.into_iter().map(Tool::from).collect())
    }

    /// `tools/call`, initializing first if needed. Returns the raw result
    /// object; a JSON-RPC error becomes `McpError::Rpc` with the server's
    /// message.
    pub async fn call_tool(&self, tool: &str, arguments: Option<Value>) -> Result<Value, McpError> {
        self.initialize().await?;
        let session_id = self.session.lock().await.session_id.clone();

        let params = serde_json::json!({
            "name": tool,
            "arguments": arguments.unwrap_or_else(|| serde_json::json!({})),
        });
        let (resp, _) = self
            .send("tools/call", Some(params), session_id.as_deref())
            .await?;
        if let Some(err) = resp.error {
            return Err(McpError::Rpc(format!("tool call failed: {}", err.message)));
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }

    /// Drop session state so the next operation re-initializes. Idle
    /// connections close when the transport is dropped; in-flight requests
    /// are never cancelled.
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        session.session_id = None;
        session.initialized = false;
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session.lock().await.session_id.clone()
    }

    async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<&str>,
    ) -> Result<(crate::jsonrpc::JsonRpcResponse, Option<String>), McpError> {
        let request = JsonRpcRequest::new(method, params);
        let token = self.current_token();
        self.transport
            .send(&request, token.as_deref(), session_id)
            .await
    }
}
