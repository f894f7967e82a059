//! MCP client plumbing: JSON-RPC framing, SSE response decoding, the
//! pooled/pinned HTTP transports, and the per-server client.
//!
//! Only the client half of the protocol lives here; toolgate is never an MCP
//! server. The transport distinguishes two modes because some streamable-HTTP
//! servers bind session state to the TCP connection itself: for those, all
//! requests must ride one pinned connection and the server-assigned session
//! ID is worthless after any reconnect.

mod client;
mod jsonrpc;
mod sse;
mod transport;
mod types;

pub use client::McpClient;
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use sse::parse_sse_response;
pub use transport::{McpError, Transport};
pub use types::Tool;

/// MCP protocol version advertised in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name sent in `initialize` clientInfo.
pub const CLIENT_NAME: &str = "toolgate";
