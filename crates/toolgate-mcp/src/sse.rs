use crate::jsonrpc::JsonRpcResponse;
use crate::transport::McpError;

/// Extract a JSON-RPC response from an SSE body.
///
/// Scans for `data:` lines and returns the first one that decodes as a
/// JSON-RPC response; comments, `event:` lines and unknown fields are
/// skipped. When no `data:` line yields a decode, the whole body is tried as
/// plain JSON, since some servers advertise `text/event-stream` and then send a
/// bare object.
pub fn parse_sse_response(body: &str) -> Result<JsonRpcResponse, McpError> {
    for line in body.trim().lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            let data = rest.trim();
            if data.is_empty() {
                continue;
            }
            if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(data) {
                return Ok(resp);
            }
        }
    }

    serde_json::from_str::<JsonRpcResponse>(body).map_err(McpError::Decode)
}
