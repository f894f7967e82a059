use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool as reported to the agent: name, description, and the untouched
/// input schema. The bridge never interprets `parameters`; it is an opaque
/// pass-through from the server's `inputSchema`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Wire shape of a tool in a `tools/list` result.
#[derive(Debug, Deserialize)]
pub(crate) struct WireTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Option<Value>,
}

impl From<WireTool> for Tool {
    fn from(t: WireTool) -> Self {
        Tool {
            name: t.name,
            description: t.description,
            parameters: t.input_schema,
        }
    }
}
