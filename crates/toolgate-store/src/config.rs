use std::collections::HashMap;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::paths::StatePaths;

/// One configured MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub url: String,
    /// Static headers applied to every request to this server.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Session state on this server is bound to the TCP connection; the
    /// transport must pin all requests to a single connection and session IDs
    /// must never be reused across reconnects.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub session_based: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Present when the daemon is responsible for spawning this server as a
    /// local child process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalSpec>,
}

impl ServerSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            session_based: false,
            oauth: None,
            scope: None,
            local: None,
        }
    }
}

/// OAuth hints for a server. All fields optional: anything missing is filled
/// in by discovery at `auth` time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OAuthSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

/// Command line for a locally-spawned MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSpec {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Extra environment merged over the daemon's own.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

/// Root of `servers.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub servers: HashMap<String, ServerSpec>,
}

impl Config {
    /// Load the server config. A missing file is an empty config, not an
    /// error.
    pub fn load(paths: &StatePaths) -> anyhow::Result<Self> {
        let file = paths.servers_file();
        if !file.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&file)
            .with_context(|| format!("read {}", file.display()))?;
        let config: Self =
            serde_json::from_str(&data).with_context(|| format!("parse {}", file.display()))?;
        Ok(config)
    }

    pub fn save(&self, paths: &StatePaths) -> anyhow::Result<()> {
        paths.ensure_base()?;
        let file = paths.servers_file();
        let data = serde_json::to_string_pretty(self).context("encode server config")?;
        std::fs::write(&file, data).with_context(|| format!("write {}", file.display()))?;
        Ok(())
    }

    /// Create the state directory and a starter config if none exists.
    /// Returns true when a new file was written.
    pub fn init_default(paths: &StatePaths) -> anyhow::Result<bool> {
        paths.ensure_base()?;
        if paths.servers_file().exists() {
            return Ok(false);
        }

        let mut servers = HashMap::new();
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer YOUR_TOKEN".to_string());
        servers.insert(
            "example".to_string(),
            ServerSpec {
                headers,
                ..ServerSpec::new("https://mcp.example.com")
            },
        );
        Config { servers }.save(paths)?;
        Ok(true)
    }
}
