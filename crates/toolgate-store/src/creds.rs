use std::collections::HashMap;
use std::path::Path;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::paths::StatePaths;
use crate::TOKEN_EXPIRY_SKEW_SECS;

/// An OAuth token as returned by a token endpoint, plus the absolute expiry
/// computed at save time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    /// Unix seconds. Absent or zero means the token does not expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl TokenRecord {
    /// A token is fresh while `now <= expires_at - 60s`; tokens without an
    /// expiry never go stale.
    pub fn is_fresh(&self, now: i64) -> bool {
        match self.expires_at {
            None | Some(0) => true,
            Some(at) => now <= at - TOKEN_EXPIRY_SKEW_SECS,
        }
    }
}

/// Dynamic client registration result (RFC 7591), persisted per server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// Outcome of looking a token up without touching the network.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenState {
    /// No record for this server.
    Missing,
    /// Record is usable as-is.
    Fresh(String),
    /// Record is past (or within 60s of) expiry; carries the refresh token
    /// when one is available.
    Expired { refresh_token: Option<String> },
}

/// Flat persisted credential state: tokens, registrations and cached session
/// IDs, each a JSON map keyed by server name.
#[derive(Debug, Clone)]
pub struct CredStore {
    paths: StatePaths,
}

impl CredStore {
    pub fn new(paths: StatePaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn load_tokens(&self) -> anyhow::Result<HashMap<String, TokenRecord>> {
        load_map(&self.paths.tokens_file())
    }

    pub fn save_token(&self, server: &str, record: TokenRecord) -> anyhow::Result<()> {
        let mut tokens = self.load_tokens().unwrap_or_default();
        tokens.insert(server.to_string(), record);
        self.paths.ensure_base()?;
        write_private(&self.paths.tokens_file(), &tokens)
    }

    pub fn load_registrations(&self) -> anyhow::Result<HashMap<String, ClientRegistration>> {
        load_map(&self.paths.registrations_file())
    }

    pub fn save_registration(
        &self,
        server: &str,
        registration: ClientRegistration,
    ) -> anyhow::Result<()> {
        let mut regs = self.load_registrations().unwrap_or_default();
        regs.insert(server.to_string(), registration);
        self.paths.ensure_base()?;
        write_private(&self.paths.registrations_file(), &regs)
    }

    pub fn load_sessions(&self) -> anyhow::Result<HashMap<String, String>> {
        load_map(&self.paths.sessions_file())
    }

    /// Cached session ID for a server, if any. Only meaningful for servers
    /// that are not session-based; connection-bound session IDs are never
    /// persisted in the first place.
    pub fn session_for(&self, server: &str) -> Option<String> {
        self.load_sessions().ok()?.remove(server)
    }

    pub fn put_session(&self, server: &str, session_id: &str) -> anyhow::Result<()> {
        let mut sessions = self.load_sessions().unwrap_or_default();
        sessions.insert(server.to_string(), session_id.to_string());
        self.paths.ensure_base()?;
        let file = self.paths.sessions_file();
        let data = serde_json::to_string(&sessions).context("encode sessions")?;
        std::fs::write(&file, data).with_context(|| format!("write {}", file.display()))?;
        Ok(())
    }

    pub fn clear_sessions(&self) -> anyhow::Result<()> {
        remove_if_present(&self.paths.sessions_file())
    }

    pub fn clear_tokens(&self) -> anyhow::Result<()> {
        remove_if_present(&self.paths.tokens_file())
    }

    /// Classify the stored token for a server against `now` (unix seconds).
    /// Refreshing an expired token is the caller's job; this only decides.
    pub fn token_state(&self, server: &str, now: i64) -> TokenState {
        let tokens = match self.load_tokens() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load tokens");
                return TokenState::Missing;
            }
        };
        let Some(record) = tokens.get(server) else {
            return TokenState::Missing;
        };
        if record.is_fresh(now) {
            TokenState::Fresh(record.access_token.clone())
        } else {
            TokenState::Expired {
                refresh_token: record.refresh_token.clone(),
            }
        }
    }
}

fn load_map<T: serde::de::DeserializeOwned>(file: &Path) -> anyhow::Result<HashMap<String, T>> {
    if !file.exists() {
        return Ok(HashMap::new());
    }
    let data =
        std::fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parse {}", file.display()))
}

/// Write a JSON map with owner-only permissions. Existing modes are not
/// widened: the chmod runs on every write.
fn write_private<T: Serialize>(file: &Path, value: &T) -> anyhow::Result<()> {
    let data = serde_json::to_string_pretty(value).context("encode state file")?;
    std::fs::write(file, data).with_context(|| format!("write {}", file.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(file, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod 600 {}", file.display()))?;
    }
    Ok(())
}

fn remove_if_present(file: &Path) -> anyhow::Result<()> {
    if !file.exists() {
        return Ok(());
    }
    std::fs::remove_file(file).with_context(|| format!("remove {}", file.display()))
}
