//! Persisted state for the toolgate bridge.
//!
//! Everything the daemon and CLI keep on disk lives under one per-user state
//! directory: the server config (`servers.json`), OAuth material
//! (`tokens.json`, `registrations.json`), cached session IDs
//! (`sessions.json`), the daemon socket and PID files, and per-server log
//! files. This crate owns the layout and the flat JSON persistence; it never
//! does network I/O.

mod config;
mod creds;
mod paths;

pub use config::{Config, LocalSpec, OAuthSpec, ServerSpec};
pub use creds::{ClientRegistration, CredStore, TokenRecord, TokenState};
pub use paths::StatePaths;

/// Seconds of slack subtracted from a token's expiry before it is treated as
/// stale.
pub const TOKEN_EXPIRY_SKEW_SECS: i64 = 60;
