//! OAuth 2.1 for MCP servers, without the agent ever seeing a browser prompt
//! mid-call: discovery (RFC 9728 + RFC 8414), dynamic client registration
//! (RFC 7591), PKCE (RFC 7636), a loopback-redirect authorization flow, and
//! token refresh with proactive expiry buffering.
//!
//! The interactive pieces run from the CLI (`auth <server>`); the daemon only
//! ever calls [`token_for`], which refreshes quietly or reports that a new
//! interactive authorization is needed.

mod callback;
mod discovery;
mod flow;
mod pkce;

pub use callback::{wait_for_callback, AuthCallback, CALLBACK_PORT};
pub use discovery::{discover, Discovery};
pub use flow::{authorize, refresh, token_for};
