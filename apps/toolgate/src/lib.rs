//! The toolgate bridge: a persistent daemon that keeps MCP sessions, OAuth
//! tokens, tool caches and locally-spawned servers coherent across many
//! short-lived CLI invocations.
//!
//! The binary in `main.rs` is a thin clap front over these modules; tests
//! drive the daemon in-process against a redirected state directory.

pub mod daemon;
pub mod local;
pub mod rpc;
