//! Gatehouse - network boundary for a game server
//!
//! Turns client TCP streams into typed, versioned messages and back:
//! - [`protocol`]: opcodes, bit-granular payload cursors and packet framing
//! - [`crypto`]: the pluggable payload cipher
//! - [`network`]: listener, per-connection actor and dispatch registry
//! - [`handlers`]: development handshake handlers
//! - [`config`]: TOML configuration

pub mod config;
pub mod crypto;
pub mod handlers;
pub mod network;
pub mod protocol;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
