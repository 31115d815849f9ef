//! Protocol primitives and shared registries for the mcpl daemon.
//!
//! This crate holds everything the daemon and its external tooling agree on:
//! the newline-delimited JSON-RPC 2.0 envelope with raw bodies, the
//! shim↔daemon handshake, the MCP-aware routing classification, the global
//! ID mapper, and the configuration schema with its path policy.

pub mod config;
pub mod error;
pub mod handshake;
pub mod jsonrpc;
pub mod mcp;

/// Maximum size of a single NDJSON line, in bytes (10 MiB).
///
/// Applied on every wire: shim↔daemon socket lines and daemon↔server
/// stdin/stdout lines. Checked before JSON parsing so a misbehaving peer
/// cannot force allocation of oversized value trees.
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;
