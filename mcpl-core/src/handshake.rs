//! The shim↔daemon connect handshake.
//!
//! The first line a shim writes after connecting must be a
//! [`ConnectRequest`]; the daemon answers with exactly one
//! [`ConnectResponse`] (`connected` or `error`) and, on error, closes the
//! connection. Everything after a successful handshake is plain JSON-RPC.

use serde::{Deserialize, Serialize};

/// Version of the shim↔daemon wire protocol.
pub const PROTOCOL_VERSION: u32 = 1;

/// `{"mcpl":1,"type":"connect","server":"<name>"}`
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectRequest {
    pub mcpl: u32,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub server: String,
}

/// Handshake error codes surfaced on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    /// The first line was not parseable, or its `type` was not `"connect"`.
    InvalidRequest,
    /// Version mismatch or a malformed envelope (e.g. empty server name).
    ProtocolError,
    /// The named server is absent from config, or not managed.
    UnknownServer,
    /// The server subprocess could not be started.
    StartFailed,
}

/// `{"mcpl":1,"type":"connected",...}` or `{"mcpl":1,"type":"error",...}`
#[derive(Debug, Clone, Serialize)]
pub struct ConnectResponse {
    pub mcpl: u32,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<RejectCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ConnectResponse {
    pub fn connected() -> Self {
        ConnectResponse {
            mcpl: PROTOCOL_VERSION,
            kind: "connected",
            status: Some("ready"),
            code: None,
            message: None,
        }
    }

    pub fn error(code: RejectCode, message: impl Into<String>) -> Self {
        ConnectResponse {
            mcpl: PROTOCOL_VERSION,
            kind: "error",
            status: None,
            code: Some(code),
            message: Some(message.into()),
        }
    }
}

/// A handshake that failed validation, with its wire code.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("invalid handshake type {found:?} (expected \"connect\")")]
    InvalidType { found: String },

    #[error(
        "protocol version mismatch: daemon is v{daemon}, client is v{client}; \
         run `mcpl stop` and retry"
    )]
    VersionMismatch { daemon: u32, client: u32 },

    #[error("server name is required in connect request")]
    MissingServer,
}

impl HandshakeError {
    /// The wire code this rejection is reported under.
    pub fn code(&self) -> RejectCode {
        match self {
            HandshakeError::InvalidType { .. } => RejectCode::InvalidRequest,
            HandshakeError::VersionMismatch { .. } | HandshakeError::MissingServer => {
                RejectCode::ProtocolError
            }
        }
    }
}

/// Validate a parsed handshake against the daemon's protocol version.
///
/// Whether the named server actually exists is checked later, against the
/// (freshly reloaded) config.
pub fn validate(req: &ConnectRequest) -> Result<(), HandshakeError> {
    if req.kind != "connect" {
        return Err(HandshakeError::InvalidType {
            found: req.kind.clone(),
        });
    }
    if req.mcpl != PROTOCOL_VERSION {
        return Err(HandshakeError::VersionMismatch {
            daemon: PROTOCOL_VERSION,
            client: req.mcpl,
        });
    }
    if req.server.is_empty() {
        return Err(HandshakeError::MissingServer);
    }
    Ok(())
}
