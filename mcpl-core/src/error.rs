//! Error types shared across the protocol and configuration layers.

use std::path::PathBuf;

/// Errors that can occur when reading or parsing an NDJSON-framed
/// JSON-RPC message.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// A single NDJSON line exceeds the configured maximum size.
    ///
    /// Checked on raw byte length before JSON parsing.
    #[error("message exceeds maximum size of {max_bytes} bytes")]
    MessageTooLarge {
        /// The configured maximum message size in bytes.
        max_bytes: usize,
    },

    /// The line is not valid JSON, or its structure is invalid for JSON-RPC.
    #[error("malformed JSON-RPC message: {reason}")]
    MalformedJson {
        /// Human-readable description of the parse failure.
        reason: String,
    },

    /// The line is not valid UTF-8. Lossy conversion would silently corrupt
    /// payload bytes, so the line is dropped instead.
    #[error("message is not valid UTF-8")]
    InvalidUtf8,

    /// The `jsonrpc` field is missing or not `"2.0"`.
    #[error("missing or unsupported jsonrpc version")]
    InvalidVersion,

    /// The message carries neither an `id` nor a `method`.
    #[error("message has neither id nor method")]
    Unclassifiable,

    /// An underlying IO error occurred while reading a line.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading, validating, or writing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file (or socket directory) is readable by other users.
    #[error(
        "{} has insecure permissions {mode:o} (expected {expected:o}); fix with: chmod {expected:o} {}",
        path.display(),
        path.display()
    )]
    InsecurePermissions {
        path: PathBuf,
        mode: u32,
        expected: u32,
    },

    /// The target of an atomic write is a symlink.
    #[error("refusing to write: {} is a symlink", path.display())]
    SymlinkRefused { path: PathBuf },

    /// The config file contains invalid JSON.
    #[error("parse config {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    /// A duration field does not parse (`idle_timeout`, `server_idle_timeout`).
    #[error("invalid duration {value:?} for {field}: {reason}")]
    InvalidDuration {
        field: &'static str,
        value: String,
        reason: String,
    },

    /// The home directory (or an equivalent base) could not be determined.
    #[error("cannot determine {what}: {reason}")]
    UnresolvablePath {
        what: &'static str,
        reason: String,
    },

    /// The PID file exists but does not contain a decimal PID.
    #[error("invalid PID file {}: {reason}", path.display())]
    InvalidPidFile { path: PathBuf, reason: String },

    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.into(),
            source,
        }
    }
}
