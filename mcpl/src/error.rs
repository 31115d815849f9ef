//! Daemon error types.

use std::path::PathBuf;

use mcpl_core::error::ConfigError;

use crate::daemon::server::ServerState;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Another daemon answered the liveness probe on the socket path.
    #[error("another daemon is already listening on {}", path.display())]
    AlreadyRunning { path: PathBuf },

    /// The socket directory is accessible to other users.
    #[error(
        "socket directory {} has insecure permissions {mode:o} (expected 0700)",
        path.display()
    )]
    InsecureSocketDir { path: PathBuf, mode: u32 },

    /// A state-machine edge outside the allowed transition table.
    #[error("server {server}: invalid state transition {from} -> {to}")]
    InvalidTransition {
        server: String,
        from: ServerState,
        to: ServerState,
    },

    /// The crash budget is exhausted; starts are refused until reset.
    #[error("server {server} has failed (too many crashes); restart it to reset")]
    ServerFailed { server: String },

    /// The subprocess could not be spawned.
    #[error("start server {server}: {reason}")]
    SpawnFailed { server: String, reason: String },

    /// The server's stdin pipe is gone (never started, crashed, or closed
    /// after a write timeout).
    #[error("server {server} stdin not available")]
    StdinUnavailable { server: String },

    /// A stdin write missed the deadline; the pipe has been closed.
    #[error("server {server} stdin write timed out")]
    StdinWriteTimeout { server: String },

    /// The PID file names a process that is gone.
    #[error("daemon not running (stale pid {pid})")]
    NotRunning { pid: u32 },

    /// `add` refuses to overwrite an existing config entry.
    #[error("server {server:?} already exists in config; remove it first")]
    ServerExists { server: String },

    /// An `--env` flag was not of the form `KEY=VALUE`.
    #[error("invalid env entry {pair:?} (expected KEY=VALUE)")]
    InvalidEnvPair { pair: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("serialize message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
