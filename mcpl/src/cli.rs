//! CLI argument types.
//!
//! Defined apart from `main.rs` so integration tests can construct them
//! directly.

use std::path::PathBuf;

use clap::Args;

/// Arguments for `mcpl daemon`.
///
/// Runs the multiplexing daemon in the foreground. Config and socket
/// locations default to the platform policy; overrides exist for tests and
/// unusual setups.
#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Config file (default: platform config dir + mcpl/config.json).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Unix socket path (default: platform runtime dir).
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Enable debug logging regardless of config.
    #[arg(long)]
    pub verbose: bool,
}

/// Arguments for `mcpl add`.
///
/// Records a server in the config file. A running daemon picks the entry up
/// on the next shim handshake, so no restart is needed.
#[derive(Args, Debug)]
pub struct AddArgs {
    /// Config file (default: platform config dir + mcpl/config.json).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Queue requests to this server one at a time.
    #[arg(long)]
    pub serialize: bool,

    /// Record the entry without daemon process management.
    #[arg(long)]
    pub unmanaged: bool,

    /// Subprocess environment; values may reference host vars as $NAME.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Server name.
    pub name: String,

    /// Server command and arguments.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}
