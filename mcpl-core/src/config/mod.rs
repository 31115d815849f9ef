//! Configuration schema and environment expansion.
//!
//! The config file is JSON at `<config-dir>/config.json`, mode `0600`,
//! written atomically. Loading is in [`loader`]; path policy in [`paths`].

mod atomic;
pub mod duration_format;
mod loader;
mod paths;

pub use atomic::{atomic_write_file, ensure_dir};
pub use loader::load;
pub use paths::{config_dir, config_file_path, pid_file_path, read_daemon_pid, socket_path};

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One server entry under `servers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Executable path of the MCP server.
    pub command: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment for the subprocess. Values may reference host variables
    /// as `$NAME`; see [`resolve_env`].
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Serialize in-flight requests to this server (one at a time).
    #[serde(default, skip_serializing_if = "is_false")]
    pub serialize: bool,

    /// Whether the daemon owns this server's process. Unmanaged entries are
    /// carried in config for external tooling but never tracked by the
    /// daemon.
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub managed: bool,
}

impl ServerConfig {
    pub fn is_managed(&self) -> bool {
        self.managed
    }
}

fn default_true() -> bool {
    true
}

fn is_true(b: &bool) -> bool {
    *b
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Daemon idle timeout, e.g. `"30m"`. Parsed and carried but not yet
    /// wired into shutdown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<String>,

    /// Per-server idle timeout, e.g. `"10m"`. Same status as `idle_timeout`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_idle_timeout: Option<String>,

    /// Log filter: `error`, `warn`, `info`, or `debug`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            idle_timeout: Some("30m".to_string()),
            server_idle_timeout: Some("10m".to_string()),
            log_level: Some("info".to_string()),
            servers: HashMap::new(),
        }
    }
}

impl Config {
    /// The parsed daemon idle timeout, if configured.
    pub fn idle_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        parse_timeout("idle_timeout", self.idle_timeout.as_deref())
    }

    /// The parsed per-server idle timeout, if configured.
    pub fn server_idle_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        parse_timeout("server_idle_timeout", self.server_idle_timeout.as_deref())
    }

    /// Write the config atomically with `0600` permissions.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let mut data = serde_json::to_vec_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        data.push(b'\n');
        atomic_write_file(path, &data, 0o600)
    }
}

fn parse_timeout(
    field: &'static str,
    value: Option<&str>,
) -> Result<Option<Duration>, ConfigError> {
    let Some(value) = value else {
        return Ok(None);
    };
    duration_format::parse_duration(value)
        .map(Some)
        .map_err(|reason| ConfigError::InvalidDuration {
            field,
            value: value.to_string(),
            reason,
        })
}

static ENV_VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").expect("pattern is valid"));

/// Resolve `$NAME` references in env values from the daemon's environment.
///
/// Undefined names resolve to the empty string, and references may be
/// embedded anywhere in a value (`"prefix-$X-suffix"`). Expansion applies to
/// values only, at spawn time.
pub fn resolve_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let resolved = ENV_VAR_PATTERN.replace_all(v, |caps: &regex::Captures<'_>| {
                std::env::var(&caps[1]).unwrap_or_default()
            });
            (k.clone(), resolved.into_owned())
        })
        .collect()
}
