//! Path policy for config, socket, and runtime files.
//!
//! Socket placement follows the platform's runtime-dir conventions:
//!
//! - macOS: `$TMPDIR/mcpl-<uid>/mcpl.sock`
//! - Linux: `${XDG_RUNTIME_DIR:-/tmp/mcpl-<uid>}/mcpl/mcpl.sock`
//!
//! Config and PID files live under the config dir (`$MCPL_CONFIG_DIR`, or
//! the platform config base + `mcpl`).

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

fn home_dir() -> Result<PathBuf, ConfigError> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or(ConfigError::UnresolvablePath {
            what: "home directory",
            reason: "HOME is not set".to_string(),
        })
}

/// The mcpl configuration directory. `$MCPL_CONFIG_DIR` overrides.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    if let Some(dir) = env::var_os("MCPL_CONFIG_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let base = if cfg!(target_os = "macos") {
        home_dir()?.join("Library").join("Application Support")
    } else {
        match env::var_os("XDG_CONFIG_HOME") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => home_dir()?.join(".config"),
        }
    };
    Ok(base.join("mcpl"))
}

/// Path of the daemon's Unix socket.
pub fn socket_path() -> PathBuf {
    let uid = nix::unistd::getuid().as_raw();
    let dir = if cfg!(target_os = "macos") {
        env::temp_dir().join(format!("mcpl-{uid}"))
    } else {
        match env::var_os("XDG_RUNTIME_DIR") {
            Some(runtime) if !runtime.is_empty() => PathBuf::from(runtime).join("mcpl"),
            _ => env::temp_dir().join(format!("mcpl-{uid}")).join("mcpl"),
        }
    };
    dir.join("mcpl.sock")
}

pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json"))
}

pub fn pid_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("mcpl.pid"))
}

/// Read a daemon PID file: one decimal PID, newline-terminated.
pub fn read_daemon_pid(path: &Path) -> Result<u32, ConfigError> {
    let data = fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
    data.trim()
        .parse::<u32>()
        .map_err(|e| ConfigError::InvalidPidFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}
