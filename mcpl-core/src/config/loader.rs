//! Config file loading with a permission gate.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::error::ConfigError;

use super::Config;

/// Load and validate the config file at `path`.
///
/// The file holds server commands and env values (often credentials), so a
/// group- or world-accessible file is rejected before reading. Duration
/// fields are validated here so a bad edit fails at load time, not when a
/// timeout would first fire.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let meta = fs::metadata(path).map_err(|e| ConfigError::io(path, e))?;
    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(ConfigError::InsecurePermissions {
            path: path.to_path_buf(),
            mode,
            expected: 0o600,
        });
    }

    let data = fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
    let cfg: Config = serde_json::from_str(&data).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    cfg.idle_timeout()?;
    cfg.server_idle_timeout()?;

    Ok(cfg)
}
