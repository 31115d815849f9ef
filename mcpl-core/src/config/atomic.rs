//! Atomic file writes for config and runtime files.

use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;

use crate::error::ConfigError;

/// Write `data` to `path` atomically via temp file + rename.
///
/// Refuses to replace a symlink. The TOCTOU window between the lstat and the
/// rename is accepted; the parent directories are user-owned with `0700`.
pub fn atomic_write_file(path: &Path, data: &[u8], mode: u32) -> Result<(), ConfigError> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.file_type().is_symlink() {
            return Err(ConfigError::SymlinkRefused {
                path: path.to_path_buf(),
            });
        }
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    ensure_dir(dir, 0o700)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".mcpl-tmp-")
        .tempfile_in(dir)
        .map_err(|e| ConfigError::io(path, e))?;

    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))
        .map_err(|e| ConfigError::io(path, e))?;
    tmp.write_all(data).map_err(|e| ConfigError::io(path, e))?;
    tmp.as_file().sync_all().map_err(|e| ConfigError::io(path, e))?;

    tmp.persist(path)
        .map_err(|e| ConfigError::io(path, e.error))?;
    Ok(())
}

/// Create `dir` (and parents) with the given mode if it does not exist.
pub fn ensure_dir(dir: &Path, mode: u32) -> Result<(), ConfigError> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(dir)
        .map_err(|e| ConfigError::io(dir, e))
}
