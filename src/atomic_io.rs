// SPDX-License-Identifier: MIT OR Apache-2.0
//! Crash-safe whole-file writes.
//!
//! Write to a temporary file in the target directory, sync it, rename it
//! over the destination, then fsync the directory. After a crash the file
//! holds either the old content or the new content, never a mix.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};

/// Temporary sibling path for `path`.
fn temp_path(path: &Path, parent: &Path) -> PathBuf {
    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("file");
    parent.join(format!(".{file_name}.tmp.{:08x}", rand::random::<u32>()))
}

#[cfg(unix)]
fn fsync_dir(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Atomically replace `path` with `data`.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    write_impl(path, data, false)
}

/// Atomically replace `path` with `data`, owner-read/write only.
///
/// Used for files that hold key material.
pub(crate) fn atomic_write_secret(path: &Path, data: &[u8]) -> Result<()> {
    write_impl(path, data, true)
}

fn write_impl(path: &Path, data: &[u8], secret: bool) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    fs::create_dir_all(&parent)?;

    let temp = temp_path(path, &parent);
    let mut file = File::create(&temp)?;
    if secret {
        restrict_permissions(&file)?;
    }
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(StoreError::Io(e));
    }
    fsync_dir(&parent)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(file: &File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_creates_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        atomic_write(&path, b"first").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.db");
        atomic_write(&path, b"payload").unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_secret_write_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stash");
        atomic_write_secret(&path, b"key bytes").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
