// SPDX-License-Identifier: MIT OR Apache-2.0
//! Advisory file locking shared by the file-backed backends.
//!
//! Locks are cooperative `flock()`-style locks via `fs2`. They serialize
//! access between processes that agree to take them; the kernel does not
//! enforce anything against a process that skips the protocol.

use std::fs::File;
use std::io::ErrorKind;
use std::thread;
use std::time::Duration;

use fs2::FileExt;

use crate::error::{Result, StoreError};

/// Lock acquisition attempts before giving up.
const LOCK_ATTEMPTS: u32 = 3;

/// Pause between attempts.
const LOCK_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Requested lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared lock: many readers.
    Shared,
    /// Exclusive lock: single writer.
    Exclusive,
}

/// Take an advisory lock on `file`, retrying while another holder is active.
///
/// Tries three times, one second apart, before reporting contention.
///
/// # Errors
///
/// Returns [`StoreError::CannotLock`] when the file stays locked by another
/// process, or the underlying I/O error for anything else.
pub fn lock_file(file: &File, mode: LockMode) -> Result<()> {
    lock_file_with(file, mode, LOCK_ATTEMPTS, LOCK_RETRY_PAUSE)
}

/// Lock with explicit attempt count and pause, so tests avoid real sleeps.
pub(crate) fn lock_file_with(
    file: &File,
    mode: LockMode,
    attempts: u32,
    pause: Duration,
) -> Result<()> {
    for attempt in 0..attempts {
        // Qualified calls: std::fs::File grew same-named inherent methods.
        let taken = match mode {
            LockMode::Shared => FileExt::try_lock_shared(file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(file),
        };
        match taken {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                tracing::debug!(attempt, ?mode, "database locked elsewhere, retrying");
                if attempt + 1 < attempts {
                    thread::sleep(pause);
                }
            }
            Err(e) => return Err(StoreError::Io(e)),
        }
    }
    Err(StoreError::CannotLock(format!("{mode:?} lock unavailable")))
}

/// Release a previously taken advisory lock.
///
/// # Errors
///
/// Returns [`StoreError::CannotLock`] if the unlock call fails.
pub fn unlock_file(file: &File) -> Result<()> {
    FileExt::unlock(file).map_err(|e| StoreError::CannotLock(format!("unlock failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_exclusive_lock_and_unlock() {
        let tmp = NamedTempFile::new().unwrap();
        let file = tmp.reopen().unwrap();
        lock_file(&file, LockMode::Exclusive).unwrap();
        unlock_file(&file).unwrap();
    }

    #[test]
    fn test_shared_locks_coexist() {
        let tmp = NamedTempFile::new().unwrap();
        let a = tmp.reopen().unwrap();
        let b = tmp.reopen().unwrap();
        lock_file(&a, LockMode::Shared).unwrap();
        lock_file_with(&b, LockMode::Shared, 1, Duration::ZERO).unwrap();
        unlock_file(&a).unwrap();
        unlock_file(&b).unwrap();
    }

    #[test]
    fn test_contention_reports_cannot_lock() {
        let tmp = NamedTempFile::new().unwrap();
        let holder = tmp.reopen().unwrap();
        let contender = tmp.reopen().unwrap();
        lock_file(&holder, LockMode::Exclusive).unwrap();
        let err = lock_file_with(&contender, LockMode::Exclusive, 2, Duration::from_millis(1))
            .unwrap_err();
        assert!(matches!(err, StoreError::CannotLock(_)));
        unlock_file(&holder).unwrap();
    }
}
