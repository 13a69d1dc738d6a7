// SPDX-License-Identifier: MIT OR Apache-2.0
//! Single-file key-value engine backend.
//!
//! The database is an append-only log of `[length][crc32][payload]` frames,
//! each payload a serialized put or delete. Opening replays the log into an
//! ordered in-memory table; mutations append a frame and fsync. A torn tail
//! after a crash is dropped with a warning, while a checksum mismatch in
//! the middle of the log is corruption and fails the open. Compaction
//! rewrites the log to one frame per live entry via an atomic replace.
//!
//! Advisory locking uses a sidecar `<path>.lock` file so the lock target
//! survives compaction, which replaces the data file's inode.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::atomic_io::atomic_write;
use crate::backend::{check_format_marker, write_format_marker, Backend, OpenFlags};
use crate::error::{Result, StoreError};
use crate::lock::{lock_file, unlock_file, LockMode};

/// Upper bound on a single frame payload, enforced on append and replay
/// alike; a replayed length above it means corruption.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Obsolete frames tolerated before a mutation triggers compaction.
const COMPACT_THRESHOLD: usize = 1024;

/// One logged mutation.
#[derive(Debug, Serialize, Deserialize)]
enum LogEntry {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Log replay outcome.
struct Replay {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    frames: usize,
    good_offset: u64,
    torn_tail: bool,
}

/// File-backed engine database.
pub struct EngineBackend {
    path: PathBuf,
    file: Option<File>,
    lock_handle: Option<File>,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    cursor: Option<Vec<u8>>,
    opened: bool,
    read_only: bool,
    frames_total: usize,
    lock_depth: u32,
    held_mode: Option<LockMode>,
}

impl EngineBackend {
    /// Backend rooted at `path`. No I/O happens until `open`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            lock_handle: None,
            entries: BTreeMap::new(),
            cursor: None,
            opened: false,
            read_only: false,
            frames_total: 0,
            lock_depth: 0,
            held_mode: None,
        }
    }

    /// Path of the data file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().map_or_else(
            || std::ffi::OsString::from("db"),
            std::ffi::OsStr::to_os_string,
        );
        name.push(".lock");
        path.with_file_name(name)
    }

    fn not_open() -> StoreError {
        StoreError::Io(io::Error::new(
            io::ErrorKind::NotConnected,
            "database not open",
        ))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.opened {
            Ok(())
        } else {
            Err(Self::not_open())
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.read_only {
            return Err(StoreError::unsupported(
                "engine",
                "write to read-only database",
            ));
        }
        Ok(())
    }

    /// Frame length of `payload`, refusing anything replay would reject.
    fn checked_frame_len(payload: &[u8]) -> Result<u32> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(StoreError::MalformedRecord(format!(
                "log frame too large: {} bytes",
                payload.len()
            )));
        }
        Ok(payload.len() as u32)
    }

    fn append_frame(&mut self, entry: &LogEntry) -> Result<()> {
        let payload = bincode::serialize(entry)?;
        let len = Self::checked_frame_len(&payload)?;
        let crc = crc32fast::hash(&payload);

        let file = self.file.as_mut().ok_or_else(Self::not_open)?;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(&crc.to_le_bytes())?;
        file.write_all(&payload)?;
        file.sync_data()?;
        self.frames_total += 1;
        Ok(())
    }

    /// Drop obsolete frames by rewriting the log with one put per entry.
    ///
    /// # Errors
    ///
    /// Fails on read-only or closed databases, and on I/O errors.
    pub fn compact(&mut self) -> Result<()> {
        self.ensure_writable()?;
        let mut buf = Vec::new();
        for (key, value) in &self.entries {
            let payload = bincode::serialize(&LogEntry::Put {
                key: key.clone(),
                value: value.clone(),
            })?;
            let len = Self::checked_frame_len(&payload)?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
            buf.extend_from_slice(&payload);
        }

        let dropped = self.frames_total.saturating_sub(self.entries.len());
        atomic_write(&self.path, &buf)?;
        // The rename replaced the inode; reopen the append handle.
        self.file = Some(OpenOptions::new().append(true).open(&self.path)?);
        self.frames_total = self.entries.len();
        tracing::debug!(path = %self.path.display(), dropped, "compacted database log");
        Ok(())
    }

    fn maybe_compact(&mut self) -> Result<()> {
        if self.frames_total.saturating_sub(self.entries.len()) >= COMPACT_THRESHOLD {
            self.compact()?;
        }
        Ok(())
    }

    /// Drop all in-memory state and file handles without touching disk.
    fn reset_state(&mut self) {
        self.file = None;
        self.lock_handle = None;
        self.entries.clear();
        self.cursor = None;
        self.opened = false;
        self.frames_total = 0;
        self.lock_depth = 0;
        self.held_mode = None;
    }

    fn read_log(path: &Path) -> Result<Replay> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut entries = BTreeMap::new();
        let mut frames = 0usize;
        let mut good_offset = 0u64;
        let mut torn_tail = false;

        loop {
            let mut header = [0u8; 8];
            match read_fully(&mut reader, &mut header) {
                ReadOutcome::Done => break,
                ReadOutcome::Partial => {
                    torn_tail = true;
                    break;
                }
                ReadOutcome::Err(e) => return Err(StoreError::Io(e)),
                ReadOutcome::Ok => {}
            }
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            if len > MAX_FRAME_LEN {
                return Err(StoreError::MalformedRecord(format!(
                    "log frame {frames} declares {len} bytes"
                )));
            }

            let mut payload = vec![0u8; len];
            match read_fully(&mut reader, &mut payload) {
                ReadOutcome::Done | ReadOutcome::Partial => {
                    torn_tail = true;
                    break;
                }
                ReadOutcome::Err(e) => return Err(StoreError::Io(e)),
                ReadOutcome::Ok => {}
            }

            if crc32fast::hash(&payload) != crc {
                return Err(StoreError::MalformedRecord(format!(
                    "log frame {frames} checksum mismatch"
                )));
            }
            let entry: LogEntry = bincode::deserialize(&payload).map_err(|_| {
                StoreError::MalformedRecord(format!("log frame {frames} undecodable"))
            })?;
            match entry {
                LogEntry::Put { key, value } => {
                    entries.insert(key, value);
                }
                LogEntry::Delete { key } => {
                    entries.remove(&key);
                }
            }
            frames += 1;
            good_offset += 8 + len as u64;
        }

        Ok(Replay {
            entries,
            frames,
            good_offset,
            torn_tail,
        })
    }
}

enum ReadOutcome {
    Ok,
    /// Clean EOF before any byte of this read.
    Done,
    /// EOF partway through the read.
    Partial,
    Err(io::Error),
}

fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> ReadOutcome {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 {
                    ReadOutcome::Done
                } else {
                    ReadOutcome::Partial
                };
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return ReadOutcome::Err(e),
        }
    }
    ReadOutcome::Ok
}

impl Backend for EngineBackend {
    fn name(&self) -> &'static str {
        "engine"
    }

    fn open(&mut self, flags: OpenFlags) -> Result<()> {
        if self.opened {
            return Ok(());
        }
        let exists = self.path.exists();
        if exists && flags.exclusive {
            return Err(StoreError::AlreadyExists(self.path.display().to_string()));
        }
        if !exists {
            if flags.read_only || !flags.create {
                return Err(StoreError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no database at {}", self.path.display()),
                )));
            }
            File::create(&self.path)?.sync_all()?;
        } else if flags.truncate {
            if flags.read_only {
                return Err(StoreError::unsupported(
                    "engine",
                    "truncate a read-only database",
                ));
            }
            // An empty log replays to zero frames, so the marker is
            // rewritten further down like on a fresh create.
            let file = OpenOptions::new().write(true).open(&self.path)?;
            file.set_len(0)?;
            file.sync_all()?;
        }

        let lock_handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(Self::lock_path(&self.path))?;

        let replay = Self::read_log(&self.path)?;
        if replay.torn_tail {
            tracing::warn!(
                path = %self.path.display(),
                offset = replay.good_offset,
                "dropping torn log tail"
            );
            if !flags.read_only {
                let file = OpenOptions::new().write(true).open(&self.path)?;
                file.set_len(replay.good_offset)?;
                file.sync_all()?;
            }
        }

        self.entries = replay.entries;
        self.frames_total = replay.frames;
        self.read_only = flags.read_only;
        self.lock_handle = Some(lock_handle);
        self.file = if flags.read_only {
            None
        } else {
            Some(OpenOptions::new().append(true).open(&self.path)?)
        };
        self.opened = true;
        self.cursor = None;

        if self.frames_total == 0 && !flags.read_only {
            write_format_marker(self)?;
        } else if let Err(e) = check_format_marker(self) {
            // A database we refuse must not be rewritten on the way out.
            self.reset_state();
            return Err(e);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.opened {
            return Ok(());
        }
        if !self.read_only && self.frames_total > self.entries.len() {
            self.compact()?;
        }
        self.reset_state();
        Ok(())
    }

    fn raw_get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.entries.get(key).cloned())
    }

    fn raw_put(&mut self, key: &[u8], value: &[u8], replace: bool) -> Result<()> {
        self.ensure_writable()?;
        if !replace && self.entries.contains_key(key) {
            return Err(StoreError::AlreadyExists(
                String::from_utf8_lossy(key).into_owned(),
            ));
        }
        self.append_frame(&LogEntry::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        self.entries.insert(key.to_vec(), value.to_vec());
        self.maybe_compact()
    }

    fn raw_delete(&mut self, key: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        if !self.entries.contains_key(key) {
            return Err(StoreError::NotFound(
                String::from_utf8_lossy(key).into_owned(),
            ));
        }
        self.append_frame(&LogEntry::Delete { key: key.to_vec() })?;
        self.entries.remove(key);
        self.maybe_compact()
    }

    fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.ensure_open()?;
        let item = self
            .entries
            .iter()
            .next()
            .map(|(k, v)| (k.clone(), v.clone()));
        self.cursor = item.as_ref().map(|(k, _)| k.clone());
        Ok(item)
    }

    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.ensure_open()?;
        let Some(pos) = self.cursor.clone() else {
            return Ok(None);
        };
        let item = self
            .entries
            .range((Bound::Excluded(pos), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()));
        self.cursor = item.as_ref().map(|(k, _)| k.clone());
        Ok(item)
    }

    fn lock(&mut self, mode: LockMode) -> Result<()> {
        self.ensure_open()?;
        let handle = self.lock_handle.as_ref().ok_or_else(Self::not_open)?;
        if self.lock_depth > 0 {
            if mode == LockMode::Exclusive && self.held_mode == Some(LockMode::Shared) {
                lock_file(handle, LockMode::Exclusive)?;
                self.held_mode = Some(LockMode::Exclusive);
            }
            self.lock_depth += 1;
            return Ok(());
        }
        lock_file(handle, mode)?;
        self.held_mode = Some(mode);
        self.lock_depth = 1;
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.lock_depth == 0 {
            return Ok(());
        }
        self.lock_depth -= 1;
        if self.lock_depth == 0 {
            if let Some(handle) = self.lock_handle.as_ref() {
                unlock_file(handle)?;
            }
            self.held_mode = None;
        }
        Ok(())
    }

    fn rename(&mut self, new_path: &Path) -> Result<()> {
        let was_open = self.opened;
        let read_only = self.read_only;
        if was_open {
            self.close()?;
        }
        fs::rename(&self.path, new_path)?;
        let _ = fs::remove_file(Self::lock_path(&self.path));
        self.path = new_path.to_path_buf();
        if was_open {
            self.open(OpenFlags::new().with_read_only(read_only))?;
        }
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        self.reset_state();
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Io(e)),
        }
        let _ = fs::remove_file(Self::lock_path(&self.path));
        Ok(())
    }
}
