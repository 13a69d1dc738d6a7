// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dump-file backend: a database stored as the foreign product's textual
//! dump.
//!
//! The file starts with the dump header line, followed by one record per
//! line. Values at the raw layer are the dump lines themselves; the value
//! codec hooks translate between lines and records, so the whole common
//! operations layer works unchanged on top. Lines of other record kinds
//! found in an existing dump are preserved across rewrites and skipped
//! during iteration.
//!
//! Every mutation rewrites the file atomically. The format has no
//! incremental update story, which keeps this backend honest as an
//! interchange vehicle rather than a high-churn database.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use crate::atomic_io::atomic_write;
use crate::backend::{Backend, OpenFlags};
use crate::compat;
use crate::error::{Result, StoreError};
use crate::lock::{lock_file, unlock_file, LockMode};
use crate::record::PrincipalRecord;

/// Dump-file backend.
pub struct FlatfileBackend {
    path: PathBuf,
    lock_handle: Option<File>,
    /// Key: canonical principal bytes, or a synthetic `_foreign:<n>` key
    /// for preserved lines of other record kinds. Value: the dump line
    /// without its newline.
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    cursor: Option<Vec<u8>>,
    opened: bool,
    read_only: bool,
    version: u32,
    lock_depth: u32,
    held_mode: Option<LockMode>,
}

impl FlatfileBackend {
    /// Backend over the dump file at `path`. No I/O until `open`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_handle: None,
            entries: BTreeMap::new(),
            cursor: None,
            opened: false,
            read_only: false,
            version: compat::DUMP_VERSION,
            lock_depth: 0,
            held_mode: None,
        }
    }

    /// Path of the dump file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dump format version declared by the file header.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    fn lock_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().map_or_else(
            || std::ffi::OsString::from("dump"),
            std::ffi::OsStr::to_os_string,
        );
        name.push(".lock");
        path.with_file_name(name)
    }

    fn not_open() -> StoreError {
        StoreError::Io(io::Error::new(
            io::ErrorKind::NotConnected,
            "dump file not open",
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
                "flatfile",
                "write to read-only dump file",
            ));
        }
        Ok(())
    }

    fn load(&mut self, text: &str) -> Result<()> {
        let mut lines = text.lines();
        let header = lines
            .next()
            .ok_or_else(|| StoreError::BadVersion("dump header missing".into()))?;
        // The header line is this backend's format marker; a first line
        // that is not a header at all is a version mismatch, not damage.
        self.version = compat::parse_dump_header(header).map_err(|e| match e {
            StoreError::MalformedRecord(_) => {
                StoreError::BadVersion(format!("unrecognized dump header {header:?}"))
            }
            other => other,
        })?;

        self.entries.clear();
        let mut foreign = 0usize;
        for line in lines {
            if line.is_empty() {
                continue;
            }
            match compat::parse_dump_line(line, None)? {
                Some(record) => {
                    self.entries.insert(
                        record.principal.canonical().into_bytes(),
                        line.as_bytes().to_vec(),
                    );
                }
                None => {
                    self.entries.insert(
                        format!("_foreign:{foreign}").into_bytes(),
                        line.as_bytes().to_vec(),
                    );
                    foreign += 1;
                }
            }
        }
        if foreign > 0 {
            tracing::debug!(path = %self.path.display(), foreign, "dump carries non-principal lines");
        }
        Ok(())
    }

    /// Header-only contents of a fresh dump file.
    fn fresh_contents() -> Vec<u8> {
        let mut fresh = compat::dump_header().into_bytes();
        fresh.push(b'\n');
        fresh
    }

    /// Rewrite the file. Always emits the current header, so a rewrite of
    /// an older dump upgrades its declared version.
    fn save(&mut self) -> Result<()> {
        let mut out = Self::fresh_contents();
        for value in self.entries.values() {
            out.extend_from_slice(value);
            out.push(b'\n');
        }
        atomic_write(&self.path, &out)?;
        self.version = compat::DUMP_VERSION;
        Ok(())
    }
}

impl Backend for FlatfileBackend {
    fn name(&self) -> &'static str {
        "flatfile"
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
                    format!("no dump file at {}", self.path.display()),
                )));
            }
            atomic_write(&self.path, &Self::fresh_contents())?;
        } else if flags.truncate {
            if flags.read_only {
                return Err(StoreError::unsupported(
                    "flatfile",
                    "truncate a read-only dump file",
                ));
            }
            atomic_write(&self.path, &Self::fresh_contents())?;
        }

        let lock_handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(Self::lock_path(&self.path))?;

        let text = fs::read_to_string(&self.path)?;
        if text.is_empty() {
            if flags.read_only {
                return Err(StoreError::BadVersion("dump header missing".into()));
            }
            atomic_write(&self.path, &Self::fresh_contents())?;
            self.version = compat::DUMP_VERSION;
            self.entries.clear();
        } else {
            self.load(&text)?;
        }

        self.lock_handle = Some(lock_handle);
        self.read_only = flags.read_only;
        self.opened = true;
        self.cursor = None;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.lock_handle = None;
        self.entries.clear();
        self.cursor = None;
        self.opened = false;
        self.lock_depth = 0;
        self.held_mode = None;
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
        self.entries.insert(key.to_vec(), value.to_vec());
        self.save()
    }

    fn raw_delete(&mut self, key: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        if self.entries.remove(key).is_none() {
            return Err(StoreError::NotFound(
                String::from_utf8_lossy(key).into_owned(),
            ));
        }
        self.save()
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
        self.close()?;
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Io(e)),
        }
        let _ = fs::remove_file(Self::lock_path(&self.path));
        Ok(())
    }

    fn encode_value(&self, record: &PrincipalRecord) -> Result<Vec<u8>> {
        compat::encode_dump_line(record).map(String::into_bytes)
    }

    fn decode_value(&self, value: &[u8]) -> Result<PrincipalRecord> {
        let line = std::str::from_utf8(value).map_err(|_| StoreError::ForeignEntry)?;
        compat::parse_dump_line(line, None)?.ok_or(StoreError::ForeignEntry)
    }
}
