// SPDX-License-Identifier: MIT OR Apache-2.0
//! Backend contract: raw byte operations plus a derived record layer.
//!
//! A backend only has to provide keyed byte storage with cursor iteration
//! and locking. The record-level operations (`fetch_record`, `store_record`,
//! `remove_record`, iteration) are implemented once here on top of the raw
//! operations and the value codec hooks. Backends that are not byte-oriented
//! (the directory backend) override the record layer wholesale and reject
//! the raw operations instead.

use std::fmt;
use std::path::Path;

use crate::codec;
use crate::error::{Result, StoreError};
use crate::lock::LockMode;
use crate::record::{Principal, PrincipalRecord};

/// How a database should be opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Open for reading only; writes and marker creation are refused.
    pub read_only: bool,
    /// Create the database if it does not exist yet.
    pub create: bool,
    /// Refuse to open a database that already exists.
    pub exclusive: bool,
    /// Discard any existing contents, leaving an empty database.
    pub truncate: bool,
}

impl OpenFlags {
    /// Read-write, no creation.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            read_only: false,
            create: false,
            exclusive: false,
            truncate: false,
        }
    }

    #[must_use]
    pub const fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    #[must_use]
    pub const fn with_create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    #[must_use]
    pub const fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    #[must_use]
    pub const fn with_truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }
}

/// Pluggable storage for principal records.
///
/// Implementations are byte stores; the default methods turn them into
/// record stores. `lock`/`unlock` must support reentrant acquisition, since
/// batch operations hold a lock across calls that lock again internally.
pub trait Backend: Send {
    /// Short backend name used in logs and `Unsupported` errors.
    fn name(&self) -> &'static str;

    /// Open the underlying database.
    ///
    /// # Errors
    ///
    /// Implementation-specific; a missing database without
    /// [`OpenFlags::create`] is an I/O error, an existing one under
    /// [`OpenFlags::exclusive`] is [`StoreError::AlreadyExists`], an
    /// unrecognized format marker is [`StoreError::BadVersion`].
    fn open(&mut self, flags: OpenFlags) -> Result<()>;

    /// Flush and close. Further operations require a new `open`.
    fn close(&mut self) -> Result<()>;

    /// Look up a raw value.
    fn raw_get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Insert or replace a raw value.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyExists`] when `replace` is false and the key is
    /// present.
    fn raw_put(&mut self, key: &[u8], value: &[u8], replace: bool) -> Result<()>;

    /// Delete a raw value.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when the key is absent.
    fn raw_delete(&mut self, key: &[u8]) -> Result<()>;

    /// Position the cursor at the first entry and return it.
    fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>>;

    /// Advance the cursor and return the next entry; `None` on exhaustion.
    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>>;

    /// Take the database lock (reentrant).
    fn lock(&mut self, mode: LockMode) -> Result<()>;

    /// Release one level of the database lock.
    fn unlock(&mut self) -> Result<()>;

    /// Move the database to a new path.
    fn rename(&mut self, new_path: &Path) -> Result<()>;

    /// Delete the database from disk.
    fn destroy(&mut self) -> Result<()>;

    /// Encode a record into this backend's value representation.
    ///
    /// # Errors
    ///
    /// Serialization failures.
    fn encode_value(&self, record: &PrincipalRecord) -> Result<Vec<u8>> {
        codec::encode_value(record)
    }

    /// Decode this backend's value representation into a record.
    ///
    /// # Errors
    ///
    /// [`StoreError::ForeignEntry`] for values some other product wrote,
    /// decode errors for values of ours that are damaged.
    fn decode_value(&self, value: &[u8]) -> Result<PrincipalRecord> {
        codec::decode_value(value)
    }

    /// Fetch one record under a shared lock.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when the principal is absent.
    fn fetch_record(&mut self, principal: &Principal) -> Result<PrincipalRecord> {
        let key = codec::encode_key(principal);
        self.lock(LockMode::Shared)?;
        let fetched = self.raw_get(&key);
        let value = match fetched {
            Ok(v) => {
                self.unlock()?;
                v
            }
            Err(e) => {
                let _ = self.unlock();
                return Err(e);
            }
        };
        let value = value.ok_or_else(|| StoreError::NotFound(principal.canonical()))?;
        self.decode_value(&value)
    }

    /// Store one record under an exclusive lock.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyExists`] when `replace` is false and the
    /// principal is present; the stored record is left untouched.
    fn store_record(&mut self, record: &PrincipalRecord, replace: bool) -> Result<()> {
        let key = codec::encode_key(&record.principal);
        let value = self.encode_value(record)?;
        self.lock(LockMode::Exclusive)?;
        let stored = self.raw_put(&key, &value, replace);
        match stored {
            Ok(()) => self.unlock(),
            Err(StoreError::AlreadyExists(_)) => {
                let _ = self.unlock();
                Err(StoreError::AlreadyExists(record.principal.canonical()))
            }
            Err(e) => {
                let _ = self.unlock();
                Err(e)
            }
        }
    }

    /// Remove one record under an exclusive lock.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when the principal is absent.
    fn remove_record(&mut self, principal: &Principal) -> Result<()> {
        let key = codec::encode_key(principal);
        self.lock(LockMode::Exclusive)?;
        let removed = self.raw_delete(&key);
        match removed {
            Ok(()) => self.unlock(),
            Err(StoreError::NotFound(_)) => {
                let _ = self.unlock();
                Err(StoreError::NotFound(principal.canonical()))
            }
            Err(e) => {
                let _ = self.unlock();
                Err(e)
            }
        }
    }

    /// First record of an iteration, skipping foreign entries.
    ///
    /// # Errors
    ///
    /// Decode failures of native entries propagate.
    fn first_record(&mut self) -> Result<Option<PrincipalRecord>> {
        let item = self.first()?;
        decode_skipping_foreign(self, item)
    }

    /// Next record of an iteration, skipping foreign entries.
    ///
    /// # Errors
    ///
    /// Decode failures of native entries propagate.
    fn next_record(&mut self) -> Result<Option<PrincipalRecord>> {
        let item = self.next()?;
        decode_skipping_foreign(self, item)
    }
}

impl fmt::Debug for dyn Backend + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend").field("name", &self.name()).finish()
    }
}

/// Decode cursor items until a native record or exhaustion, skipping
/// entries whose key or value envelope marks them as not ours.
fn decode_skipping_foreign<B: Backend + ?Sized>(
    backend: &mut B,
    mut item: Option<(Vec<u8>, Vec<u8>)>,
) -> Result<Option<PrincipalRecord>> {
    loop {
        let Some((key, value)) = item else {
            return Ok(None);
        };
        // Keys are classified first: reserved-prefix and non-principal
        // keys never hold records, whatever their value looks like.
        match codec::decode_key(&key).and_then(|_| backend.decode_value(&value)) {
            Ok(record) => return Ok(Some(record)),
            Err(e) if e.is_foreign_entry() => {
                tracing::debug!(
                    backend = backend.name(),
                    key = %String::from_utf8_lossy(&key),
                    "skipping foreign database entry"
                );
                item = backend.next()?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Write the format marker for this implementation.
pub(crate) fn write_format_marker<B: Backend + ?Sized>(backend: &mut B) -> Result<()> {
    backend.raw_put(codec::FORMAT_MARKER_KEY, codec::FORMAT_MARKER_VALUE, true)
}

/// Verify the format marker of an existing database.
///
/// # Errors
///
/// [`StoreError::BadVersion`] when the marker is missing or unrecognized.
pub(crate) fn check_format_marker<B: Backend + ?Sized>(backend: &mut B) -> Result<()> {
    match backend.raw_get(codec::FORMAT_MARKER_KEY)? {
        Some(value) if value == codec::FORMAT_MARKER_VALUE => Ok(()),
        Some(value) => Err(StoreError::BadVersion(format!(
            "unrecognized database format marker {:?}",
            String::from_utf8_lossy(&value)
        ))),
        None => Err(StoreError::BadVersion(
            "database format marker missing".into(),
        )),
    }
}
