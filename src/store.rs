// SPDX-License-Identifier: MIT OR Apache-2.0
//! Common operations facade.
//!
//! [`PrincipalStore`] is the handle applications hold: it owns one backend,
//! an optional master key set and the operation counters, and builds the
//! record-level workflow on top of them. Sealing and generation bookkeeping
//! happen here, once, so backends stay byte-oriented.
//!
//! A handle belongs to one logical session. Nothing here takes an
//! in-process mutex; cross-process exclusion comes from the backend's
//! advisory lock, cross-thread sharing is the caller's problem.

use std::io::{BufRead, Write};
use std::path::Path;

use crate::backend::{Backend, OpenFlags};
use crate::compat;
use crate::error::{Result, StoreError};
use crate::lock::LockMode;
use crate::metrics::{MetricsSnapshot, StoreMetrics};
use crate::mkey::{
    placeholder_key_entry, reseal_key_entry, seal_key_entry, unseal_key_entry, MasterKeySet,
};
use crate::record::{Generation, Principal, PrincipalRecord};

/// One open principal database.
pub struct PrincipalStore {
    backend: Box<dyn Backend>,
    master_keys: Option<MasterKeySet>,
    metrics: StoreMetrics,
    closed: bool,
}

impl PrincipalStore {
    /// Open `backend` and wrap it in a store handle.
    ///
    /// # Errors
    ///
    /// Propagates the backend's `open` failure.
    pub fn open(mut backend: Box<dyn Backend>, flags: OpenFlags) -> Result<Self> {
        backend.open(flags)?;
        Ok(Self {
            backend,
            master_keys: None,
            metrics: StoreMetrics::new(),
            closed: false,
        })
    }

    /// Install the master key set used for sealing and unsealing.
    pub fn set_master_keys(&mut self, keys: MasterKeySet) {
        self.master_keys = Some(keys);
    }

    /// Drop the master key set; records round-trip sealed from here on.
    pub fn clear_master_keys(&mut self) {
        self.master_keys = None;
    }

    #[must_use]
    pub fn master_keys(&self) -> Option<&MasterKeySet> {
        self.master_keys.as_ref()
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Point-in-time operation counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Fetch a principal's record.
    ///
    /// With `decrypt`, every sealed key entry is unsealed before return.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when absent; [`StoreError::NoMasterKey`]
    /// when `decrypt` meets sealed keys and no set is installed.
    pub fn fetch(&mut self, principal: &Principal, decrypt: bool) -> Result<PrincipalRecord> {
        self.fetch_kvno(principal, None, decrypt)
    }

    /// Fetch a principal's record at a key version.
    ///
    /// Only the current key generation is kept, so `Some(target)` succeeds
    /// exactly when the stored kvno is at or below the target.
    ///
    /// # Errors
    ///
    /// As [`PrincipalStore::fetch`]; additionally NotFound when the stored
    /// kvno exceeds `target`.
    pub fn fetch_kvno(
        &mut self,
        principal: &Principal,
        target_kvno: Option<u32>,
        decrypt: bool,
    ) -> Result<PrincipalRecord> {
        let mut record = self.backend.fetch_record(principal)?;
        if let Some(target) = target_kvno {
            if record.kvno > target {
                return Err(StoreError::NotFound(format!(
                    "{} (kvno <= {target})",
                    principal.canonical()
                )));
            }
        }
        if decrypt {
            let unsealed = unseal_record(self.master_keys.as_ref(), &mut record)?;
            self.metrics.record_keys_unsealed(unsealed);
        }
        self.metrics.record_fetch();
        Ok(record)
    }

    /// Store a record.
    ///
    /// The caller's record is not modified: a copy gets its generation
    /// advanced and its plaintext keys sealed under the current master key
    /// (pass-through when no set is installed), then goes to the backend.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyExists`] when `replace` is false and the
    /// principal is present; the stored record is left untouched.
    pub fn store(&mut self, record: &PrincipalRecord, replace: bool) -> Result<()> {
        let mut prepared = record.clone();
        prepared.generation = Some(match &record.generation {
            Some(generation) => generation.advanced(),
            None => Generation::initial(),
        });
        let mut sealed = 0u64;
        if let Some(set) = &self.master_keys {
            for key in &mut prepared.keys {
                if !key.is_sealed() {
                    seal_key_entry(key, set)?;
                    sealed += 1;
                }
            }
        }
        self.backend.store_record(&prepared, replace)?;
        self.metrics.record_store();
        self.metrics.record_keys_sealed(sealed);
        Ok(())
    }

    /// Remove a principal's record.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when absent.
    pub fn remove(&mut self, principal: &Principal) -> Result<()> {
        self.backend.remove_record(principal)?;
        self.metrics.record_remove();
        Ok(())
    }

    /// Visit every record under one shared lock.
    ///
    /// A visitor error aborts the traversal and propagates; exhausting the
    /// store is success. Foreign entries sharing the physical store are
    /// skipped by the backend's cursor.
    ///
    /// # Errors
    ///
    /// Visitor errors, decode errors of native records, lock failures.
    pub fn foreach<F>(&mut self, decrypt: bool, mut visit: F) -> Result<()>
    where
        F: FnMut(&PrincipalRecord) -> Result<()>,
    {
        self.backend.lock(LockMode::Shared)?;
        let walked = self.foreach_locked(decrypt, &mut visit);
        match walked {
            Ok(()) => self.backend.unlock(),
            Err(e) => {
                let _ = self.backend.unlock();
                Err(e)
            }
        }
    }

    fn foreach_locked<F>(&mut self, decrypt: bool, visit: &mut F) -> Result<()>
    where
        F: FnMut(&PrincipalRecord) -> Result<()>,
    {
        let mut item = self.backend.first_record()?;
        while let Some(mut record) = item {
            if decrypt {
                let unsealed = unseal_record(self.master_keys.as_ref(), &mut record)?;
                self.metrics.record_keys_unsealed(unsealed);
            }
            self.metrics.record_iterated();
            visit(&record)?;
            item = self.backend.next_record()?;
        }
        Ok(())
    }

    /// Reseal every record's keys under `new_set` and install it.
    ///
    /// Entries are resealed one at a time; each either moves to the new
    /// set or keeps its old sealed bytes. On a mid-run failure the store
    /// holds a mix of old and new seals, which stays readable as long as
    /// the old versions remain in the stash. Returns the number of records
    /// rewritten.
    ///
    /// # Errors
    ///
    /// [`StoreError::NoMasterKey`] when no current set is installed;
    /// reseal and backend write failures propagate.
    pub fn rekey(&mut self, new_set: MasterKeySet) -> Result<usize> {
        if self.master_keys.is_none() {
            return Err(StoreError::NoMasterKey);
        }
        self.backend.lock(LockMode::Exclusive)?;
        let rewritten = self.rekey_locked(&new_set);
        let rewritten = match rewritten {
            Ok(n) => {
                self.backend.unlock()?;
                n
            }
            Err(e) => {
                let _ = self.backend.unlock();
                return Err(e);
            }
        };
        self.master_keys = Some(new_set);
        tracing::debug!(records = rewritten, "master key rollover complete");
        Ok(rewritten)
    }

    fn rekey_locked(&mut self, new_set: &MasterKeySet) -> Result<usize> {
        let old_set = self
            .master_keys
            .as_ref()
            .ok_or(StoreError::NoMasterKey)?;

        // Materialize first: rewriting entries under a live cursor is
        // backend-dependent behavior.
        let mut records = Vec::new();
        let mut item = self.backend.first_record()?;
        while let Some(record) = item {
            records.push(record);
            item = self.backend.next_record()?;
        }

        let mut resealed = 0u64;
        for record in &mut records {
            for key in &mut record.keys {
                reseal_key_entry(key, old_set, new_set)?;
                resealed += 1;
            }
            self.backend.store_record(record, true)?;
        }
        self.metrics.record_keys_sealed(resealed);
        Ok(records.len())
    }

    /// Write the textual dump of every record, sealed bytes as stored.
    ///
    /// The writer sees no output, not even the header, until the shared
    /// lock is held. Returns the number of records exported.
    ///
    /// # Errors
    ///
    /// Lock, encode and I/O failures propagate.
    pub fn export_dump<W: Write>(&mut self, writer: &mut W) -> Result<usize> {
        self.backend.lock(LockMode::Shared)?;
        let exported = self.export_locked(writer);
        match exported {
            Ok(n) => {
                self.backend.unlock()?;
                Ok(n)
            }
            Err(e) => {
                let _ = self.backend.unlock();
                Err(e)
            }
        }
    }

    fn export_locked<W: Write>(&mut self, writer: &mut W) -> Result<usize> {
        writeln!(writer, "{}", compat::dump_header())?;
        let mut exported = 0usize;
        let mut item = self.backend.first_record()?;
        while let Some(record) = item {
            writeln!(writer, "{}", compat::encode_dump_line(&record)?)?;
            exported += 1;
            item = self.backend.next_record()?;
        }
        Ok(exported)
    }

    /// Load a textual dump, storing every principal line with replace.
    ///
    /// Keys are stored as dumped; a record that arrives without any key
    /// material gets a deterministic placeholder key so it stays usable
    /// until a credential reset. Non-principal lines (policies and the
    /// like) are counted and skipped. Returns the number of records
    /// imported.
    ///
    /// # Errors
    ///
    /// A malformed header or principal line aborts the import.
    pub fn import_dump<R: BufRead>(&mut self, reader: R) -> Result<usize> {
        let mut lines = reader.lines();
        let header = lines
            .next()
            .ok_or_else(|| StoreError::MalformedRecord("dump is empty".into()))??;
        let version = compat::parse_dump_header(&header)?;
        tracing::debug!(version, "loading dump");

        let mut imported = 0usize;
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match compat::parse_dump_line(&line, None)? {
                Some(record) => {
                    self.import_record(record)?;
                    imported += 1;
                }
                None => self.metrics.record_foreign_skipped(),
            }
        }
        Ok(imported)
    }

    /// Import one record in the competitor's binary value format.
    ///
    /// Returns the principal the record was stored under.
    ///
    /// # Errors
    ///
    /// [`StoreError::MalformedRecord`] on any decode overrun.
    pub fn import_foreign_value(
        &mut self,
        value: &[u8],
        target_kvno: Option<u32>,
    ) -> Result<Principal> {
        let record = compat::decode_foreign_value(value, target_kvno)?;
        let principal = record.principal.clone();
        self.import_record(record)?;
        Ok(principal)
    }

    fn import_record(&mut self, mut record: PrincipalRecord) -> Result<()> {
        if record.keys.is_empty() {
            tracing::warn!(
                principal = %record.principal,
                "imported record has no usable key material, fabricating placeholder key"
            );
            record.keys.push(placeholder_key_entry(&record.principal)?);
        }
        self.store(&record, true)
    }

    /// Move the underlying database to a new path.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unsupported`] for backends without a movable resource.
    pub fn rename(&mut self, new_path: &Path) -> Result<()> {
        self.backend.rename(new_path)
    }

    /// Delete the underlying database and consume the handle.
    ///
    /// # Errors
    ///
    /// Backend deletion failures propagate.
    pub fn destroy(mut self) -> Result<()> {
        self.closed = true;
        self.backend.destroy()
    }

    /// Close the handle, flushing backend state.
    ///
    /// Dropping the handle closes it too, discarding any close error.
    ///
    /// # Errors
    ///
    /// Backend close failures propagate.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.backend.close()
    }
}

impl Drop for PrincipalStore {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.backend.close();
        }
    }
}

/// Unseal every sealed key of `record` in place, returning how many were.
fn unseal_record(set: Option<&MasterKeySet>, record: &mut PrincipalRecord) -> Result<u64> {
    if !record.has_sealed_keys() {
        return Ok(0);
    }
    let set = set.ok_or(StoreError::NoMasterKey)?;
    let mut unsealed = 0u64;
    for key in &mut record.keys {
        if key.is_sealed() {
            unseal_key_entry(key, set)?;
            unsealed += 1;
        }
    }
    Ok(unsealed)
}
