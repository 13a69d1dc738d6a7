// SPDX-License-Identifier: MIT OR Apache-2.0
//! Principal Store: a pluggable database for authentication principals.
//!
//! Records carry a principal's keys, validity window and policy flags. Key
//! material is sealed at rest with AES-256-GCM under a rotatable, versioned
//! master key set. Storage is pluggable behind a byte-oriented backend
//! trait, selected by connection-string scheme:
//!
//! - `engine:/path` (or a bare path) - the native single-file engine, a
//!   checksummed append-only log with compaction
//! - `flatfile:/path` - a competitor-format textual dump file, readable and
//!   writable by the foreign product's tooling
//! - `directory://host/base-dn` and `directoryssl://...` - one directory
//!   entry per principal over a pluggable directory client
//!
//! Cross-process exclusion uses advisory file locks with bounded retries;
//! the compat codec reads the competitor's binary record values and both
//! reads and writes its bulk dump format.
//!
//! ```no_run
//! use principal_store::{
//!     BackendRegistry, MasterKey, MasterKeySet, OpenFlags, PrincipalStore, StoreConfig,
//! };
//!
//! # fn main() -> principal_store::Result<()> {
//! let registry = BackendRegistry::with_builtins(StoreConfig::default());
//! let backend = registry.create("engine:/var/lib/principals.db")?;
//! let mut store = PrincipalStore::open(backend, OpenFlags::new().with_create(true))?;
//! store.set_master_keys(MasterKeySet::with_key(MasterKey::random(1)));
//! # Ok(())
//! # }
//! ```

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_possible_truncation)]

use std::fmt;
use std::path::PathBuf;

mod atomic_io;
mod backend;
mod codec;
pub mod compat;
mod directory;
#[cfg(feature = "dynamic-backends")]
mod dynamic;
mod engine;
mod error;
mod flatfile;
mod lock;
mod metrics;
mod mkey;
mod record;
mod registry;
mod store;

pub use backend::{Backend, OpenFlags};
pub use directory::{
    Attributes, DirectoryBackend, DirectoryClient, DirectoryClientFactory, DirectoryConfig,
    MemoryDirectory, MemoryDirectoryClient,
};
#[cfg(feature = "dynamic-backends")]
pub use dynamic::BackendConstructor;
pub use engine::EngineBackend;
pub use error::{Result, StoreError};
pub use flatfile::FlatfileBackend;
pub use lock::{lock_file, unlock_file, LockMode};
pub use metrics::{MetricsSnapshot, StoreMetrics};
pub use mkey::{
    placeholder_key_entry, reseal_key_entry, seal_key_entry, unseal_key_entry, MasterKey,
    MasterKeySet, KEY_SIZE,
};
pub use record::{
    EncryptionType, Event, Generation, KeyEntry, Principal, PrincipalFlags, PrincipalRecord, Salt,
};
pub use registry::{BackendFactory, BackendRegistry};
pub use store::PrincipalStore;

/// Configuration handed to backend factories by the registry.
#[derive(Clone, Default)]
pub struct StoreConfig {
    /// Client factory for `directory:` backends. `None` gives every
    /// backend its own private in-memory directory.
    pub directory_client: Option<DirectoryClientFactory>,
    /// Directories searched for dynamically loaded backend modules.
    pub module_paths: Vec<PathBuf>,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field(
                "directory_client",
                &self.directory_client.as_ref().map(|_| "<factory>"),
            )
            .field("module_paths", &self.module_paths)
            .finish()
    }
}
