// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error types for the principal store.

use thiserror::Error;

/// Result type for principal store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in principal store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record exists for the given principal.
    #[error("principal not found: {0}")]
    NotFound(String),

    /// A record already exists and replacement was not requested.
    #[error("principal already exists: {0}")]
    AlreadyExists(String),

    /// Store format marker missing/unrecognized, or a sealed entry
    /// references a master-key version that is not loaded.
    #[error("version mismatch: {0}")]
    BadVersion(String),

    /// Sealed key material was encountered but no master key set is loaded.
    #[error("sealed key material present but no master key is loaded")]
    NoMasterKey,

    /// Lock acquisition exhausted its retries, or the backend has no
    /// lockable resource.
    #[error("database is in use: {0}")]
    CannotLock(String),

    /// A record failed to decode: a length field ran past the buffer, a
    /// field was inconsistent, or unsealed key material came up short.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// The backend declines to implement this operation.
    #[error("operation not supported by the {backend} backend: {op}")]
    Unsupported {
        /// Backend name.
        backend: &'static str,
        /// Operation name.
        op: &'static str,
    },

    /// A raw entry is not a principal record at all. Iteration skips these;
    /// the variant never escapes `foreach`.
    #[error("entry is not a principal record")]
    ForeignEntry,

    /// Encryption or decryption failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Directory-service operation failed.
    #[error("directory error: {0}")]
    Directory(String),

    /// Connection string carried a scheme no backend claims and no loadable
    /// module resolves. Fatal to store construction.
    #[error("unknown backend scheme: {0}")]
    UnknownScheme(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl StoreError {
    /// Build an [`StoreError::Unsupported`] for a backend/operation pair.
    #[must_use]
    pub const fn unsupported(backend: &'static str, op: &'static str) -> Self {
        Self::Unsupported { backend, op }
    }

    /// Whether iteration may silently skip the entry that produced this
    /// error (foreign, non-principal entries sharing the physical store).
    #[must_use]
    pub const fn is_foreign_entry(&self) -> bool {
        matches!(self, Self::ForeignEntry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let cases: Vec<(StoreError, &str)> = vec![
            (
                StoreError::NotFound("alice@EXAMPLE".into()),
                "principal not found: alice@EXAMPLE",
            ),
            (
                StoreError::AlreadyExists("bob@EXAMPLE".into()),
                "principal already exists: bob@EXAMPLE",
            ),
            (StoreError::NoMasterKey, "sealed key material present but no master key is loaded"),
            (
                StoreError::unsupported("directory", "raw_get"),
                "operation not supported by the directory backend: raw_get",
            ),
            (StoreError::ForeignEntry, "entry is not a principal record"),
        ];
        for (err, expected) in cases {
            assert_eq!(err.to_string(), expected);
        }
    }

    #[test]
    fn test_foreign_entry_classification() {
        assert!(StoreError::ForeignEntry.is_foreign_entry());
        assert!(!StoreError::NoMasterKey.is_foreign_entry());
        assert!(!StoreError::MalformedRecord("truncated".into()).is_foreign_entry());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StoreError = io.into();
        assert!(matches!(err, StoreError::Io(_)));
    }
}
