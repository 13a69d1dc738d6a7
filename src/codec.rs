// SPDX-License-Identifier: MIT OR Apache-2.0
//! Native key/value codec for byte-oriented backends.
//!
//! Values carry a fixed envelope (magic bytes plus a format version) in
//! front of a bincode body. The envelope is what lets iteration tell a
//! record of ours from an entry written by some other product sharing the
//! same database file: a value without the magic is classified as foreign
//! and skipped, while a value with the magic that fails to decode is a
//! real error and surfaces.

use crate::error::{Result, StoreError};
use crate::record::{Principal, PrincipalRecord};

/// Magic bytes identifying a native value.
const VALUE_MAGIC: [u8; 4] = *b"PSDB";

/// Current value format version.
const VALUE_VERSION: u16 = 1;

/// Envelope length: magic plus little-endian version.
const ENVELOPE_LEN: usize = 6;

/// Store key under which the database format marker lives.
pub const FORMAT_MARKER_KEY: &[u8] = b"_pstore:format";

/// Value of the format marker written by this implementation.
pub const FORMAT_MARKER_VALUE: &[u8] = b"2";

/// Serialize a record into an enveloped native value.
///
/// # Errors
///
/// Returns [`StoreError::Serialization`] if the body cannot be encoded.
pub fn encode_value(record: &PrincipalRecord) -> Result<Vec<u8>> {
    let body = bincode::serialize(record)?;
    let mut out = Vec::with_capacity(ENVELOPE_LEN + body.len());
    out.extend_from_slice(&VALUE_MAGIC);
    out.extend_from_slice(&VALUE_VERSION.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode an enveloped native value back into a record.
///
/// # Errors
///
/// Returns [`StoreError::ForeignEntry`] when the envelope magic is absent,
/// [`StoreError::MalformedRecord`] for an unsupported envelope version, and
/// [`StoreError::Serialization`] when the body fails to decode.
pub fn decode_value(value: &[u8]) -> Result<PrincipalRecord> {
    if value.len() < ENVELOPE_LEN || value[..4] != VALUE_MAGIC {
        return Err(StoreError::ForeignEntry);
    }
    let version = u16::from_le_bytes([value[4], value[5]]);
    if version != VALUE_VERSION {
        return Err(StoreError::MalformedRecord(format!(
            "unsupported value format version {version}"
        )));
    }
    Ok(bincode::deserialize(&value[ENVELOPE_LEN..])?)
}

/// Serialize a principal into its raw store key.
#[must_use]
pub fn encode_key(principal: &Principal) -> Vec<u8> {
    principal.canonical().into_bytes()
}

/// Interpret a raw store key as a principal.
///
/// # Errors
///
/// Returns [`StoreError::ForeignEntry`] when the key is not UTF-8, carries
/// the reserved `_pstore:` prefix, or does not parse as a principal name.
pub fn decode_key(key: &[u8]) -> Result<Principal> {
    let text = std::str::from_utf8(key).map_err(|_| StoreError::ForeignEntry)?;
    if text.starts_with("_pstore:") {
        return Err(StoreError::ForeignEntry);
    }
    Principal::parse(text).map_err(|_| StoreError::ForeignEntry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EncryptionType, KeyEntry};

    fn sample_record() -> PrincipalRecord {
        let mut record = PrincipalRecord::new(Principal::parse("alice@EXAMPLE").unwrap());
        record
            .keys
            .push(KeyEntry::new(EncryptionType::AES256_CTS_HMAC_SHA1, vec![0x11; 32]));
        record.kvno = 3;
        record
    }

    #[test]
    fn test_value_roundtrip() {
        let record = sample_record();
        let bytes = encode_value(&record).unwrap();
        assert_eq!(&bytes[..4], b"PSDB");
        let decoded = decode_value(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_missing_magic_is_foreign() {
        let err = decode_value(b"something else entirely").unwrap_err();
        assert!(err.is_foreign_entry());
        let err = decode_value(FORMAT_MARKER_VALUE).unwrap_err();
        assert!(err.is_foreign_entry());
    }

    #[test]
    fn test_corrupt_body_is_not_foreign() {
        let mut bytes = encode_value(&sample_record()).unwrap();
        bytes.truncate(ENVELOPE_LEN + 3);
        let err = decode_value(&bytes).unwrap_err();
        assert!(!err.is_foreign_entry());
    }

    #[test]
    fn test_future_version_rejected() {
        let mut bytes = encode_value(&sample_record()).unwrap();
        bytes[4] = 0xFF;
        let err = decode_value(&bytes).unwrap_err();
        assert!(matches!(err, StoreError::MalformedRecord(_)));
    }

    #[test]
    fn test_key_roundtrip_and_reserved_prefix() {
        let principal = Principal::parse("host/kdc@EXAMPLE").unwrap();
        let key = encode_key(&principal);
        assert_eq!(decode_key(&key).unwrap(), principal);
        assert!(decode_key(FORMAT_MARKER_KEY).unwrap_err().is_foreign_entry());
        assert!(decode_key(&[0xFF, 0xFE]).unwrap_err().is_foreign_entry());
    }
}
