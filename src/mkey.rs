// SPDX-License-Identifier: MIT OR Apache-2.0
//! Master keys and at-rest sealing of principal key material.
//!
//! A [`MasterKeySet`] holds rotatable AES-256-GCM master keys ordered by
//! version, newest first. Individual [`KeyEntry`] buffers are sealed under
//! the current master key and tagged with its version, so a set that still
//! contains an old version can always unseal records written before a
//! rotation. Version tag `0` is a compatibility convention meaning "sealed
//! under whatever key is current".

use std::fs;
use std::path::Path;

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::atomic_io::atomic_write_secret;
use crate::error::{Result, StoreError};
use crate::record::{EncryptionType, KeyEntry, Principal};

/// Master key size in bytes (AES-256).
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes.
const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes.
const TAG_SIZE: usize = 16;

/// Usage string bound into every seal as associated data.
const SEAL_AAD: &[u8] = b"principal-store key seal v1";

/// Argon2id parameters for passphrase-derived master keys.
const ARGON2_MEMORY_COST: u32 = 65536;
const ARGON2_TIME_COST: u32 = 3;
const ARGON2_PARALLELISM: u32 = 4;

/// Magic bytes of the on-disk key stash.
const STASH_MAGIC: [u8; 4] = *b"PSMK";

/// Current stash format version.
const STASH_VERSION: u16 = 1;

/// One versioned master key (bytes zeroized on drop).
pub struct MasterKey {
    /// Rotation version, 1-based. Higher is newer.
    pub version: u32,
    /// Encryption type the key is declared as.
    pub enctype: EncryptionType,
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("version", &self.version)
            .field("enctype", &self.enctype)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MasterKey {
    /// Build from raw bytes.
    #[must_use]
    pub fn from_bytes(version: u32, bytes: [u8; KEY_SIZE]) -> Self {
        Self {
            version,
            enctype: EncryptionType::AES256_CTS_HMAC_SHA1,
            key: Zeroizing::new(bytes),
        }
    }

    /// Generate a fresh random key for `version`.
    #[must_use]
    pub fn random(version: u32) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_bytes(version, bytes)
    }

    /// Derive a key from a passphrase and salt using Argon2id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Crypto`] if the salt is unusable or derivation
    /// fails.
    pub fn derive(version: u32, passphrase: &[u8], salt: &[u8]) -> Result<Self> {
        let params = Params::new(
            ARGON2_MEMORY_COST,
            ARGON2_TIME_COST,
            ARGON2_PARALLELISM,
            Some(KEY_SIZE),
        )
        .map_err(|e| StoreError::Crypto(format!("invalid argon2 params: {e}")))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut bytes = [0u8; KEY_SIZE];
        argon2
            .hash_password_into(passphrase, salt, &mut bytes)
            .map_err(|e| StoreError::Crypto(format!("argon2 derivation failed: {e}")))?;
        Ok(Self::from_bytes(version, bytes))
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Seal `plaintext`, returning `nonce || ciphertext`.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&*self.key)
            .map_err(|e| StoreError::Crypto(format!("invalid key: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: SEAL_AAD,
                },
            )
            .map_err(|e| StoreError::Crypto(format!("seal failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a `nonce || ciphertext` buffer produced by [`Self::seal`].
    fn open(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(StoreError::MalformedRecord(
                "sealed key material too short".into(),
            ));
        }
        let cipher = Aes256Gcm::new_from_slice(&*self.key)
            .map_err(|e| StoreError::Crypto(format!("invalid key: {e}")))?;
        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);

        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed[NONCE_SIZE..],
                    aad: SEAL_AAD,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| StoreError::Crypto("unseal failed: authentication error".into()))
    }
}

/// Serialized stash entry. Key bytes are wiped when the entry drops.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StashEntry {
    version: u32,
    enctype: i32,
    key: Vec<u8>,
}

/// A set of master keys across rotations, newest version first.
#[derive(Debug, Default)]
pub struct MasterKeySet {
    keys: Vec<MasterKey>,
}

impl MasterKeySet {
    /// Empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self { keys: Vec::new() }
    }

    /// Set holding a single key.
    #[must_use]
    pub fn with_key(key: MasterKey) -> Self {
        Self { keys: vec![key] }
    }

    /// Add a key to the set.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BadVersion`] if the version is already present.
    pub fn add(&mut self, key: MasterKey) -> Result<()> {
        if self.lookup(key.version).is_some() {
            return Err(StoreError::BadVersion(format!(
                "duplicate master key version {}",
                key.version
            )));
        }
        self.keys.push(key);
        self.keys.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(())
    }

    /// Generate a random key one version above the current one and add it.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::add`] failures.
    pub fn generate_next(&mut self) -> Result<u32> {
        let version = self.current().map_or(1, |k| k.version + 1);
        self.add(MasterKey::random(version))?;
        Ok(version)
    }

    /// The newest key, if the set is non-empty.
    #[must_use]
    pub fn current(&self) -> Option<&MasterKey> {
        self.keys.first()
    }

    /// Key with an exact version.
    #[must_use]
    pub fn lookup(&self, version: u32) -> Option<&MasterKey> {
        self.keys.iter().find(|k| k.version == version)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Load a key stash written by [`Self::save`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MalformedRecord`] for a file that is not a
    /// stash or carries keys of the wrong size, [`StoreError::BadVersion`]
    /// for an unsupported stash version.
    pub fn load(path: &Path) -> Result<Self> {
        let data = Zeroizing::new(fs::read(path)?);
        if data.len() < 6 || data[..4] != STASH_MAGIC {
            return Err(StoreError::MalformedRecord(format!(
                "not a master key stash: {}",
                path.display()
            )));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != STASH_VERSION {
            return Err(StoreError::BadVersion(format!(
                "unsupported key stash version {version}"
            )));
        }
        let entries: Vec<StashEntry> = bincode::deserialize(&data[6..])?;

        let mut set = Self::new();
        for entry in &entries {
            let bytes: [u8; KEY_SIZE] = entry.key.as_slice().try_into().map_err(|_| {
                StoreError::MalformedRecord(format!(
                    "master key version {} has wrong size",
                    entry.version
                ))
            })?;
            let mut key = MasterKey::from_bytes(entry.version, bytes);
            key.enctype = EncryptionType(entry.enctype);
            set.add(key)?;
        }
        tracing::debug!(keys = set.len(), path = %path.display(), "loaded master key stash");
        Ok(set)
    }

    /// Persist the set to a stash file readable only by the owner.
    ///
    /// # Errors
    ///
    /// Propagates serialization and I/O failures.
    pub fn save(&self, path: &Path) -> Result<()> {
        let entries: Vec<StashEntry> = self
            .keys
            .iter()
            .map(|k| StashEntry {
                version: k.version,
                enctype: k.enctype.0,
                key: k.key.to_vec(),
            })
            .collect();
        let body = Zeroizing::new(bincode::serialize(&entries)?);

        let mut out = Zeroizing::new(Vec::with_capacity(6 + body.len()));
        out.extend_from_slice(&STASH_MAGIC);
        out.extend_from_slice(&STASH_VERSION.to_le_bytes());
        out.extend_from_slice(&body);
        atomic_write_secret(path, &out)
    }
}

/// Seal a key entry under the set's current master key.
///
/// Already-sealed entries are left untouched.
///
/// # Errors
///
/// Returns [`StoreError::NoMasterKey`] on an empty set, or a crypto error.
pub fn seal_key_entry(entry: &mut KeyEntry, set: &MasterKeySet) -> Result<()> {
    if entry.is_sealed() {
        return Ok(());
    }
    let key = set.current().ok_or(StoreError::NoMasterKey)?;
    let sealed = key.seal(&entry.key_material)?;
    let plaintext = std::mem::replace(&mut entry.key_material, sealed);
    drop(Zeroizing::new(plaintext));
    entry.master_key_version = Some(key.version);
    Ok(())
}

/// Unseal a key entry using the master key its version tag names.
///
/// Plaintext entries are left untouched. A version tag of `0` resolves to
/// the set's current key.
///
/// # Errors
///
/// Returns [`StoreError::NoMasterKey`] on an empty set,
/// [`StoreError::BadVersion`] when the tagged version is missing from the
/// set, [`StoreError::Crypto`] on authentication failure, and
/// [`StoreError::MalformedRecord`] when the recovered key is shorter than
/// the encryption type requires.
pub fn unseal_key_entry(entry: &mut KeyEntry, set: &MasterKeySet) -> Result<()> {
    let Some(tagged) = entry.master_key_version else {
        return Ok(());
    };
    let key = if tagged == 0 {
        set.current().ok_or(StoreError::NoMasterKey)?
    } else {
        set.lookup(tagged).ok_or_else(|| {
            StoreError::BadVersion(format!("master key version {tagged} not available"))
        })?
    };

    let mut plaintext = key.open(&entry.key_material)?;
    if let Some(expected) = entry.enctype.key_size() {
        if plaintext.len() < expected {
            return Err(StoreError::MalformedRecord(format!(
                "unsealed key shorter than {expected} bytes"
            )));
        }
        plaintext.truncate(expected);
    }
    entry.key_material = std::mem::take(&mut *plaintext);
    entry.master_key_version = None;
    Ok(())
}

/// Re-seal an entry from one master key set to another.
///
/// Works on a scratch copy; the entry is replaced only after both the
/// unseal and the new seal succeed.
///
/// # Errors
///
/// Propagates [`unseal_key_entry`] and [`seal_key_entry`] failures.
pub fn reseal_key_entry(
    entry: &mut KeyEntry,
    old_set: &MasterKeySet,
    new_set: &MasterKeySet,
) -> Result<()> {
    let mut scratch = entry.clone();
    unseal_key_entry(&mut scratch, old_set)?;
    seal_key_entry(&mut scratch, new_set)?;
    *entry = scratch;
    Ok(())
}

/// Deterministic placeholder key for a principal migrated from a foreign
/// database without any usable key material. The real key is expected to be
/// set by a later password change.
///
/// # Errors
///
/// Returns [`StoreError::Crypto`] if derivation fails.
pub fn placeholder_key_entry(principal: &Principal) -> Result<KeyEntry> {
    let salt = Sha256::digest(principal.canonical().as_bytes());
    let key = MasterKey::derive(0, b"placeholder key material", &salt)?;
    Ok(KeyEntry::new(
        EncryptionType::AES256_CTS_HMAC_SHA1,
        key.as_bytes().to_vec(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_set(version: u32) -> MasterKeySet {
        MasterKeySet::with_key(MasterKey::from_bytes(version, [version as u8; KEY_SIZE]))
    }

    fn aes_entry() -> KeyEntry {
        KeyEntry::new(EncryptionType::AES256_CTS_HMAC_SHA1, vec![0x42; 32])
    }

    #[test]
    fn test_seal_unseal_roundtrip() {
        let set = test_set(1);
        let mut entry = aes_entry();
        seal_key_entry(&mut entry, &set).unwrap();
        assert_eq!(entry.master_key_version, Some(1));
        assert_ne!(entry.key_material, vec![0x42; 32]);

        unseal_key_entry(&mut entry, &set).unwrap();
        assert_eq!(entry.master_key_version, None);
        assert_eq!(entry.key_material, vec![0x42; 32]);
    }

    #[test]
    fn test_seal_is_idempotent() {
        let set = test_set(1);
        let mut entry = aes_entry();
        seal_key_entry(&mut entry, &set).unwrap();
        let sealed = entry.key_material.clone();
        seal_key_entry(&mut entry, &set).unwrap();
        assert_eq!(entry.key_material, sealed);
    }

    #[test]
    fn test_unseal_plaintext_is_noop() {
        let set = test_set(1);
        let mut entry = aes_entry();
        unseal_key_entry(&mut entry, &set).unwrap();
        assert_eq!(entry.key_material, vec![0x42; 32]);
    }

    #[test]
    fn test_seal_without_keys_fails() {
        let set = MasterKeySet::new();
        let mut entry = aes_entry();
        let err = seal_key_entry(&mut entry, &set).unwrap_err();
        assert!(matches!(err, StoreError::NoMasterKey));
        assert_eq!(entry.key_material, vec![0x42; 32]);
    }

    #[test]
    fn test_version_zero_resolves_to_current() {
        let set = test_set(3);
        let mut entry = aes_entry();
        seal_key_entry(&mut entry, &set).unwrap();
        entry.master_key_version = Some(0);
        unseal_key_entry(&mut entry, &set).unwrap();
        assert_eq!(entry.key_material, vec![0x42; 32]);
    }

    #[test]
    fn test_missing_version_is_bad_version() {
        let set = test_set(1);
        let mut entry = aes_entry();
        seal_key_entry(&mut entry, &set).unwrap();

        let other = test_set(9);
        let err = unseal_key_entry(&mut entry, &other).unwrap_err();
        assert!(matches!(err, StoreError::BadVersion(_)));
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let set = test_set(1);
        let mut entry = aes_entry();
        seal_key_entry(&mut entry, &set).unwrap();

        let wrong = MasterKeySet::with_key(MasterKey::from_bytes(1, [0xEE; KEY_SIZE]));
        let err = unseal_key_entry(&mut entry, &wrong).unwrap_err();
        assert!(matches!(err, StoreError::Crypto(_)));
    }

    #[test]
    fn test_short_key_for_enctype_is_malformed() {
        let set = test_set(1);
        let mut entry = KeyEntry::new(EncryptionType::DES_CBC_CRC, vec![0x01; 4]);
        seal_key_entry(&mut entry, &set).unwrap();
        let err = unseal_key_entry(&mut entry, &set).unwrap_err();
        assert!(matches!(err, StoreError::MalformedRecord(_)));
    }

    #[test]
    fn test_reseal_moves_between_sets() {
        let old = test_set(1);
        let mut new = test_set(1);
        let new_version = new.generate_next().unwrap();
        assert_eq!(new_version, 2);

        let mut entry = aes_entry();
        seal_key_entry(&mut entry, &old).unwrap();
        reseal_key_entry(&mut entry, &old, &new).unwrap();
        assert_eq!(entry.master_key_version, Some(2));

        // A set holding only the new version can unseal it now.
        let mut only_new = MasterKeySet::new();
        only_new
            .add(MasterKey::from_bytes(2, *new.lookup(2).unwrap().as_bytes()))
            .unwrap();
        unseal_key_entry(&mut entry, &only_new).unwrap();
        assert_eq!(entry.key_material, vec![0x42; 32]);
    }

    #[test]
    fn test_reseal_failure_leaves_entry_intact() {
        let set = test_set(1);
        let mut entry = aes_entry();
        seal_key_entry(&mut entry, &set).unwrap();
        let before = entry.clone();

        let empty = MasterKeySet::new();
        assert!(reseal_key_entry(&mut entry, &set, &empty).is_err());
        assert_eq!(entry, before);
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let mut set = test_set(1);
        let err = set.add(MasterKey::random(1)).unwrap_err();
        assert!(matches!(err, StoreError::BadVersion(_)));
    }

    #[test]
    fn test_current_is_highest_version() {
        let mut set = MasterKeySet::new();
        set.add(MasterKey::random(2)).unwrap();
        set.add(MasterKey::random(5)).unwrap();
        set.add(MasterKey::random(3)).unwrap();
        assert_eq!(set.current().unwrap().version, 5);
        assert_eq!(set.lookup(3).unwrap().version, 3);
    }

    #[test]
    fn test_stash_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stash.mkey");

        let mut set = MasterKeySet::new();
        set.add(MasterKey::from_bytes(1, [0x11; KEY_SIZE])).unwrap();
        set.add(MasterKey::from_bytes(2, [0x22; KEY_SIZE])).unwrap();
        set.save(&path).unwrap();

        let loaded = MasterKeySet::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.current().unwrap().version, 2);
        assert_eq!(loaded.lookup(1).unwrap().as_bytes(), &[0x11; KEY_SIZE]);
    }

    #[test]
    fn test_stash_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage");
        std::fs::write(&path, b"not a stash at all").unwrap();
        let err = MasterKeySet::load(&path).unwrap_err();
        assert!(matches!(err, StoreError::MalformedRecord(_)));
    }

    #[test]
    fn test_derive_is_deterministic() {
        let a = MasterKey::derive(1, b"hunter2", b"0123456789abcdef").unwrap();
        let b = MasterKey::derive(1, b"hunter2", b"0123456789abcdef").unwrap();
        let c = MasterKey::derive(1, b"hunter3", b"0123456789abcdef").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_placeholder_is_deterministic_per_principal() {
        let alice = Principal::parse("alice@EXAMPLE").unwrap();
        let bob = Principal::parse("bob@EXAMPLE").unwrap();
        let a1 = placeholder_key_entry(&alice).unwrap();
        let a2 = placeholder_key_entry(&alice).unwrap();
        let b = placeholder_key_entry(&bob).unwrap();
        assert_eq!(a1.key_material, a2.key_material);
        assert_ne!(a1.key_material, b.key_material);
        assert_eq!(a1.key_material.len(), KEY_SIZE);
    }
}
