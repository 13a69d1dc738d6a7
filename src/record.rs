// SPDX-License-Identifier: MIT OR Apache-2.0
//! Principal record model: identities, key entries, flags, provenance.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, StoreError};

/// An authenticatable identity: name components plus a realm.
///
/// The canonical form `comp1/comp2@REALM` doubles as the raw store key for
/// byte-oriented backends. Component separators are not escaped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Principal {
    /// Name components, most significant first.
    pub components: Vec<String>,
    /// Realm the principal belongs to.
    pub realm: String,
}

impl Principal {
    /// Build a principal from components and a realm.
    #[must_use]
    pub fn new(components: Vec<String>, realm: impl Into<String>) -> Self {
        Self {
            components,
            realm: realm.into(),
        }
    }

    /// Parse `comp1/comp2@REALM`. The last `@` separates the realm.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MalformedRecord`] when the realm separator is
    /// missing or the name part is empty.
    pub fn parse(text: &str) -> Result<Self> {
        let at = text
            .rfind('@')
            .ok_or_else(|| StoreError::MalformedRecord(format!("principal has no realm: {text}")))?;
        let (name, realm) = (&text[..at], &text[at + 1..]);
        if name.is_empty() {
            return Err(StoreError::MalformedRecord(format!(
                "principal has no name components: {text}"
            )));
        }
        Ok(Self {
            components: name.split('/').map(str::to_string).collect(),
            realm: realm.to_string(),
        })
    }

    /// Canonical `comp1/comp2@REALM` rendering.
    #[must_use]
    pub fn canonical(&self) -> String {
        format!("{}@{}", self.components.join("/"), self.realm)
    }

    /// First (most significant) name component, if any.
    #[must_use]
    pub fn local_name(&self) -> Option<&str> {
        self.components.first().map(String::as_str)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Encryption-type identifier carried by keys and supported-etype lists.
///
/// The numeric space follows the conventional Kerberos assignments so that
/// records survive interchange with foreign tooling.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Zeroize,
)]
pub struct EncryptionType(pub i32);

impl EncryptionType {
    pub const DES_CBC_CRC: Self = Self(1);
    pub const DES_CBC_MD4: Self = Self(2);
    pub const DES_CBC_MD5: Self = Self(3);
    pub const DES3_CBC_SHA1: Self = Self(16);
    pub const AES128_CTS_HMAC_SHA1: Self = Self(17);
    pub const AES256_CTS_HMAC_SHA1: Self = Self(18);
    pub const AES128_CTS_HMAC_SHA256: Self = Self(19);
    pub const AES256_CTS_HMAC_SHA384: Self = Self(20);
    pub const RC4_HMAC: Self = Self(23);

    /// Expected plaintext key size in bytes, when the type is known.
    #[must_use]
    pub const fn key_size(self) -> Option<usize> {
        match self.0 {
            1..=3 => Some(8),
            16 => Some(24),
            17 | 19 | 23 => Some(16),
            18 | 20 => Some(32),
            _ => None,
        }
    }
}

impl fmt::Display for EncryptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "etype-{}", self.0)
    }
}

/// Password-to-key salt attached to a [`KeyEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize)]
pub struct Salt {
    /// Salt type identifier (foreign numeric space).
    pub salt_type: i32,
    /// Salt bytes.
    pub data: Vec<u8>,
}

/// One cryptographic key belonging to a record.
///
/// `master_key_version == None` means the buffer holds plaintext key
/// material. `Some(0)` means sealed under an unrecorded master key (resolved
/// to the current one on unseal); `Some(v)` for `v > 0` names the sealing
/// version. Key bytes are zeroized on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyEntry {
    /// Encryption type of the (plaintext) key.
    #[zeroize(skip)]
    pub enctype: EncryptionType,
    /// Plaintext key bytes, or ciphertext once sealed.
    pub key_material: Vec<u8>,
    /// Master-key version tag; absent while plaintext.
    #[zeroize(skip)]
    pub master_key_version: Option<u32>,
    /// Optional password-derivation salt.
    #[zeroize(skip)]
    pub salt: Option<Salt>,
}

impl KeyEntry {
    /// Build a plaintext key entry.
    #[must_use]
    pub const fn new(enctype: EncryptionType, key_material: Vec<u8>) -> Self {
        Self {
            enctype,
            key_material,
            master_key_version: None,
            salt: None,
        }
    }

    /// Whether the entry is sealed under a master key.
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.master_key_version.is_some()
    }
}

impl fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEntry")
            .field("enctype", &self.enctype)
            .field("key_material", &format_args!("<{} bytes>", self.key_material.len()))
            .field("master_key_version", &self.master_key_version)
            .field("salt", &self.salt.as_ref().map(|s| s.salt_type))
            .finish()
    }
}

/// Timestamp plus optional actor, used for created/modified provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Unix time in seconds.
    pub time: i64,
    /// Principal that performed the change, when known.
    pub principal: Option<Principal>,
}

impl Event {
    /// Event stamped with the current wall clock.
    #[must_use]
    pub fn now(principal: Option<Principal>) -> Self {
        Self {
            time: unix_now(),
            principal,
        }
    }
}

/// Monotonic generation marker: wall clock plus a sequence counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Generation {
    /// Unix time in seconds at assignment.
    pub time: i64,
    /// Sequence counter, incremented on every store.
    pub seq: u64,
}

impl Generation {
    /// First generation of a fresh record.
    #[must_use]
    pub fn initial() -> Self {
        Self {
            time: unix_now(),
            seq: 0,
        }
    }

    /// Successor generation: refreshed clock, incremented sequence.
    #[must_use]
    pub fn advanced(&self) -> Self {
        Self {
            time: unix_now(),
            seq: self.seq + 1,
        }
    }
}

/// Behavior flags of a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct PrincipalFlags {
    /// May request postdated tickets.
    pub postdatable: bool,
    /// May request forwardable tickets.
    pub forwardable: bool,
    /// May request proxiable tickets.
    pub proxiable: bool,
    /// May renew tickets.
    pub renewable: bool,
    /// Only initial authentication is accepted.
    pub initial_only: bool,
    /// May act as a service.
    pub server: bool,
    /// May act as a client.
    pub client: bool,
    /// Record is administratively disabled.
    pub invalid: bool,
    /// Preauthentication is required.
    pub requires_preauth: bool,
    /// Hardware authentication is required.
    pub requires_hwauth: bool,
    /// The password must be changed before use.
    pub change_password_required: bool,
}

impl Default for PrincipalFlags {
    fn default() -> Self {
        Self {
            postdatable: true,
            forwardable: true,
            proxiable: true,
            renewable: true,
            initial_only: false,
            server: true,
            client: true,
            invalid: false,
            requires_preauth: false,
            requires_hwauth: false,
            change_password_required: false,
        }
    }
}

impl PrincipalFlags {
    /// Pack into the native bit layout (directory attribute encoding).
    #[must_use]
    pub const fn to_bits(self) -> u32 {
        let mut bits = 0;
        if self.postdatable {
            bits |= 1;
        }
        if self.forwardable {
            bits |= 1 << 1;
        }
        if self.proxiable {
            bits |= 1 << 2;
        }
        if self.renewable {
            bits |= 1 << 3;
        }
        if self.initial_only {
            bits |= 1 << 4;
        }
        if self.server {
            bits |= 1 << 5;
        }
        if self.client {
            bits |= 1 << 6;
        }
        if self.invalid {
            bits |= 1 << 7;
        }
        if self.requires_preauth {
            bits |= 1 << 8;
        }
        if self.requires_hwauth {
            bits |= 1 << 9;
        }
        if self.change_password_required {
            bits |= 1 << 10;
        }
        bits
    }

    /// Unpack from the native bit layout.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self {
            postdatable: bits & 1 != 0,
            forwardable: bits & (1 << 1) != 0,
            proxiable: bits & (1 << 2) != 0,
            renewable: bits & (1 << 3) != 0,
            initial_only: bits & (1 << 4) != 0,
            server: bits & (1 << 5) != 0,
            client: bits & (1 << 6) != 0,
            invalid: bits & (1 << 7) != 0,
            requires_preauth: bits & (1 << 8) != 0,
            requires_hwauth: bits & (1 << 9) != 0,
            change_password_required: bits & (1 << 10) != 0,
        }
    }
}

/// The unit of storage: one principal's full account state.
///
/// Mutation is whole-record replacement only; there is no partial field
/// update at this layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrincipalRecord {
    /// Identity the record belongs to.
    pub principal: Principal,
    /// Current key version number.
    pub kvno: u32,
    /// Keys of the current key version, one per encryption type.
    pub keys: Vec<KeyEntry>,
    /// Start of the validity window (unix seconds).
    pub not_before: Option<i64>,
    /// End of the validity window (unix seconds).
    pub not_after: Option<i64>,
    /// Password expiry time (unix seconds).
    pub password_expiry: Option<i64>,
    /// Maximum ticket lifetime in seconds.
    pub max_life: Option<u32>,
    /// Maximum renewable lifetime in seconds.
    pub max_renewable_life: Option<u32>,
    /// Behavior flags.
    pub flags: PrincipalFlags,
    /// Creation provenance.
    pub created_by: Event,
    /// Last-modification provenance.
    pub modified_by: Option<Event>,
    /// Generation marker, assigned by the store operation.
    pub generation: Option<Generation>,
    /// Encryption types the principal supports, when constrained.
    pub etypes: Option<Vec<EncryptionType>>,
}

impl PrincipalRecord {
    /// Fresh record for a principal with defaults and no keys.
    #[must_use]
    pub fn new(principal: Principal) -> Self {
        Self {
            principal,
            kvno: 1,
            keys: Vec::new(),
            not_before: None,
            not_after: None,
            password_expiry: None,
            max_life: None,
            max_renewable_life: None,
            flags: PrincipalFlags::default(),
            created_by: Event::now(None),
            modified_by: None,
            generation: None,
            etypes: None,
        }
    }

    /// Whether any key entry is sealed under a master key.
    #[must_use]
    pub fn has_sealed_keys(&self) -> bool {
        self.keys.iter().any(KeyEntry::is_sealed)
    }

    /// Field-wise equality that ignores the generation marker, which the
    /// store advances on every write.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.generation = None;
        b.generation = None;
        a == b
    }
}

/// Current unix time in seconds.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_canonical_roundtrip() {
        let p = Principal::parse("host/kdc.example.net@EXAMPLE.NET").unwrap();
        assert_eq!(p.components, vec!["host", "kdc.example.net"]);
        assert_eq!(p.realm, "EXAMPLE.NET");
        assert_eq!(p.canonical(), "host/kdc.example.net@EXAMPLE.NET");
    }

    #[test]
    fn test_parse_requires_realm() {
        assert!(Principal::parse("alice").is_err());
        assert!(Principal::parse("@EXAMPLE").is_err());
    }

    #[test]
    fn test_local_name() {
        let p = Principal::parse("alice/admin@EXAMPLE").unwrap();
        assert_eq!(p.local_name(), Some("alice"));
    }

    #[test]
    fn test_enctype_key_sizes() {
        assert_eq!(EncryptionType::AES256_CTS_HMAC_SHA1.key_size(), Some(32));
        assert_eq!(EncryptionType::AES128_CTS_HMAC_SHA1.key_size(), Some(16));
        assert_eq!(EncryptionType::DES3_CBC_SHA1.key_size(), Some(24));
        assert_eq!(EncryptionType::DES_CBC_CRC.key_size(), Some(8));
        assert_eq!(EncryptionType(999).key_size(), None);
    }

    #[test]
    fn test_key_entry_debug_redacts_material() {
        let entry = KeyEntry::new(EncryptionType::AES256_CTS_HMAC_SHA1, vec![0xAA; 32]);
        let rendered = format!("{entry:?}");
        assert!(rendered.contains("<32 bytes>"));
        assert!(!rendered.contains("170")); // 0xAA
    }

    #[test]
    fn test_generation_advances() {
        let g0 = Generation::initial();
        let g1 = g0.advanced();
        assert_eq!(g1.seq, g0.seq + 1);
        assert!(g1 > g0);
    }

    #[test]
    fn test_flags_bits_roundtrip() {
        let flags = PrincipalFlags {
            invalid: true,
            requires_preauth: true,
            forwardable: false,
            ..PrincipalFlags::default()
        };
        let decoded = PrincipalFlags::from_bits(flags.to_bits());
        assert_eq!(decoded, flags);
    }

    #[test]
    fn test_same_content_ignores_generation() {
        let p = Principal::parse("alice@EXAMPLE").unwrap();
        let mut a = PrincipalRecord::new(p);
        a.keys
            .push(KeyEntry::new(EncryptionType::AES256_CTS_HMAC_SHA1, vec![1; 32]));
        let mut b = a.clone();
        b.generation = Some(Generation::initial());
        a.generation = Some(b.generation.unwrap().advanced());
        assert!(a.same_content(&b));
        b.kvno = 7;
        assert!(!a.same_content(&b));
    }
}
