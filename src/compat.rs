// SPDX-License-Identifier: MIT OR Apache-2.0
//! Interchange codec for a competing product's database and dump formats.
//!
//! Two directions, deliberately asymmetric: the binary direction only
//! decodes (their database value format, little-endian, length-prefixed
//! blocks), the textual direction encodes and parses (their bulk dump line
//! format). Unrecognized tagged-block types are skipped by their declared
//! length; any length that would run past the buffer is a hard decode
//! failure and never yields a partial record.
//!
//! Key blocks are grouped by key version, and only the highest version at
//! or below the optionally requested one survives decoding. Older versions
//! are discarded. That matches the foreign product's "latest key wins"
//! reading and is kept bit-for-bit even though it loses key history.

use std::fmt::Write as _;

use crate::error::{Result, StoreError};
use crate::record::{
    EncryptionType, Event, KeyEntry, Principal, PrincipalFlags, PrincipalRecord, Salt,
};

/// Declared base length of a binary record preamble.
const BASE_LENGTH: u16 = 38;

/// Tagged block: last password change (u32 time).
const TAG_LAST_PWD_CHANGE: u16 = 1;

/// Tagged block: modification provenance (u32 time + NUL-terminated name).
const TAG_MOD_PRINC: u16 = 2;

/// Dump version this implementation writes.
pub const DUMP_VERSION: u32 = 6;

/// Oldest and newest dump versions accepted on parse.
const DUMP_VERSION_MIN: u32 = 4;
const DUMP_VERSION_MAX: u32 = 7;

/// Attribute bits of the foreign format. Most use negative polarity: the
/// bit set means the ability is withheld.
mod attr {
    pub const DISALLOW_POSTDATED: u32 = 0x0000_0001;
    pub const DISALLOW_FORWARDABLE: u32 = 0x0000_0002;
    pub const DISALLOW_TGT_BASED: u32 = 0x0000_0004;
    pub const DISALLOW_RENEWABLE: u32 = 0x0000_0008;
    pub const DISALLOW_PROXIABLE: u32 = 0x0000_0010;
    pub const DISALLOW_ALL_TIX: u32 = 0x0000_0040;
    pub const REQUIRES_PRE_AUTH: u32 = 0x0000_0080;
    pub const REQUIRES_HW_AUTH: u32 = 0x0000_0100;
    pub const REQUIRES_PWCHANGE: u32 = 0x0000_0200;
    pub const DISALLOW_SVR: u32 = 0x0000_1000;
}

/// Map foreign attribute bits onto flags. The foreign format has no client
/// bit; every decoded record may act as a client.
fn attributes_to_flags(bits: u32) -> PrincipalFlags {
    PrincipalFlags {
        postdatable: bits & attr::DISALLOW_POSTDATED == 0,
        forwardable: bits & attr::DISALLOW_FORWARDABLE == 0,
        proxiable: bits & attr::DISALLOW_PROXIABLE == 0,
        renewable: bits & attr::DISALLOW_RENEWABLE == 0,
        initial_only: bits & attr::DISALLOW_TGT_BASED != 0,
        server: bits & attr::DISALLOW_SVR == 0,
        client: true,
        invalid: bits & attr::DISALLOW_ALL_TIX != 0,
        requires_preauth: bits & attr::REQUIRES_PRE_AUTH != 0,
        requires_hwauth: bits & attr::REQUIRES_HW_AUTH != 0,
        change_password_required: bits & attr::REQUIRES_PWCHANGE != 0,
    }
}

fn flags_to_attributes(flags: PrincipalFlags) -> u32 {
    let mut bits = 0;
    if !flags.postdatable {
        bits |= attr::DISALLOW_POSTDATED;
    }
    if !flags.forwardable {
        bits |= attr::DISALLOW_FORWARDABLE;
    }
    if !flags.proxiable {
        bits |= attr::DISALLOW_PROXIABLE;
    }
    if !flags.renewable {
        bits |= attr::DISALLOW_RENEWABLE;
    }
    if flags.initial_only {
        bits |= attr::DISALLOW_TGT_BASED;
    }
    if !flags.server {
        bits |= attr::DISALLOW_SVR;
    }
    if flags.invalid {
        bits |= attr::DISALLOW_ALL_TIX;
    }
    if flags.requires_preauth {
        bits |= attr::REQUIRES_PRE_AUTH;
    }
    if flags.requires_hwauth {
        bits |= attr::REQUIRES_HW_AUTH;
    }
    if flags.change_password_required {
        bits |= attr::REQUIRES_PWCHANGE;
    }
    bits
}

/// Bounds-checked little-endian reader.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|&e| e <= self.buf.len());
        let Some(end) = end else {
            return Err(StoreError::MalformedRecord(format!(
                "record truncated at byte {}",
                self.pos
            )));
        };
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// One key block as it appears on the wire: sub-blocks under a key version.
struct RawKeyBlock {
    kvno: u16,
    subs: Vec<(u16, Vec<u8>)>,
}

fn zero_to_none(value: u32) -> Option<i64> {
    (value != 0).then_some(i64::from(value))
}

fn zero_to_none_u32(value: u32) -> Option<u32> {
    (value != 0).then_some(value)
}

/// Convert retained key blocks into key entries.
///
/// Sub-block 0 is the key (payload: u16 declared plaintext length, then
/// ciphertext), sub-block 1 the salt (raw bytes), anything further skipped.
/// Decoded keys keep their foreign ciphertext and are tagged as sealed
/// under an unrecorded master key.
fn key_blocks_to_entries(blocks: Vec<RawKeyBlock>) -> Result<Vec<KeyEntry>> {
    let mut keys = Vec::new();
    for block in blocks {
        let mut subs = block.subs.into_iter();
        let Some((key_type, key_payload)) = subs.next() else {
            continue;
        };
        if key_payload.len() < 2 {
            return Err(StoreError::MalformedRecord(
                "key sub-block shorter than its length prefix".into(),
            ));
        }
        let mut entry = KeyEntry::new(
            EncryptionType(i32::from(key_type)),
            key_payload[2..].to_vec(),
        );
        entry.master_key_version = Some(0);
        if let Some((salt_type, salt_data)) = subs.next() {
            entry.salt = Some(Salt {
                salt_type: i32::from(salt_type),
                data: salt_data,
            });
        }
        keys.push(entry);
    }
    Ok(keys)
}

/// Keep only the blocks of the highest key version at or below `target`.
fn retain_highest_kvno(blocks: Vec<RawKeyBlock>, target: Option<u32>) -> (u32, Vec<RawKeyBlock>) {
    let qualifies = |kvno: u16| target.map_or(true, |t| u32::from(kvno) <= t);
    let Some(winner) = blocks
        .iter()
        .filter(|b| qualifies(b.kvno))
        .map(|b| b.kvno)
        .max()
    else {
        return (0, Vec::new());
    };
    let kept = blocks.into_iter().filter(|b| b.kvno == winner).collect();
    (u32::from(winner), kept)
}

fn parse_principal_bytes(raw: &[u8]) -> Result<Principal> {
    if raw.last() != Some(&0) {
        return Err(StoreError::MalformedRecord(
            "principal name not NUL-terminated".into(),
        ));
    }
    let text = std::str::from_utf8(&raw[..raw.len() - 1])
        .map_err(|_| StoreError::MalformedRecord("principal name is not UTF-8".into()))?;
    Principal::parse(text)
}

/// Decode one binary value of the foreign database format.
///
/// `target_kvno` limits which key version is retained; `None` keeps the
/// highest present.
///
/// # Errors
///
/// [`StoreError::MalformedRecord`] whenever a declared length runs past the
/// buffer or a field is inconsistent. Trailing bytes after the declared
/// content are ignored.
pub fn decode_foreign_value(value: &[u8], target_kvno: Option<u32>) -> Result<PrincipalRecord> {
    let mut r = Reader::new(value);

    let base_len = r.u16()?;
    if base_len != BASE_LENGTH {
        return Err(StoreError::MalformedRecord(format!(
            "unsupported base length {base_len}"
        )));
    }
    let attributes = r.u32()?;
    let max_life = r.u32()?;
    let max_renewable_life = r.u32()?;
    let expiration = r.u32()?;
    let pw_expiration = r.u32()?;
    let _last_success = r.u32()?;
    let _last_failed = r.u32()?;
    let _fail_auth_count = r.u32()?;
    let n_tagged = r.u16()?;
    let n_keys = r.u16()?;

    let princ_len = r.u16()?;
    if princ_len == 0 {
        return Err(StoreError::MalformedRecord(
            "zero-length principal name".into(),
        ));
    }
    let principal = parse_principal_bytes(r.bytes(usize::from(princ_len))?)?;

    let mut modified_by = None;
    for _ in 0..n_tagged {
        let tag_type = r.u16()?;
        let tag_len = usize::from(r.u16()?);
        let contents = r.bytes(tag_len)?;
        match tag_type {
            TAG_LAST_PWD_CHANGE => {
                // Recognized and validated; the model has no field for it.
                if contents.len() != 4 {
                    return Err(StoreError::MalformedRecord(format!(
                        "password-change block of {} bytes",
                        contents.len()
                    )));
                }
            }
            TAG_MOD_PRINC => {
                if contents.len() < 5 {
                    return Err(StoreError::MalformedRecord(
                        "provenance block too short".into(),
                    ));
                }
                let time = u32::from_le_bytes([
                    contents[0],
                    contents[1],
                    contents[2],
                    contents[3],
                ]);
                let who = parse_principal_bytes(&contents[4..])?;
                modified_by = Some(Event {
                    time: i64::from(time),
                    principal: Some(who),
                });
            }
            _ => {}
        }
    }

    let mut blocks = Vec::with_capacity(usize::from(n_keys));
    for _ in 0..n_keys {
        let sub_count = r.u16()?;
        let kvno = r.u16()?;
        let mut subs = Vec::with_capacity(usize::from(sub_count));
        for _ in 0..sub_count {
            let sub_type = r.u16()?;
            let sub_len = usize::from(r.u16()?);
            subs.push((sub_type, r.bytes(sub_len)?.to_vec()));
        }
        blocks.push(RawKeyBlock { kvno, subs });
    }

    let (kvno, kept) = retain_highest_kvno(blocks, target_kvno);
    let keys = key_blocks_to_entries(kept)?;

    Ok(PrincipalRecord {
        principal,
        kvno,
        keys,
        not_before: None,
        not_after: zero_to_none(expiration),
        password_expiry: zero_to_none(pw_expiration),
        max_life: zero_to_none_u32(max_life),
        max_renewable_life: zero_to_none_u32(max_renewable_life),
        flags: attributes_to_flags(attributes),
        created_by: Event {
            time: 0,
            principal: None,
        },
        modified_by,
        generation: None,
        etypes: None,
    })
}

fn time_or_zero(value: Option<i64>) -> u32 {
    value
        .and_then(|t| u32::try_from(t).ok())
        .unwrap_or_default()
}

fn push_field(line: &mut String, contents: &[u8]) {
    if contents.is_empty() {
        line.push_str("\t-1");
    } else {
        let _ = write!(line, "\t{}", hex::encode(contents));
    }
}

/// Header line written at the top of a dump.
#[must_use]
pub fn dump_header() -> String {
    format!("kdb5_util load_dump version {DUMP_VERSION}")
}

/// Parse and validate a dump header line, returning its version.
///
/// # Errors
///
/// [`StoreError::MalformedRecord`] if the line is not a dump header,
/// [`StoreError::BadVersion`] for a version outside the accepted range.
pub fn parse_dump_header(line: &str) -> Result<u32> {
    let version = line
        .trim_end()
        .strip_prefix("kdb5_util load_dump version ")
        .ok_or_else(|| StoreError::MalformedRecord("not a dump header".into()))?;
    let version: u32 = version
        .parse()
        .map_err(|_| StoreError::MalformedRecord("dump header version not numeric".into()))?;
    if !(DUMP_VERSION_MIN..=DUMP_VERSION_MAX).contains(&version) {
        return Err(StoreError::BadVersion(format!(
            "unsupported dump version {version}"
        )));
    }
    Ok(version)
}

/// Encode one record as a textual dump line (no trailing newline).
///
/// Key payloads are written as the stored bytes behind a declared plaintext
/// length, so sealed material passes through unmodified. All binary
/// contents are hex-encoded.
///
/// # Errors
///
/// [`StoreError::MalformedRecord`] if the principal name cannot appear in a
/// tab-separated line.
pub fn encode_dump_line(record: &PrincipalRecord) -> Result<String> {
    let name = record.principal.canonical();
    if name.contains(['\t', '\n']) {
        return Err(StoreError::MalformedRecord(format!(
            "principal name not dumpable: {name}"
        )));
    }

    let mod_event = record.modified_by.as_ref().unwrap_or(&record.created_by);
    let mod_time = u32::try_from(mod_event.time).unwrap_or_default();
    let mod_name = mod_event
        .principal
        .as_ref()
        .map_or_else(|| name.clone(), Principal::canonical);

    let mut pwd_change = Vec::with_capacity(4);
    pwd_change.extend_from_slice(&mod_time.to_le_bytes());

    let mut provenance = Vec::with_capacity(5 + mod_name.len());
    provenance.extend_from_slice(&mod_time.to_le_bytes());
    provenance.extend_from_slice(mod_name.as_bytes());
    provenance.push(0);

    let tagged: [(u16, &[u8]); 2] = [
        (TAG_LAST_PWD_CHANGE, &pwd_change),
        (TAG_MOD_PRINC, &provenance),
    ];

    let mut line = String::new();
    let _ = write!(
        line,
        "princ\t{BASE_LENGTH}\t{}\t{}\t{}\t0\t{name}",
        name.len(),
        tagged.len(),
        record.keys.len(),
    );
    let _ = write!(
        line,
        "\t{}\t{}\t{}\t{}\t{}\t0\t0\t0",
        flags_to_attributes(record.flags),
        record.max_life.unwrap_or_default(),
        record.max_renewable_life.unwrap_or_default(),
        time_or_zero(record.not_after),
        time_or_zero(record.password_expiry),
    );

    for (tag_type, contents) in tagged {
        let _ = write!(line, "\t{tag_type}\t{}", contents.len());
        push_field(&mut line, contents);
    }

    for entry in &record.keys {
        let sub_count = 1 + usize::from(entry.salt.is_some());
        let _ = write!(line, "\t{sub_count}\t{}", record.kvno);

        let declared = entry
            .enctype
            .key_size()
            .unwrap_or(entry.key_material.len());
        let declared = u16::try_from(declared).map_err(|_| {
            StoreError::MalformedRecord(format!("key material too large to dump: {declared} bytes"))
        })?;
        let mut payload = Vec::with_capacity(2 + entry.key_material.len());
        payload.extend_from_slice(&declared.to_le_bytes());
        payload.extend_from_slice(&entry.key_material);
        let _ = write!(line, "\t{}\t{}", entry.enctype.0, payload.len());
        push_field(&mut line, &payload);

        if let Some(salt) = &entry.salt {
            let _ = write!(line, "\t{}\t{}", salt.salt_type, salt.data.len());
            push_field(&mut line, &salt.data);
        }
    }

    line.push_str("\t-1;");
    Ok(line)
}

/// Tokenizer over one tab-separated dump line.
struct LineReader<'a> {
    tokens: std::str::Split<'a, char>,
}

impl<'a> LineReader<'a> {
    fn new(line: &'a str) -> Self {
        Self {
            tokens: line.trim_end_matches(['\r', '\n']).split('\t'),
        }
    }

    fn next(&mut self) -> Result<&'a str> {
        self.tokens
            .next()
            .ok_or_else(|| StoreError::MalformedRecord("dump line truncated".into()))
    }

    fn number<T: std::str::FromStr>(&mut self, what: &str) -> Result<T> {
        let token = self.next()?;
        token.parse().map_err(|_| {
            StoreError::MalformedRecord(format!("bad {what} field {token:?} in dump line"))
        })
    }

    /// A contents field: `-1` for empty, quoted literal text, or hex.
    fn contents(&mut self, declared_len: usize) -> Result<Vec<u8>> {
        let token = self.next()?;
        let bytes = if token == "-1" {
            Vec::new()
        } else if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
            token[1..token.len() - 1].as_bytes().to_vec()
        } else {
            hex::decode(token).map_err(|_| {
                StoreError::MalformedRecord("dump contents neither hex nor quoted".into())
            })?
        };
        if bytes.len() != declared_len {
            return Err(StoreError::MalformedRecord(format!(
                "dump contents length {} does not match declared {declared_len}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }
}

/// Parse one dump line.
///
/// Returns `Ok(None)` for lines of other record kinds (the foreign tool
/// mixes several into one dump), which callers skip.
///
/// # Errors
///
/// [`StoreError::MalformedRecord`] for a `princ` line that is inconsistent
/// or truncated.
pub fn parse_dump_line(line: &str, target_kvno: Option<u32>) -> Result<Option<PrincipalRecord>> {
    let mut r = LineReader::new(line);
    let Ok(kind) = r.next() else {
        return Ok(None);
    };
    if kind != "princ" {
        return Ok(None);
    }

    let base_len: u16 = r.number("base length")?;
    if base_len != BASE_LENGTH {
        return Err(StoreError::MalformedRecord(format!(
            "unsupported base length {base_len}"
        )));
    }
    let name_len: usize = r.number("name length")?;
    let n_tagged: usize = r.number("tagged block count")?;
    let n_keys: usize = r.number("key block count")?;
    let _extension_len: usize = r.number("extension length")?;

    let name = r.next()?;
    if name.len() != name_len {
        return Err(StoreError::MalformedRecord(format!(
            "principal length {} does not match declared {name_len}",
            name.len()
        )));
    }
    let principal = Principal::parse(name)?;

    let attributes: u32 = r.number("attributes")?;
    let max_life: u32 = r.number("max life")?;
    let max_renewable_life: u32 = r.number("max renewable life")?;
    let expiration: u32 = r.number("expiration")?;
    let pw_expiration: u32 = r.number("password expiration")?;
    let _last_success: u32 = r.number("last success")?;
    let _last_failed: u32 = r.number("last failed")?;
    let _fail_auth_count: u32 = r.number("failed auth count")?;

    let mut modified_by = None;
    for _ in 0..n_tagged {
        let tag_type: u16 = r.number("tagged block type")?;
        let tag_len: usize = r.number("tagged block length")?;
        let contents = r.contents(tag_len)?;
        match tag_type {
            TAG_LAST_PWD_CHANGE => {
                if contents.len() != 4 {
                    return Err(StoreError::MalformedRecord(format!(
                        "password-change block of {} bytes",
                        contents.len()
                    )));
                }
            }
            TAG_MOD_PRINC => {
                if contents.len() < 5 {
                    return Err(StoreError::MalformedRecord(
                        "provenance block too short".into(),
                    ));
                }
                let time = u32::from_le_bytes([
                    contents[0],
                    contents[1],
                    contents[2],
                    contents[3],
                ]);
                let who = parse_principal_bytes(&contents[4..])?;
                modified_by = Some(Event {
                    time: i64::from(time),
                    principal: Some(who),
                });
            }
            _ => {}
        }
    }

    let mut blocks = Vec::with_capacity(n_keys);
    for _ in 0..n_keys {
        let sub_count: usize = r.number("key sub-block count")?;
        let kvno: u16 = r.number("key version")?;
        let mut subs = Vec::with_capacity(sub_count);
        for _ in 0..sub_count {
            let sub_type: u16 = r.number("key sub-block type")?;
            let sub_len: usize = r.number("key sub-block length")?;
            subs.push((sub_type, r.contents(sub_len)?));
        }
        blocks.push(RawKeyBlock { kvno, subs });
    }

    if r.next()? != "-1;" {
        return Err(StoreError::MalformedRecord(
            "dump line missing end marker".into(),
        ));
    }

    let (kvno, kept) = retain_highest_kvno(blocks, target_kvno);
    let keys = key_blocks_to_entries(kept)?;

    Ok(Some(PrincipalRecord {
        principal,
        kvno,
        keys,
        not_before: None,
        not_after: zero_to_none(expiration),
        password_expiry: zero_to_none(pw_expiration),
        max_life: zero_to_none_u32(max_life),
        max_renewable_life: zero_to_none_u32(max_renewable_life),
        flags: attributes_to_flags(attributes),
        created_by: Event {
            time: 0,
            principal: None,
        },
        modified_by,
        generation: None,
        etypes: None,
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::record::EncryptionType;

    /// Little-endian byte builder for crafting binary fixtures.
    #[derive(Default)]
    struct W(Vec<u8>);

    impl W {
        fn u16(mut self, v: u16) -> Self {
            self.0.extend_from_slice(&v.to_le_bytes());
            self
        }

        fn u32(mut self, v: u32) -> Self {
            self.0.extend_from_slice(&v.to_le_bytes());
            self
        }

        fn bytes(mut self, v: &[u8]) -> Self {
            self.0.extend_from_slice(v);
            self
        }
    }

    /// A two-kvno fixture: kvno 1 with an RC4 key, kvno 2 with an AES key
    /// plus salt, one provenance block and one skippable unknown block.
    pub(crate) fn fixture() -> Vec<u8> {
        let name = b"alice@EXAMPLE\0";
        let modifier = b"admin/admin@EXAMPLE\0";

        let mut provenance = Vec::new();
        provenance.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        provenance.extend_from_slice(modifier);

        W::default()
            .u16(38) // base length
            .u32(attr::REQUIRES_PRE_AUTH | attr::DISALLOW_FORWARDABLE)
            .u32(36_000) // max life
            .u32(604_800) // max renewable life
            .u32(0) // expiration
            .u32(1_800_000_000) // password expiration
            .u32(7) // last success, skipped
            .u32(8) // last failed, skipped
            .u32(9) // fail auth count, skipped
            .u16(3) // tagged blocks
            .u16(2) // key blocks
            .u16(name.len() as u16)
            .bytes(name)
            // password change block
            .u16(TAG_LAST_PWD_CHANGE)
            .u16(4)
            .u32(1_690_000_000)
            // provenance block
            .u16(TAG_MOD_PRINC)
            .u16(provenance.len() as u16)
            .bytes(&provenance)
            // unknown block, must be skipped by length
            .u16(999)
            .u16(3)
            .bytes(b"xyz")
            // key block kvno 1, one sub-block (RC4)
            .u16(1)
            .u16(1)
            .u16(23)
            .u16(2 + 16)
            .u16(16)
            .bytes(&[0x11; 16])
            // key block kvno 2, key + salt sub-blocks (AES-256)
            .u16(2)
            .u16(2)
            .u16(18)
            .u16(2 + 32)
            .u16(32)
            .bytes(&[0x22; 32])
            .u16(4)
            .u16(7)
            .bytes(b"EXAMPLE")
            .0
    }

    #[test]
    fn test_decode_full_record() {
        let record = decode_foreign_value(&fixture(), None).unwrap();
        assert_eq!(record.principal.canonical(), "alice@EXAMPLE");
        assert_eq!(record.kvno, 2);
        assert_eq!(record.max_life, Some(36_000));
        assert_eq!(record.max_renewable_life, Some(604_800));
        assert_eq!(record.not_after, None);
        assert_eq!(record.password_expiry, Some(1_800_000_000));
        assert!(record.flags.requires_preauth);
        assert!(!record.flags.forwardable);
        assert!(record.flags.postdatable);
        assert!(record.flags.client);

        let modified = record.modified_by.unwrap();
        assert_eq!(modified.time, 1_700_000_000);
        assert_eq!(
            modified.principal.unwrap().canonical(),
            "admin/admin@EXAMPLE"
        );

        assert_eq!(record.keys.len(), 1);
        let key = &record.keys[0];
        assert_eq!(key.enctype, EncryptionType::AES256_CTS_HMAC_SHA1);
        assert_eq!(key.key_material, vec![0x22; 32]);
        assert_eq!(key.master_key_version, Some(0));
        let salt = key.salt.as_ref().unwrap();
        assert_eq!(salt.salt_type, 4);
        assert_eq!(salt.data, b"EXAMPLE");
    }

    #[test]
    fn test_only_highest_kvno_is_retained() {
        // Older key versions are dropped by the decoder. That is the
        // foreign product's behavior, preserved on purpose: key history
        // does not survive this format.
        let record = decode_foreign_value(&fixture(), None).unwrap();
        assert_eq!(record.kvno, 2);
        assert!(record
            .keys
            .iter()
            .all(|k| k.enctype != EncryptionType::RC4_HMAC));

        let record = decode_foreign_value(&fixture(), Some(1)).unwrap();
        assert_eq!(record.kvno, 1);
        assert_eq!(record.keys.len(), 1);
        assert_eq!(record.keys[0].enctype, EncryptionType::RC4_HMAC);
        assert_eq!(record.keys[0].key_material, vec![0x11; 16]);
    }

    #[test]
    fn test_every_truncation_fails() {
        let full = fixture();
        for len in 0..full.len() {
            assert!(
                decode_foreign_value(&full[..len], None).is_err(),
                "prefix of {len} bytes decoded"
            );
        }
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut padded = fixture();
        padded.extend_from_slice(b"trailing junk");
        let record = decode_foreign_value(&padded, None).unwrap();
        assert_eq!(record.principal.canonical(), "alice@EXAMPLE");
    }

    #[test]
    fn test_wrong_base_length_rejected() {
        let mut bad = fixture();
        bad[0] = 39;
        assert!(matches!(
            decode_foreign_value(&bad, None),
            Err(StoreError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_attribute_polarity_roundtrip() {
        let flags = PrincipalFlags {
            forwardable: false,
            server: false,
            invalid: true,
            requires_preauth: true,
            initial_only: true,
            ..PrincipalFlags::default()
        };
        let decoded = attributes_to_flags(flags_to_attributes(flags));
        assert_eq!(decoded, flags);

        // All-zero attributes mean a fully permissive record.
        let permissive = attributes_to_flags(0);
        assert!(permissive.forwardable && permissive.server && permissive.client);
        assert!(!permissive.invalid && !permissive.requires_preauth);
    }

    #[test]
    fn test_dump_header_roundtrip() {
        assert_eq!(parse_dump_header(&dump_header()).unwrap(), DUMP_VERSION);
        assert_eq!(
            parse_dump_header("kdb5_util load_dump version 4\n").unwrap(),
            4
        );
        assert!(matches!(
            parse_dump_header("kdb5_util load_dump version 3"),
            Err(StoreError::BadVersion(_))
        ));
        assert!(parse_dump_header("something else").is_err());
    }

    #[test]
    fn test_dump_line_roundtrip() {
        let mut record =
            PrincipalRecord::new(Principal::parse("host/kdc.example.net@EXAMPLE").unwrap());
        record.kvno = 5;
        record.max_life = Some(36_000);
        record.not_after = Some(2_000_000_000);
        record.flags.forwardable = false;
        record.flags.requires_preauth = true;
        let mut key = KeyEntry::new(EncryptionType::AES128_CTS_HMAC_SHA1, vec![0xAB; 44]);
        key.master_key_version = Some(0);
        key.salt = Some(Salt {
            salt_type: 4,
            data: b"EXAMPLEhost".to_vec(),
        });
        record.keys.push(key);
        record.modified_by = Some(Event {
            time: 1_700_000_000,
            principal: Some(Principal::parse("admin@EXAMPLE").unwrap()),
        });

        let line = encode_dump_line(&record).unwrap();
        assert!(line.starts_with("princ\t38\t"));
        assert!(line.ends_with("\t-1;"));

        let parsed = parse_dump_line(&line, None).unwrap().unwrap();
        assert_eq!(parsed.principal, record.principal);
        assert_eq!(parsed.kvno, 5);
        assert_eq!(parsed.max_life, record.max_life);
        assert_eq!(parsed.not_after, record.not_after);
        assert!(!parsed.flags.forwardable);
        assert!(parsed.flags.requires_preauth);
        assert_eq!(parsed.keys.len(), 1);
        assert_eq!(parsed.keys[0].key_material, vec![0xAB; 44]);
        assert_eq!(parsed.keys[0].master_key_version, Some(0));
        assert_eq!(parsed.keys[0].salt, record.keys[0].salt);
        assert_eq!(
            parsed.modified_by.unwrap().principal.unwrap().canonical(),
            "admin@EXAMPLE"
        );
    }

    #[test]
    fn test_non_princ_lines_are_skipped() {
        assert!(parse_dump_line("policy\tdefault\t0", None).unwrap().is_none());
        assert!(parse_dump_line("", None).unwrap().is_none());
    }

    #[test]
    fn test_truncated_dump_line_fails() {
        let mut record = PrincipalRecord::new(Principal::parse("alice@EXAMPLE").unwrap());
        record
            .keys
            .push(KeyEntry::new(EncryptionType::AES256_CTS_HMAC_SHA1, vec![1; 32]));
        let line = encode_dump_line(&record).unwrap();

        let cut = &line[..line.len() - 10];
        assert!(matches!(
            parse_dump_line(cut, None),
            Err(StoreError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_quoted_contents_accepted() {
        // Printable salts may appear quoted instead of hex-encoded.
        let payload = hex::encode({
            let mut p = vec![16, 0];
            p.extend_from_slice(&[0x55; 16]);
            p
        });
        let line = format!(
            "princ\t38\t13\t0\t1\t0\talice@EXAMPLE\t0\t0\t0\t0\t0\t0\t0\t0\
             \t2\t3\t23\t18\t{payload}\t4\t7\t\"EXAMPLE\"\t-1;"
        );
        let record = parse_dump_line(&line, None).unwrap().unwrap();
        assert_eq!(record.kvno, 3);
        assert_eq!(record.keys[0].enctype, EncryptionType::RC4_HMAC);
        assert_eq!(record.keys[0].salt.as_ref().unwrap().data, b"EXAMPLE");
    }

    #[test]
    fn test_oversized_key_material_cannot_be_dumped() {
        // An unknown enctype has no declared key size, so the stored
        // length goes into the u16 length prefix and must fit it.
        let mut record = PrincipalRecord::new(Principal::parse("bulk@EXAMPLE").unwrap());
        record
            .keys
            .push(KeyEntry::new(EncryptionType(999), vec![0; 0x1_0000]));
        assert!(matches!(
            encode_dump_line(&record),
            Err(StoreError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_tab_in_name_cannot_be_dumped() {
        let record = PrincipalRecord::new(Principal {
            components: vec!["bad\tname".into()],
            realm: "EXAMPLE".into(),
        });
        assert!(matches!(
            encode_dump_line(&record),
            Err(StoreError::MalformedRecord(_))
        ));
    }
}
