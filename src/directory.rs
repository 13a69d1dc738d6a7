// SPDX-License-Identifier: MIT OR Apache-2.0
//! Directory-service backend.
//!
//! The directory protocol itself is a seam: [`DirectoryClient`] models the
//! handful of operations the backend needs (bind, search, add, modify,
//! delete), and [`MemoryDirectory`] is the in-process implementation used
//! by default and under test. A network client can be supplied through the
//! client factory without touching the backend.
//!
//! One principal record maps to one directory entry under the configured
//! base DN. The entry's RDN is derived from the principal's local name
//! component; lookups go through an attribute filter on the full canonical
//! name, so records in different realms are still found correctly even
//! though they compete for the same RDN. Raw byte operations make no sense
//! against a directory and are refused with `Unsupported`; the record-level
//! operations are overridden wholesale instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{Backend, OpenFlags};
use crate::error::{Result, StoreError};
use crate::lock::LockMode;
use crate::record::{
    EncryptionType, Event, Generation, KeyEntry, Principal, PrincipalFlags, PrincipalRecord,
};

/// Multi-valued attribute set of one directory entry.
pub type Attributes = BTreeMap<String, Vec<String>>;

/// Object class attached to every record entry.
const OBJECT_CLASS: &str = "principalRecord";

/// Minimal directory protocol surface.
///
/// `search` matches entries directly under `base` whose attributes contain
/// every `(name, value)` pair of the filter; an empty filter matches all.
pub trait DirectoryClient: Send {
    /// Authenticate the session. `None` binds anonymously.
    ///
    /// # Errors
    ///
    /// [`StoreError::Directory`] on failure.
    fn bind(&mut self, bind_dn: Option<&str>) -> Result<()>;

    /// Entries under `base` matching `filter`, as `(dn, attributes)` pairs.
    ///
    /// # Errors
    ///
    /// [`StoreError::Directory`] on failure.
    fn search(&mut self, base: &str, filter: &[(&str, &str)]) -> Result<Vec<(String, Attributes)>>;

    /// Create an entry.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyExists`] when the DN is taken.
    fn add(&mut self, dn: &str, attrs: Attributes) -> Result<()>;

    /// Replace an entry's attributes.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when the DN does not exist.
    fn modify(&mut self, dn: &str, attrs: Attributes) -> Result<()>;

    /// Delete an entry.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when the DN does not exist.
    fn delete(&mut self, dn: &str) -> Result<()>;

    /// End the session.
    fn unbind(&mut self) -> Result<()>;
}

/// Factory producing a client per backend instance.
pub type DirectoryClientFactory =
    Arc<dyn Fn(&DirectoryConfig) -> Result<Box<dyn DirectoryClient>> + Send + Sync>;

/// Connection settings parsed from a `directory:` connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryConfig {
    /// Server host, empty for a local/in-process directory.
    pub host: String,
    /// Base DN the record entries live under.
    pub base_dn: String,
    /// DN to bind as; `None` binds anonymously.
    pub bind_dn: Option<String>,
    /// Whether the transport is TLS-wrapped.
    pub use_tls: bool,
}

impl DirectoryConfig {
    /// Parse the residual of a `directory:`-style connection string.
    ///
    /// Accepted shapes: `//host/base-dn` and `base-dn` (hostless).
    ///
    /// # Errors
    ///
    /// [`StoreError::Directory`] when the base DN is missing.
    pub fn parse(residual: &str, use_tls: bool) -> Result<Self> {
        let (host, base_dn) = if let Some(rest) = residual.strip_prefix("//") {
            match rest.split_once('/') {
                Some((host, base)) => (host.to_string(), base.to_string()),
                None => (rest.to_string(), String::new()),
            }
        } else {
            (String::new(), residual.to_string())
        };
        if base_dn.is_empty() {
            return Err(StoreError::Directory(format!(
                "connection string has no base DN: {residual:?}"
            )));
        }
        Ok(Self {
            host,
            base_dn,
            bind_dn: None,
            use_tls,
        })
    }
}

/// In-process directory server shared by all clients cloned from it.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    entries: Arc<Mutex<BTreeMap<String, Attributes>>>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A client session against this directory.
    #[must_use]
    pub fn client(&self) -> MemoryDirectoryClient {
        MemoryDirectoryClient {
            entries: Arc::clone(&self.entries),
            bound: false,
        }
    }

    /// Number of entries, across all containers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// One session against a [`MemoryDirectory`].
pub struct MemoryDirectoryClient {
    entries: Arc<Mutex<BTreeMap<String, Attributes>>>,
    bound: bool,
}

impl MemoryDirectoryClient {
    fn ensure_bound(&self) -> Result<()> {
        if self.bound {
            Ok(())
        } else {
            Err(StoreError::Directory("session not bound".into()))
        }
    }
}

/// Whether `dn` sits directly under `base`.
fn under_base(dn: &str, base: &str) -> bool {
    let Some(rdn) = dn
        .strip_suffix(base)
        .and_then(|rdn| rdn.strip_suffix(','))
    else {
        return false;
    };
    if rdn.is_empty() {
        return false;
    }
    // Only an unescaped comma separates DN components.
    let mut escaped = false;
    for c in rdn.chars() {
        match c {
            '\\' if !escaped => escaped = true,
            ',' if !escaped => return false,
            _ => escaped = false,
        }
    }
    true
}

impl DirectoryClient for MemoryDirectoryClient {
    fn bind(&mut self, _bind_dn: Option<&str>) -> Result<()> {
        self.bound = true;
        Ok(())
    }

    fn search(&mut self, base: &str, filter: &[(&str, &str)]) -> Result<Vec<(String, Attributes)>> {
        self.ensure_bound()?;
        let entries = self.entries.lock();
        let matches = entries
            .iter()
            .filter(|(dn, _)| under_base(dn, base))
            .filter(|(_, attrs)| {
                filter.iter().all(|(name, value)| {
                    attrs
                        .get(*name)
                        .is_some_and(|values| values.iter().any(|v| v == value))
                })
            })
            .map(|(dn, attrs)| (dn.clone(), attrs.clone()))
            .collect();
        Ok(matches)
    }

    fn add(&mut self, dn: &str, attrs: Attributes) -> Result<()> {
        self.ensure_bound()?;
        let mut entries = self.entries.lock();
        if entries.contains_key(dn) {
            return Err(StoreError::AlreadyExists(dn.to_string()));
        }
        entries.insert(dn.to_string(), attrs);
        Ok(())
    }

    fn modify(&mut self, dn: &str, attrs: Attributes) -> Result<()> {
        self.ensure_bound()?;
        let mut entries = self.entries.lock();
        match entries.get_mut(dn) {
            Some(slot) => {
                *slot = attrs;
                Ok(())
            }
            None => Err(StoreError::NotFound(dn.to_string())),
        }
    }

    fn delete(&mut self, dn: &str) -> Result<()> {
        self.ensure_bound()?;
        let mut entries = self.entries.lock();
        entries
            .remove(dn)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(dn.to_string()))
    }

    fn unbind(&mut self) -> Result<()> {
        self.bound = false;
        Ok(())
    }
}

/// Escape a value for use inside a DN component.
fn escape_dn_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn attr_first<'a>(attrs: &'a Attributes, name: &str) -> Option<&'a str> {
    attrs.get(name).and_then(|v| v.first()).map(String::as_str)
}

fn attr_number<T: std::str::FromStr>(attrs: &Attributes, name: &str) -> Result<Option<T>> {
    attr_first(attrs, name)
        .map(|raw| {
            raw.parse().map_err(|_| {
                StoreError::MalformedRecord(format!("directory attribute {name} is not numeric"))
            })
        })
        .transpose()
}

/// Serialize a record into the fixed attribute schema.
fn record_to_attributes(record: &PrincipalRecord) -> Result<Attributes> {
    let mut attrs = Attributes::new();
    let mut put = |name: &str, value: String| {
        attrs.insert(name.to_string(), vec![value]);
    };

    put("objectClass", OBJECT_CLASS.to_string());
    put("principalName", record.principal.canonical());
    put("realm", record.principal.realm.clone());
    put("kvno", record.kvno.to_string());
    put("flags", record.flags.to_bits().to_string());
    put("createdTime", record.created_by.time.to_string());
    if let Some(who) = &record.created_by.principal {
        put("createdBy", who.canonical());
    }
    if let Some(event) = &record.modified_by {
        put("modifiedTime", event.time.to_string());
        if let Some(who) = &event.principal {
            put("modifiedBy", who.canonical());
        }
    }
    if let Some(t) = record.not_before {
        put("notBefore", t.to_string());
    }
    if let Some(t) = record.not_after {
        put("notAfter", t.to_string());
    }
    if let Some(t) = record.password_expiry {
        put("passwordExpiry", t.to_string());
    }
    if let Some(v) = record.max_life {
        put("maxLife", v.to_string());
    }
    if let Some(v) = record.max_renewable_life {
        put("maxRenewableLife", v.to_string());
    }
    if let Some(generation) = &record.generation {
        put("generationTime", generation.time.to_string());
        put("generationSeq", generation.seq.to_string());
    }

    let mut key_blocks = Vec::with_capacity(record.keys.len());
    for key in &record.keys {
        key_blocks.push(hex::encode(bincode::serialize(key)?));
    }
    if !key_blocks.is_empty() {
        attrs.insert("keyBlock".to_string(), key_blocks);
    }
    if let Some(etypes) = &record.etypes {
        attrs.insert(
            "supportedEnctype".to_string(),
            etypes.iter().map(|e| e.0.to_string()).collect(),
        );
    }
    Ok(attrs)
}

/// Decode the fixed attribute schema back into a record.
///
/// Entries without our object class or a principal name are classified as
/// foreign so that iteration skips them.
fn attributes_to_record(attrs: &Attributes) -> Result<PrincipalRecord> {
    let is_ours = attrs
        .get("objectClass")
        .is_some_and(|classes| classes.iter().any(|c| c == OBJECT_CLASS));
    let Some(name) = attr_first(attrs, "principalName") else {
        return Err(StoreError::ForeignEntry);
    };
    if !is_ours {
        return Err(StoreError::ForeignEntry);
    }
    let principal = Principal::parse(name)?;

    let mut keys = Vec::new();
    if let Some(blocks) = attrs.get("keyBlock") {
        for block in blocks {
            let raw = hex::decode(block).map_err(|_| {
                StoreError::MalformedRecord("key block attribute is not hex".into())
            })?;
            let key: KeyEntry = bincode::deserialize(&raw)?;
            keys.push(key);
        }
    }

    let etypes = attrs
        .get("supportedEnctype")
        .map(|values| {
            values
                .iter()
                .map(|v| {
                    v.parse::<i32>().map(EncryptionType).map_err(|_| {
                        StoreError::MalformedRecord(
                            "supportedEnctype attribute is not numeric".into(),
                        )
                    })
                })
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?;

    let generation = match (
        attr_number::<i64>(attrs, "generationTime")?,
        attr_number::<u64>(attrs, "generationSeq")?,
    ) {
        (Some(time), Some(seq)) => Some(Generation { time, seq }),
        _ => None,
    };

    let modified_by = attr_number::<i64>(attrs, "modifiedTime")?.map(|time| {
        Ok::<_, StoreError>(Event {
            time,
            principal: attr_first(attrs, "modifiedBy")
                .map(Principal::parse)
                .transpose()?,
        })
    });
    let modified_by = modified_by.transpose()?;

    Ok(PrincipalRecord {
        principal,
        kvno: attr_number(attrs, "kvno")?.unwrap_or(0),
        keys,
        not_before: attr_number(attrs, "notBefore")?,
        not_after: attr_number(attrs, "notAfter")?,
        password_expiry: attr_number(attrs, "passwordExpiry")?,
        max_life: attr_number(attrs, "maxLife")?,
        max_renewable_life: attr_number(attrs, "maxRenewableLife")?,
        flags: attr_number(attrs, "flags")?
            .map_or_else(PrincipalFlags::default, PrincipalFlags::from_bits),
        created_by: Event {
            time: attr_number(attrs, "createdTime")?.unwrap_or_default(),
            principal: attr_first(attrs, "createdBy")
                .map(Principal::parse)
                .transpose()?,
        },
        modified_by,
        generation,
        etypes,
    })
}

/// Backend storing one directory entry per principal.
pub struct DirectoryBackend {
    config: DirectoryConfig,
    factory: DirectoryClientFactory,
    client: Option<Box<dyn DirectoryClient>>,
    read_only: bool,
    /// Records materialized for the current iteration, newest search wins.
    iter: Option<(Vec<PrincipalRecord>, usize)>,
}

impl DirectoryBackend {
    /// Backend talking to whatever the factory produces.
    #[must_use]
    pub fn new(config: DirectoryConfig, factory: DirectoryClientFactory) -> Self {
        Self {
            config,
            factory,
            client: None,
            read_only: false,
            iter: None,
        }
    }

    /// Backend bound to a private in-memory directory.
    #[must_use]
    pub fn in_memory(config: DirectoryConfig) -> Self {
        let directory = MemoryDirectory::new();
        Self::new(
            config,
            Arc::new(move |_| Ok(Box::new(directory.client()) as Box<dyn DirectoryClient>)),
        )
    }

    fn client(&mut self) -> Result<&mut Box<dyn DirectoryClient>> {
        self.client.as_mut().ok_or_else(|| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "directory not open",
            ))
        })
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(StoreError::unsupported(
                "directory",
                "write to read-only directory",
            ));
        }
        Ok(())
    }

    fn entry_dn(&self, principal: &Principal) -> String {
        let local = principal.local_name().unwrap_or("unknown");
        format!("cn={},{}", escape_dn_value(local), self.config.base_dn)
    }

    /// DN of the existing entry for `principal`, if any.
    fn find_dn(&mut self, principal: &Principal) -> Result<Option<String>> {
        let canonical = principal.canonical();
        let base = self.config.base_dn.clone();
        let found = self
            .client()?
            .search(&base, &[("principalName", &canonical)])?;
        Ok(found.into_iter().next().map(|(dn, _)| dn))
    }
}

impl Backend for DirectoryBackend {
    fn name(&self) -> &'static str {
        "directory"
    }

    fn open(&mut self, flags: OpenFlags) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        let mut client = (self.factory)(&self.config)?;
        client.bind(self.config.bind_dn.as_deref())?;
        tracing::debug!(
            host = %self.config.host,
            base_dn = %self.config.base_dn,
            tls = self.config.use_tls,
            "directory session bound"
        );
        self.client = Some(client);
        self.read_only = flags.read_only;
        self.iter = None;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(client) = self.client.as_mut() {
            client.unbind()?;
        }
        self.client = None;
        self.iter = None;
        Ok(())
    }

    fn raw_get(&mut self, _key: &[u8]) -> Result<Option<Vec<u8>>> {
        Err(StoreError::unsupported("directory", "raw_get"))
    }

    fn raw_put(&mut self, _key: &[u8], _value: &[u8], _replace: bool) -> Result<()> {
        Err(StoreError::unsupported("directory", "raw_put"))
    }

    fn raw_delete(&mut self, _key: &[u8]) -> Result<()> {
        Err(StoreError::unsupported("directory", "raw_delete"))
    }

    fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        Err(StoreError::unsupported("directory", "first"))
    }

    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        Err(StoreError::unsupported("directory", "next"))
    }

    // The directory server serializes concurrent access itself; there is
    // no lockable local resource.
    fn lock(&mut self, _mode: LockMode) -> Result<()> {
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        Ok(())
    }

    fn rename(&mut self, _new_path: &std::path::Path) -> Result<()> {
        Err(StoreError::unsupported("directory", "rename"))
    }

    fn destroy(&mut self) -> Result<()> {
        self.ensure_writable()?;
        let base = self.config.base_dn.clone();
        let ours: Vec<String> = self
            .client()?
            .search(&base, &[("objectClass", OBJECT_CLASS)])?
            .into_iter()
            .map(|(dn, _)| dn)
            .collect();
        for dn in ours {
            self.client()?.delete(&dn)?;
        }
        Ok(())
    }

    fn fetch_record(&mut self, principal: &Principal) -> Result<PrincipalRecord> {
        let canonical = principal.canonical();
        let base = self.config.base_dn.clone();
        let found = self
            .client()?
            .search(&base, &[("principalName", &canonical)])?;
        let Some((_, attrs)) = found.into_iter().next() else {
            return Err(StoreError::NotFound(canonical));
        };
        attributes_to_record(&attrs)
    }

    fn store_record(&mut self, record: &PrincipalRecord, replace: bool) -> Result<()> {
        self.ensure_writable()?;
        let attrs = record_to_attributes(record)?;
        match self.find_dn(&record.principal)? {
            Some(dn) => {
                if !replace {
                    return Err(StoreError::AlreadyExists(record.principal.canonical()));
                }
                self.client()?.modify(&dn, attrs)
            }
            None => {
                let dn = self.entry_dn(&record.principal);
                match self.client()?.add(&dn, attrs) {
                    Err(StoreError::AlreadyExists(_)) => Err(StoreError::Directory(format!(
                        "entry collision at {dn} for {}",
                        record.principal.canonical()
                    ))),
                    other => other,
                }
            }
        }
    }

    fn remove_record(&mut self, principal: &Principal) -> Result<()> {
        self.ensure_writable()?;
        match self.find_dn(principal)? {
            Some(dn) => self.client()?.delete(&dn),
            None => Err(StoreError::NotFound(principal.canonical())),
        }
    }

    fn first_record(&mut self) -> Result<Option<PrincipalRecord>> {
        let base = self.config.base_dn.clone();
        let found = self.client()?.search(&base, &[])?;
        let mut records = Vec::with_capacity(found.len());
        for (dn, attrs) in found {
            match attributes_to_record(&attrs) {
                Ok(record) => records.push(record),
                Err(e) if e.is_foreign_entry() => {
                    tracing::debug!(%dn, "skipping foreign directory entry");
                }
                Err(e) => return Err(e),
            }
        }
        records.sort_by_key(|r| r.principal.canonical());
        self.iter = Some((records, 0));
        self.next_record()
    }

    fn next_record(&mut self) -> Result<Option<PrincipalRecord>> {
        let Some((records, index)) = self.iter.as_mut() else {
            return Ok(None);
        };
        if *index >= records.len() {
            return Ok(None);
        }
        let record = records[*index].clone();
        *index += 1;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DirectoryConfig {
        DirectoryConfig {
            host: "localhost".into(),
            base_dn: "ou=principals,dc=example,dc=net".into(),
            bind_dn: None,
            use_tls: false,
        }
    }

    fn record(name: &str) -> PrincipalRecord {
        let mut r = PrincipalRecord::new(Principal::parse(name).unwrap());
        r.kvno = 4;
        let mut key = KeyEntry::new(EncryptionType::AES256_CTS_HMAC_SHA1, vec![0xCD; 60]);
        key.master_key_version = Some(2);
        r.keys.push(key);
        r.max_life = Some(36_000);
        r.generation = Some(Generation { time: 100, seq: 7 });
        r
    }

    fn open_backend(directory: &MemoryDirectory) -> DirectoryBackend {
        let d = directory.clone();
        let mut backend = DirectoryBackend::new(
            config(),
            Arc::new(move |_| Ok(Box::new(d.client()) as Box<dyn DirectoryClient>)),
        );
        backend.open(OpenFlags::new()).unwrap();
        backend
    }

    #[test]
    fn test_config_parse_shapes() {
        let c = DirectoryConfig::parse("//kdc.example.net/ou=p,dc=e", true).unwrap();
        assert_eq!(c.host, "kdc.example.net");
        assert_eq!(c.base_dn, "ou=p,dc=e");
        assert!(c.use_tls);

        let c = DirectoryConfig::parse("ou=p,dc=e", false).unwrap();
        assert_eq!(c.host, "");
        assert_eq!(c.base_dn, "ou=p,dc=e");

        assert!(DirectoryConfig::parse("//hostonly", false).is_err());
    }

    #[test]
    fn test_attribute_schema_roundtrip() {
        let mut rec = record("alice@EXAMPLE");
        rec.modified_by = Some(Event {
            time: 1_700_000_000,
            principal: Some(Principal::parse("admin@EXAMPLE").unwrap()),
        });
        rec.etypes = Some(vec![
            EncryptionType::AES256_CTS_HMAC_SHA1,
            EncryptionType::AES128_CTS_HMAC_SHA1,
        ]);
        let attrs = record_to_attributes(&rec).unwrap();
        assert_eq!(attr_first(&attrs, "principalName"), Some("alice@EXAMPLE"));
        assert_eq!(attr_first(&attrs, "kvno"), Some("4"));

        let decoded = attributes_to_record(&attrs).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn test_store_fetch_remove() {
        let directory = MemoryDirectory::new();
        let mut backend = open_backend(&directory);
        let rec = record("alice@EXAMPLE");

        backend.store_record(&rec, false).unwrap();
        assert_eq!(directory.len(), 1);
        assert_eq!(backend.fetch_record(&rec.principal).unwrap(), rec);

        let err = backend.store_record(&rec, false).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        backend.remove_record(&rec.principal).unwrap();
        assert!(matches!(
            backend.fetch_record(&rec.principal),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_update_goes_through_modify() {
        let directory = MemoryDirectory::new();
        let mut backend = open_backend(&directory);
        let mut rec = record("alice@EXAMPLE");

        backend.store_record(&rec, false).unwrap();
        rec.kvno = 9;
        backend.store_record(&rec, true).unwrap();
        assert_eq!(directory.len(), 1);
        assert_eq!(backend.fetch_record(&rec.principal).unwrap().kvno, 9);
    }

    #[test]
    fn test_raw_operations_are_unsupported() {
        let directory = MemoryDirectory::new();
        let mut backend = open_backend(&directory);
        assert!(matches!(
            backend.raw_get(b"alice@EXAMPLE"),
            Err(StoreError::Unsupported { backend: "directory", .. })
        ));
        assert!(matches!(
            backend.raw_put(b"k", b"v", true),
            Err(StoreError::Unsupported { .. })
        ));
        assert!(matches!(
            backend.first(),
            Err(StoreError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_iteration_skips_foreign_entries() {
        let directory = MemoryDirectory::new();
        let mut admin = directory.client();
        admin.bind(None).unwrap();
        let mut foreign = Attributes::new();
        foreign.insert("objectClass".into(), vec!["groupOfNames".into()]);
        admin
            .add("cn=operators,ou=principals,dc=example,dc=net", foreign)
            .unwrap();

        let mut backend = open_backend(&directory);
        backend.store_record(&record("alice@EXAMPLE"), false).unwrap();
        backend.store_record(&record("bob@EXAMPLE"), false).unwrap();

        let mut seen = Vec::new();
        let mut item = backend.first_record().unwrap();
        while let Some(rec) = item {
            seen.push(rec.principal.canonical());
            item = backend.next_record().unwrap();
        }
        assert_eq!(seen, vec!["alice@EXAMPLE", "bob@EXAMPLE"]);
    }

    #[test]
    fn test_same_local_name_across_realms() {
        // Both realms want cn=alice; the second store must fail loudly
        // rather than overwrite the first realm's entry.
        let directory = MemoryDirectory::new();
        let mut backend = open_backend(&directory);
        backend.store_record(&record("alice@EXAMPLE"), false).unwrap();
        let err = backend
            .store_record(&record("alice@OTHER.REALM"), false)
            .unwrap_err();
        assert!(matches!(err, StoreError::Directory(_)));
        assert_eq!(
            backend
                .fetch_record(&Principal::parse("alice@EXAMPLE").unwrap())
                .unwrap()
                .kvno,
            4
        );
    }

    #[test]
    fn test_local_name_with_comma_is_escaped_and_found() {
        let directory = MemoryDirectory::new();
        let mut backend = open_backend(&directory);
        let rec = record("a,b@EXAMPLE");
        backend.store_record(&rec, false).unwrap();
        assert_eq!(backend.fetch_record(&rec.principal).unwrap(), rec);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let directory = MemoryDirectory::new();
        let d = directory.clone();
        let mut backend = DirectoryBackend::new(
            config(),
            Arc::new(move |_| Ok(Box::new(d.client()) as Box<dyn DirectoryClient>)),
        );
        backend
            .open(OpenFlags::new().with_read_only(true))
            .unwrap();
        assert!(matches!(
            backend.store_record(&record("alice@EXAMPLE"), true),
            Err(StoreError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_destroy_only_touches_our_entries() {
        let directory = MemoryDirectory::new();
        let mut admin = directory.client();
        admin.bind(None).unwrap();
        let mut foreign = Attributes::new();
        foreign.insert("objectClass".into(), vec!["groupOfNames".into()]);
        admin
            .add("cn=operators,ou=principals,dc=example,dc=net", foreign)
            .unwrap();

        let mut backend = open_backend(&directory);
        backend.store_record(&record("alice@EXAMPLE"), false).unwrap();
        backend.destroy().unwrap();
        assert_eq!(directory.len(), 1);
    }
}
