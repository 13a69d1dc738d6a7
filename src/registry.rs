// SPDX-License-Identifier: MIT OR Apache-2.0
//! Backend registry and connection-string dispatch.
//!
//! A registry maps scheme prefixes to backend factories. Construction does
//! no I/O; the returned backend touches its resource only on `open`. There
//! is no process-global registry: callers build one, usually through
//! [`BackendRegistry::with_builtins`], and hand it their configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::Backend;
use crate::directory::{DirectoryBackend, DirectoryConfig};
use crate::engine::EngineBackend;
use crate::error::Result;
#[cfg(not(feature = "dynamic-backends"))]
use crate::error::StoreError;
use crate::flatfile::FlatfileBackend;
use crate::StoreConfig;

/// Builds a backend from the residual of a connection string.
pub type BackendFactory =
    Arc<dyn Fn(&str, &StoreConfig) -> Result<Box<dyn Backend>> + Send + Sync>;

/// Scheme-to-factory dispatch table.
pub struct BackendRegistry {
    config: StoreConfig,
    factories: BTreeMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// Empty registry carrying `config`.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the built-in schemes: `engine:`, `flatfile:`,
    /// `directory:` and `directoryssl:`. A connection string with no scheme
    /// is a bare path and goes to the engine backend.
    #[must_use]
    pub fn with_builtins(config: StoreConfig) -> Self {
        let mut registry = Self::new(config);
        registry.register("engine", Arc::new(|residual, _| {
            Ok(Box::new(EngineBackend::new(residual)) as Box<dyn Backend>)
        }));
        registry.register("flatfile", Arc::new(|residual, _| {
            Ok(Box::new(FlatfileBackend::new(residual)) as Box<dyn Backend>)
        }));
        registry.register("directory", Arc::new(|residual, config| {
            directory_backend(residual, config, false)
        }));
        registry.register("directoryssl", Arc::new(|residual, config| {
            directory_backend(residual, config, true)
        }));
        registry
    }

    /// Add or replace a scheme's factory.
    pub fn register(&mut self, scheme: impl Into<String>, factory: BackendFactory) {
        self.factories.insert(scheme.into(), factory);
    }

    /// Registered schemes, sorted.
    #[must_use]
    pub fn schemes(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the backend for a connection string.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownScheme`] when the scheme has no factory and no
    /// loadable module; factory errors pass through.
    pub fn create(&self, connection: &str) -> Result<Box<dyn Backend>> {
        let Some((scheme, residual)) = split_scheme(connection) else {
            // Bare path: the engine backend is the native default.
            return Ok(Box::new(EngineBackend::new(connection)));
        };
        match self.factories.get(scheme) {
            Some(factory) => factory(residual, &self.config),
            None => self.create_dynamic(scheme, residual),
        }
    }

    #[cfg(feature = "dynamic-backends")]
    fn create_dynamic(&self, scheme: &str, residual: &str) -> Result<Box<dyn Backend>> {
        crate::dynamic::load_backend(scheme, residual, &self.config)
    }

    #[cfg(not(feature = "dynamic-backends"))]
    fn create_dynamic(&self, scheme: &str, _residual: &str) -> Result<Box<dyn Backend>> {
        Err(StoreError::UnknownScheme(scheme.to_string()))
    }
}

/// Split `scheme:residual`, or `None` when the string is a bare path.
fn split_scheme(connection: &str) -> Option<(&str, &str)> {
    let (scheme, residual) = connection.split_once(':')?;
    if scheme.is_empty() || scheme.contains('/') || scheme.contains('\\') {
        return None;
    }
    Some((scheme, residual))
}

fn directory_backend(
    residual: &str,
    config: &StoreConfig,
    use_tls: bool,
) -> Result<Box<dyn Backend>> {
    let directory_config = DirectoryConfig::parse(residual, use_tls)?;
    let backend = match &config.directory_client {
        Some(factory) => DirectoryBackend::new(directory_config, Arc::clone(factory)),
        None => DirectoryBackend::in_memory(directory_config),
    };
    Ok(Box::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OpenFlags;
    use crate::error::StoreError;

    #[test]
    fn test_split_scheme() {
        assert_eq!(split_scheme("engine:/d/db"), Some(("engine", "/d/db")));
        assert_eq!(split_scheme("/plain/path"), None);
        assert_eq!(split_scheme("relative/pa:th"), None);
        assert_eq!(split_scheme(":/odd"), None);
    }

    #[test]
    fn test_builtin_schemes_resolve() {
        let registry = BackendRegistry::with_builtins(StoreConfig::default());
        assert_eq!(
            registry.schemes(),
            vec!["directory", "directoryssl", "engine", "flatfile"]
        );

        // No I/O on create: these paths do not exist.
        assert_eq!(registry.create("engine:/no/such/db").unwrap().name(), "engine");
        assert_eq!(registry.create("/no/such/db").unwrap().name(), "engine");
        assert_eq!(
            registry.create("flatfile:/no/such/dump").unwrap().name(),
            "flatfile"
        );
        assert_eq!(
            registry
                .create("directory://host/ou=p,dc=e")
                .unwrap()
                .name(),
            "directory"
        );
        assert_eq!(
            registry
                .create("directoryssl://host/ou=p,dc=e")
                .unwrap()
                .name(),
            "directory"
        );
    }

    #[test]
    fn test_unknown_scheme_is_fatal() {
        let registry = BackendRegistry::with_builtins(StoreConfig::default());
        let err = registry.create("berkeley:/srv/kdb").unwrap_err();
        assert!(matches!(err, StoreError::UnknownScheme(s) if s == "berkeley"));
    }

    #[test]
    fn test_registered_factory_wins() {
        let mut registry = BackendRegistry::with_builtins(StoreConfig::default());
        registry.register(
            "mem",
            Arc::new(|_, _| {
                Ok(Box::new(crate::backend::tests::MemBackend::default()) as Box<dyn Backend>)
            }),
        );
        let mut backend = registry.create("mem:anything").unwrap();
        backend.open(OpenFlags::new().with_create(true)).unwrap();
        assert_eq!(backend.name(), "mem");
    }

    #[test]
    fn test_directory_scheme_requires_base_dn() {
        let registry = BackendRegistry::with_builtins(StoreConfig::default());
        assert!(matches!(
            registry.create("directory://hostonly"),
            Err(StoreError::Directory(_))
        ));
    }
}
