// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dynamically loaded backend factories (feature `dynamic-backends`).
//!
//! An out-of-tree backend ships as a shared object named
//! `<dll-prefix>pstore_<scheme>.<dll-extension>` placed in one of the
//! configured module paths. It exports a single constructor symbol:
//!
//! ```text
//! #[no_mangle]
//! pub fn principal_store_backend_myscheme(
//!     residual: &str,
//! ) -> principal_store::Result<Box<dyn principal_store::Backend>>
//! ```
//!
//! The symbol uses the Rust ABI, so modules must be built with the same
//! toolchain as the host binary. A loaded library is never unloaded; the
//! backend's code has to stay mapped for the life of the process.

use std::env::consts::{DLL_EXTENSION, DLL_PREFIX};

use libloading::Library;

use crate::backend::Backend;
use crate::error::{Result, StoreError};
use crate::StoreConfig;

/// Constructor signature exported by a backend module.
pub type BackendConstructor = fn(&str) -> Result<Box<dyn Backend>>;

/// Search the configured module paths for `scheme` and construct its
/// backend.
///
/// Every failure short of a constructor error collapses to
/// `UnknownScheme`: a missing module, an unloadable library and a missing
/// symbol all mean the scheme cannot be served.
pub(crate) fn load_backend(
    scheme: &str,
    residual: &str,
    config: &StoreConfig,
) -> Result<Box<dyn Backend>> {
    // Scheme becomes part of a file name and a symbol name; keep it tame.
    if scheme.is_empty()
        || !scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(StoreError::UnknownScheme(scheme.to_string()));
    }
    let file_name = format!("{DLL_PREFIX}pstore_{scheme}.{DLL_EXTENSION}");
    let symbol_name = format!("principal_store_backend_{scheme}");

    for dir in &config.module_paths {
        let candidate = dir.join(&file_name);
        if !candidate.is_file() {
            continue;
        }
        // SAFETY: loading runs the module's initializers. Module paths are
        // operator configuration, trusted like the rest of the process
        // image.
        let library = unsafe { Library::new(&candidate) }
            .map_err(|e| StoreError::UnknownScheme(format!("{scheme}: {e}")))?;
        let backend = {
            let constructor = unsafe { library.get::<BackendConstructor>(symbol_name.as_bytes()) }
                .map_err(|e| StoreError::UnknownScheme(format!("{scheme}: {e}")))?;
            constructor(residual)?
        };
        tracing::debug!(%scheme, path = %candidate.display(), "loaded dynamic backend module");
        std::mem::forget(library);
        return Ok(backend);
    }
    Err(StoreError::UnknownScheme(scheme.to_string()))
}
