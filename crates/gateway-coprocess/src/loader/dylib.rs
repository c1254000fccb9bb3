//! Shared library unit loader
//!
//! Units are `cdylib`s built against the SDK that export the
//! `coprocess_module` entry point (see `export_module!`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use gateway_coprocess_sdk::{ModuleEntryFn, ModuleExports, MODULE_ENTRY_SYMBOL};
use libloading::{Library, Symbol};

use super::{LoadedUnit, UnitLoader};
use crate::error::LoadError;

/// Loads units from dynamic libraries (.so/.dll/.dylib)
#[derive(Debug, Clone, Default)]
pub struct DylibLoader;

impl DylibLoader {
    pub fn new() -> Self {
        Self
    }

    /// Expected library path for a module of the bundle in `bundle_dir`
    pub fn bundle_unit_path(&self, bundle_dir: &Path, module: &str) -> PathBuf {
        bundle_dir.join(format_library_name(module))
    }

    /// Load a unit from a specific path
    ///
    /// # Safety
    /// This loads and runs code from a dynamic library. The library must be
    /// built against the same SDK and toolchain as the dispatcher.
    pub unsafe fn load_from(&self, name: &str, path: &Path) -> Result<Arc<LoadedUnit>, LoadError> {
        if !path.exists() {
            return Err(LoadError::NotFound(path.to_path_buf()));
        }

        let library = Library::new(path).map_err(|source| LoadError::Library {
            path: path.to_path_buf(),
            source,
        })?;

        let exports = {
            let entry: Symbol<ModuleEntryFn> =
                library
                    .get(MODULE_ENTRY_SYMBOL)
                    .map_err(|source| LoadError::MissingEntry {
                        path: path.to_path_buf(),
                        source,
                    })?;

            let raw = entry();
            if raw.is_null() {
                return Err(LoadError::EmptyExports(name.to_string()));
            }
            *Box::<ModuleExports>::from_raw(raw)
        };

        tracing::info!(unit = %name, path = ?path, "Loaded unit");
        Ok(Arc::new(LoadedUnit::from_library(name, path, exports, library)))
    }
}

impl UnitLoader for DylibLoader {
    fn resolve(
        &self,
        bundle_dir: &Path,
        _api_id: &str,
        _revision: &str,
        module: &str,
    ) -> Result<Arc<LoadedUnit>, LoadError> {
        let path = self.bundle_unit_path(bundle_dir, module);
        unsafe { self.load_from(module, &path) }
    }

    fn load_event_unit(&self, dir: &Path, name: &str) -> Result<Arc<LoadedUnit>, LoadError> {
        let path = dir.join(format_library_name(name));
        unsafe { self.load_from(name, &path) }
    }

    fn unit_extension(&self) -> &str {
        LIBRARY_EXTENSION
    }

    fn discover(&self, dir: &Path) -> Vec<String> {
        crate::discovery::discover_units(dir, LIBRARY_EXTENSION)
            .into_iter()
            .map(|stem| unit_name_from_stem(&stem))
            .collect()
    }
}

#[cfg(target_os = "windows")]
const LIBRARY_EXTENSION: &str = "dll";

#[cfg(target_os = "macos")]
const LIBRARY_EXTENSION: &str = "dylib";

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const LIBRARY_EXTENSION: &str = "so";

/// Format the library filename for the current platform
#[cfg(target_os = "windows")]
fn format_library_name(name: &str) -> String {
    format!("{}.dll", name.replace('-', "_"))
}

#[cfg(not(target_os = "windows"))]
fn format_library_name(name: &str) -> String {
    format!("lib{}.{}", name.replace('-', "_"), LIBRARY_EXTENSION)
}

fn unit_name_from_stem(stem: &str) -> String {
    if cfg!(target_os = "windows") {
        stem.to_string()
    } else {
        stem.strip_prefix("lib").unwrap_or(stem).to_string()
    }
}
