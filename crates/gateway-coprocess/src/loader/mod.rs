//! Pluggable unit loading
//!
//! The dispatch core never loads code itself. It asks a [`UnitLoader`] to
//! resolve a named unit for a tenant and bundle revision, and receives a
//! [`LoadedUnit`] holding the unit's exports.
//!
//! Two loaders are provided:
//! - [`DylibLoader`] loads shared libraries with `libloading`
//! - [`StaticLoader`] serves units registered in-process

pub mod dylib;
pub mod static_loader;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use gateway_coprocess_sdk::ModuleExports;
use libloading::Library;

use crate::discovery::discover_units;
use crate::error::LoadError;

pub use dylib::DylibLoader;
pub use static_loader::StaticLoader;

/// A unit of executable logic and the library backing it (if any)
pub struct LoadedUnit {
    name: String,
    // Declared before `_library` so exported functions drop first.
    exports: ModuleExports,
    path: Option<PathBuf>,
    loaded_at: Instant,
    _library: Option<Library>,
}

impl LoadedUnit {
    /// Wrap exports that live in this process
    pub fn in_process(name: impl Into<String>, exports: ModuleExports) -> Self {
        Self {
            name: name.into(),
            exports,
            path: None,
            loaded_at: Instant::now(),
            _library: None,
        }
    }

    pub(crate) fn from_library(name: &str, path: &Path, exports: ModuleExports, library: Library) -> Self {
        Self {
            name: name.to_string(),
            exports,
            path: Some(path.to_path_buf()),
            loaded_at: Instant::now(),
            _library: Some(library),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exports(&self) -> &ModuleExports {
        &self.exports
    }

    /// Path the library was loaded from
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }
}

impl fmt::Debug for LoadedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedUnit")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("exports", &self.exports)
            .finish()
    }
}

/// Resolves named units of code for bundles and event handlers
pub trait UnitLoader: Send + Sync {
    /// Load `module` of bundle revision `revision` belonging to `api_id`.
    ///
    /// `bundle_dir` is the directory the bundle was loaded from; units on
    /// disk are looked up inside it and nowhere else.
    fn resolve(
        &self,
        bundle_dir: &Path,
        api_id: &str,
        revision: &str,
        module: &str,
    ) -> Result<Arc<LoadedUnit>, LoadError>;

    /// Load the event handler unit `name` found in `dir`
    fn load_event_unit(&self, dir: &Path, name: &str) -> Result<Arc<LoadedUnit>, LoadError>;

    /// File extension of units on disk
    fn unit_extension(&self) -> &str;

    /// Names of the units available in `dir`
    fn discover(&self, dir: &Path) -> Vec<String> {
        discover_units(dir, self.unit_extension())
    }
}
