//! In-process unit loader
//!
//! Serves units registered up front, for hosts that link their extensions
//! statically and for tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use gateway_coprocess_sdk::ModuleExports;

use super::{LoadedUnit, UnitLoader};
use crate::error::LoadError;

/// Loader backed by registered `ModuleExports`
#[derive(Debug, Default)]
pub struct StaticLoader {
    /// Bundle units keyed by `<api_id>_<revision>/<module>`
    bundle_units: DashMap<String, Arc<LoadedUnit>>,

    /// Event handler units keyed by unit name
    event_units: DashMap<String, Arc<LoadedUnit>>,

    /// Number of successful bundle unit resolutions
    resolutions: AtomicUsize,
}

fn bundle_key(api_id: &str, revision: &str, module: &str) -> String {
    format!("{}_{}/{}", api_id, revision, module)
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `module` for bundle revision `revision` of `api_id`
    pub fn register_bundle_unit(&self, api_id: &str, revision: &str, module: &str, exports: ModuleExports) {
        let unit = Arc::new(LoadedUnit::in_process(module, exports));
        self.bundle_units.insert(bundle_key(api_id, revision, module), unit);
    }

    /// Register an event handler unit
    pub fn register_event_unit(&self, name: &str, exports: ModuleExports) {
        let unit = Arc::new(LoadedUnit::in_process(name, exports));
        self.event_units.insert(name.to_string(), unit);
    }

    pub fn with_bundle_unit(self, api_id: &str, revision: &str, module: &str, exports: ModuleExports) -> Self {
        self.register_bundle_unit(api_id, revision, module, exports);
        self
    }

    pub fn with_event_unit(self, name: &str, exports: ModuleExports) -> Self {
        self.register_event_unit(name, exports);
        self
    }

    /// How many bundle units have been handed out
    pub fn resolutions(&self) -> usize {
        self.resolutions.load(Ordering::SeqCst)
    }
}

impl UnitLoader for StaticLoader {
    /// Units are matched by API id and revision; the directory is not consulted
    fn resolve(
        &self,
        _bundle_dir: &Path,
        api_id: &str,
        revision: &str,
        module: &str,
    ) -> Result<Arc<LoadedUnit>, LoadError> {
        let key = bundle_key(api_id, revision, module);
        let unit = self
            .bundle_units
            .get(&key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(LoadError::NotRegistered(key))?;
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        Ok(unit)
    }

    fn load_event_unit(&self, _dir: &Path, name: &str) -> Result<Arc<LoadedUnit>, LoadError> {
        self.event_units
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| LoadError::NotRegistered(name.to_string()))
    }

    fn unit_extension(&self) -> &str {
        "unit"
    }

    /// Registered event units; the directory is not consulted
    fn discover(&self, _dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = self.event_units.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
