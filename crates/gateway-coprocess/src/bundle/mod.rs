//! Bundles and their hook handlers
//!
//! A bundle is an extracted directory named `<api_id>_<revision>`:
//!
//! ```text
//! middleware/bundles/
//! └── api1_v1/
//!     ├── manifest.json      # Declared hooks per category
//!     └── libmiddleware.so   # Unit exporting the hook functions
//! ```
//!
//! The directory name is the bundle id. Constructing a [`Bundle`] resolves
//! every declared hook through the [`UnitLoader`]; the bundle is never
//! mutated afterwards. A changed bundle arrives as a new directory and
//! therefore as a new `Bundle`.

pub mod archive;
pub mod manifest;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use gateway_coprocess_sdk::{HandlerError, HookFn, HookType, Object};

use crate::config::CollisionPolicy;
use crate::error::{panic_message, DispatchError};
use crate::loader::{LoadedUnit, UnitLoader};

pub use archive::{BundleArchive, InstalledBundle};
pub use manifest::BundleManifest;

/// A named hook resolved from a bundle unit
pub struct HookHandler {
    name: String,
    hook_type: HookType,
    /// Id of the owning bundle
    bundle_id: String,
    // Declared before `unit` so the function drops before its library.
    func: Arc<dyn HookFn>,
    unit: Arc<LoadedUnit>,
}

impl HookHandler {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hook_type(&self) -> HookType {
        self.hook_type
    }

    pub fn bundle_id(&self) -> &str {
        &self.bundle_id
    }

    /// Unit the hook was resolved from
    pub fn unit_name(&self) -> &str {
        self.unit.name()
    }

    fn invoke(&self, object: Object) -> Result<Object, HandlerError> {
        self.func.call(object)
    }
}

impl fmt::Debug for HookHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookHandler")
            .field("name", &self.name)
            .field("hook_type", &self.hook_type)
            .field("bundle_id", &self.bundle_id)
            .field("unit", &self.unit.name())
            .finish()
    }
}

/// Flattened `hook_name -> handler` table of one bundle
pub type HookMap = HashMap<String, Arc<HookHandler>>;

/// An identified, versioned collection of hook handlers for one API
pub struct Bundle {
    bundle_id: String,
    api_id: String,
    revision: String,
    path: PathBuf,
    manifest: BundleManifest,
    handlers: BTreeMap<HookType, Vec<Arc<HookHandler>>>,
    imported_modules: Vec<String>,
    loaded_at: Instant,
}

/// Derive the bundle id from the final path segment
pub fn bundle_id_from_path(path: &Path) -> Result<String, DispatchError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| DispatchError::InvalidBundlePath(path.to_path_buf()))
}

/// Split `<api_id>_<revision>` at the first underscore
pub fn split_bundle_id(bundle_id: &str) -> Option<(&str, &str)> {
    bundle_id
        .split_once('_')
        .filter(|(api_id, revision)| !api_id.is_empty() && !revision.is_empty())
}

impl Bundle {
    /// Load a bundle from its directory
    pub fn load(path: &Path, loader: &dyn UnitLoader) -> Result<Self, DispatchError> {
        let manifest = BundleManifest::load(path)?;
        Self::from_manifest(path, manifest, loader)
    }

    /// Build a bundle from an already parsed manifest.
    ///
    /// Every declared hook is resolved through `loader`. A hook whose unit
    /// fails to load, or which its unit does not export, is logged and left
    /// out; the other hooks are unaffected.
    pub fn from_manifest(path: &Path, manifest: BundleManifest, loader: &dyn UnitLoader) -> Result<Self, DispatchError> {
        let bundle_id = bundle_id_from_path(path)?;
        let (api_id, revision) = split_bundle_id(&bundle_id)
            .map(|(a, r)| (a.to_string(), r.to_string()))
            .ok_or_else(|| DispatchError::InvalidBundlePath(path.to_path_buf()))?;

        tracing::info!(bundle_id = %bundle_id, api_id = %api_id, "Loading bundle");

        let mut units: HashMap<String, Option<Arc<LoadedUnit>>> = HashMap::new();
        let mut imported_modules = Vec::new();
        let mut handlers: BTreeMap<HookType, Vec<Arc<HookHandler>>> = BTreeMap::new();

        for (hook_type, def) in manifest.custom_middleware.declared() {
            let module = def.module();
            let unit = units
                .entry(module.to_string())
                .or_insert_with(|| match loader.resolve(path, &api_id, &revision, module) {
                    Ok(unit) => {
                        imported_modules.push(module.to_string());
                        Some(unit)
                    }
                    Err(e) => {
                        tracing::error!(bundle_id = %bundle_id, module = %module, "Failed to load unit: {}", e);
                        None
                    }
                })
                .clone();

            let Some(unit) = unit else {
                continue;
            };

            let Some(func) = unit.exports().get_hook(&def.name) else {
                tracing::error!(
                    bundle_id = %bundle_id,
                    module = %module,
                    "Hook '{}' is declared but not exported",
                    def.name
                );
                continue;
            };

            tracing::debug!(bundle_id = %bundle_id, hook_type = %hook_type, "Registered hook '{}'", def.name);
            handlers.entry(hook_type).or_default().push(Arc::new(HookHandler {
                name: def.name.clone(),
                hook_type,
                bundle_id: bundle_id.clone(),
                func,
                unit,
            }));
        }

        Ok(Self {
            bundle_id,
            api_id,
            revision,
            path: path.to_path_buf(),
            manifest,
            handlers,
            imported_modules,
            loaded_at: Instant::now(),
        })
    }

    pub fn bundle_id(&self) -> &str {
        &self.bundle_id
    }

    pub fn api_id(&self) -> &str {
        &self.api_id
    }

    /// Part of the bundle id after the API id
    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    /// Resolved handlers per category, in declaration order
    pub fn handlers(&self) -> &BTreeMap<HookType, Vec<Arc<HookHandler>>> {
        &self.handlers
    }

    /// Units this bundle caused to be loaded
    pub fn imported_modules(&self) -> &[String] {
        &self.imported_modules
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    /// Flatten the per-category handlers into one `name -> handler` table.
    ///
    /// Categories are merged in pipeline order; a name seen twice is
    /// handled according to `policy`.
    pub fn build_hooks(&self, policy: CollisionPolicy) -> Result<HookMap, DispatchError> {
        let mut hooks = HookMap::new();
        for (hook_type, handlers) in &self.handlers {
            for handler in handlers {
                let Some(previous) = hooks.insert(handler.name.clone(), Arc::clone(handler)) else {
                    continue;
                };
                match policy {
                    CollisionPolicy::Reject => {
                        return Err(DispatchError::HookCollision {
                            bundle_id: self.bundle_id.clone(),
                            name: handler.name.clone(),
                            first: previous.hook_type,
                            second: *hook_type,
                        });
                    }
                    CollisionPolicy::Warn => {
                        tracing::warn!(
                            bundle_id = %self.bundle_id,
                            "Hook '{}' declared as {} overrides its {} declaration",
                            handler.name,
                            hook_type,
                            previous.hook_type
                        );
                    }
                    CollisionPolicy::LastWriteWins => {}
                }
            }
        }
        Ok(hooks)
    }

    /// Run `handler` on `object`.
    ///
    /// Errors returned by the hook and panics inside it both come back as
    /// `Err`; the caller decides what to hand to the gateway.
    pub fn process(&self, handler: &HookHandler, mut object: Object) -> Result<Object, DispatchError> {
        object.dispatched_as = Some(handler.hook_type);

        match panic::catch_unwind(AssertUnwindSafe(|| handler.invoke(object))) {
            Ok(Ok(object)) => Ok(object),
            Ok(Err(source)) => Err(DispatchError::Handler {
                hook_name: handler.name.clone(),
                source,
            }),
            Err(payload) => Err(DispatchError::Panicked {
                name: handler.name.clone(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl fmt::Debug for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundle")
            .field("bundle_id", &self.bundle_id)
            .field("api_id", &self.api_id)
            .field("path", &self.path)
            .field("handlers", &self.handlers)
            .field("imported_modules", &self.imported_modules)
            .finish()
    }
}
