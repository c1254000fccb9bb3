//! The coprocess dispatcher
//!
//! Routes serialized hook objects and events from the gateway to the
//! extension logic that handles them, and keeps the hook table in step with
//! bundle loads.
//!
//! Every dispatch entry point is infallible from the caller's point of
//! view: routing misses, malformed envelopes and handler failures are
//! logged, and a hook dispatch then returns the input bytes untouched.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};

use gateway_coprocess_sdk::{Event, Object};

use crate::bundle::{bundle_id_from_path, Bundle, BundleArchive, HookHandler};
use crate::config::DispatcherConfig;
use crate::error::DispatchError;
use crate::events::EventHandlerRegistry;
use crate::hook_table::{HookSet, HookTable};
use crate::loader::UnitLoader;

/// Outcome of installing a bundle into the hook table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// A freshly flattened hook set replaced the entry
    Installed,
    /// The bundle was already in use for its API
    Unchanged,
}

/// Owns the bundle list, the hook table and the event handler registry
pub struct Dispatcher {
    config: DispatcherConfig,
    loader: Arc<dyn UnitLoader>,
    /// Every bundle loaded so far; also serializes hook table writes
    bundles: Mutex<Vec<Arc<Bundle>>>,
    hook_table: HookTable,
    event_handlers: RwLock<EventHandlerRegistry>,
}

impl Dispatcher {
    /// Create a dispatcher.
    ///
    /// Event handlers are discovered and loaded now; bundles are loaded on
    /// demand through [`Dispatcher::load_bundle`].
    pub fn new(config: DispatcherConfig, loader: Arc<dyn UnitLoader>) -> Self {
        tracing::info!("Initializing dispatcher");

        let event_handlers = EventHandlerRegistry::load(&config.event_handler_path, loader.as_ref());
        tracing::debug!(path = %config.middleware_path.display(), "Loading middlewares.");

        Self {
            config,
            loader,
            bundles: Mutex::new(Vec::new()),
            hook_table: HookTable::new(),
            event_handlers: RwLock::new(event_handlers),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Load (or refresh) the bundle at `path`.
    ///
    /// The bundle id is the final path segment. A bundle id seen before is
    /// re-published from the existing `Bundle` without rebuilding it; a new
    /// id constructs a `Bundle` and installs it for its API.
    pub fn load_bundle(&self, path: impl AsRef<Path>) -> Result<Arc<Bundle>, DispatchError> {
        let path = path.as_ref();
        let result = self.load_bundle_inner(path);
        if let Err(e) = &result {
            tracing::error!(path = %path.display(), error_kind = e.kind(), "Failed to load bundle: {}", e);
        }
        result
    }

    fn load_bundle_inner(&self, path: &Path) -> Result<Arc<Bundle>, DispatchError> {
        let bundle_id = bundle_id_from_path(path)?;
        let mut bundles = self.bundles.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = bundles.iter().find(|b| b.bundle_id() == bundle_id) {
            let existing = Arc::clone(existing);
            tracing::debug!(bundle_id = %bundle_id, "Bundle already known, refreshing hook table");
            self.update_hook_table(&existing)?;
            return Ok(existing);
        }

        let bundle = Arc::new(Bundle::load(path, self.loader.as_ref())?);
        self.update_hook_table(&bundle)?;
        bundles.push(Arc::clone(&bundle));

        tracing::info!(
            bundle_id = %bundle.bundle_id(),
            api_id = %bundle.api_id(),
            modules = ?bundle.imported_modules(),
            "Bundle loaded"
        );
        Ok(bundle)
    }

    /// Install a zipped bundle for `api_id` under the configured bundle
    /// path, then load it like [`Dispatcher::load_bundle`].
    pub fn install_archive(&self, api_id: &str, zip_bytes: &[u8]) -> Result<Arc<Bundle>, DispatchError> {
        let installed = BundleArchive::install(zip_bytes, &self.config.bundle_path, api_id).map_err(|e| {
            tracing::error!(api_id = %api_id, error_kind = e.kind(), "Failed to install bundle archive: {}", e);
            e
        })?;
        self.load_bundle(&installed.path)
    }

    /// Make `bundle` authoritative for its API. Callers hold the bundle lock.
    ///
    /// A bundle that resolved no hooks never replaces a non-empty entry, so
    /// a broken revision cannot take down a working one.
    fn update_hook_table(&self, bundle: &Arc<Bundle>) -> Result<InstallOutcome, DispatchError> {
        let current = self.hook_table.get(bundle.api_id());
        if let Some(current) = &current {
            if !current.is_empty() && current.bundle().bundle_id() == bundle.bundle_id() {
                tracing::debug!(bundle_id = %bundle.bundle_id(), "Bundle already in use, hook table unchanged");
                return Ok(InstallOutcome::Unchanged);
            }
        }

        let hooks = bundle.build_hooks(self.config.collision_policy)?;
        if hooks.is_empty() && current.is_some_and(|c| !c.is_empty()) {
            return Err(DispatchError::NoUsableHooks {
                bundle_id: bundle.bundle_id().to_string(),
                api_id: bundle.api_id().to_string(),
            });
        }
        let set = Arc::new(HookSet::new(Arc::clone(bundle), hooks));
        self.hook_table.install(bundle.api_id(), set);
        tracing::debug!(bundle_id = %bundle.bundle_id(), api_id = %bundle.api_id(), "Hook table updated");
        Ok(InstallOutcome::Installed)
    }

    /// Find the handler for `hook_name` on `api_id`
    pub fn find_hook(&self, api_id: &str, hook_name: &str) -> Option<(Arc<HookSet>, Arc<HookHandler>)> {
        let set = self.hook_table.get(api_id)?;
        let handler = Arc::clone(set.get(hook_name)?);
        Some((set, handler))
    }

    /// Dispatch a serialized hook object and return the serialized result.
    ///
    /// On any failure the input is returned unchanged.
    pub fn dispatch_hook(&self, message: &[u8]) -> Vec<u8> {
        match self.route_hook(message) {
            Ok(result) => result,
            Err(DispatchError::HookNotDefined { api_id, hook_name }) => {
                tracing::error!(api_id = %api_id, "Can't dispatch '{}', hook is not defined.", hook_name);
                message.to_vec()
            }
            Err(e) => {
                tracing::error!(error_kind = e.kind(), "Can't dispatch, error: {}", e);
                message.to_vec()
            }
        }
    }

    fn route_hook(&self, message: &[u8]) -> Result<Vec<u8>, DispatchError> {
        let object = Object::from_slice(message).map_err(DispatchError::Decode)?;
        let api_id = object.api_id().ok_or(DispatchError::MissingField("spec.APIID"))?;

        let Some((set, handler)) = self.find_hook(api_id, object.hook_name()) else {
            return Err(DispatchError::HookNotDefined {
                api_id: api_id.to_string(),
                hook_name: object.hook_name().to_string(),
            });
        };

        tracing::debug!(api_id = %api_id, bundle_id = %handler.bundle_id(), "Dispatching hook '{}'", handler.name());
        let object = set.bundle().process(&handler, object)?;
        object.to_vec().map_err(DispatchError::Encode)
    }

    /// Dispatch a serialized event. Events produce no result.
    pub fn dispatch_event(&self, message: &[u8]) {
        if let Err(e) = self.route_event(message) {
            tracing::error!(error_kind = e.kind(), "Can't dispatch, error: {}", e);
        }
    }

    fn route_event(&self, message: &[u8]) -> Result<(), DispatchError> {
        let event = Event::from_slice(message).map_err(DispatchError::Decode)?;
        let registry = self.event_handlers();
        match registry.find(&event.handler_name) {
            Some(handler) => handler.process(&event),
            None => {
                tracing::debug!("No event handler named '{}'", event.handler_name);
                Ok(())
            }
        }
    }

    /// Reload request from the host.
    ///
    /// Purging and reloading handlers is not performed: units may still be
    /// running in-flight dispatches. The current tables are kept.
    pub fn reload(&self) {
        tracing::info!("Reloading event handlers and middlewares.");
        tracing::warn!("Reload is not supported yet, keeping the current event handlers and bundles");
    }

    /// Drop every bundle, hook set and event handler.
    ///
    /// Units are released once in-flight dispatches let go of them.
    pub fn shutdown(&self) {
        let mut bundles = self.bundles.lock().unwrap_or_else(PoisonError::into_inner);
        self.hook_table.clear();
        let count = bundles.len();
        bundles.clear();
        drop(bundles);
        self.event_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::info!(bundles = count, "Dispatcher shut down");
    }

    /// Current hook set for `api_id`
    pub fn hook_set(&self, api_id: &str) -> Option<Arc<HookSet>> {
        self.hook_table.get(api_id)
    }

    /// Snapshot of the loaded bundles
    pub fn bundles(&self) -> Vec<Arc<Bundle>> {
        self.bundles.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// APIs with an installed hook set
    pub fn api_ids(&self) -> Vec<String> {
        self.hook_table.api_ids()
    }

    /// Read access to the event handler registry
    pub fn event_handlers(&self) -> RwLockReadGuard<'_, EventHandlerRegistry> {
        self.event_handlers.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollisionPolicy;
    use crate::error::LoadError;
    use crate::loader::{LoadedUnit, StaticLoader};
    use gateway_coprocess_sdk::{HandlerError, HookType, ModuleExports};
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        loader: Arc<StaticLoader>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                loader: Arc::new(StaticLoader::new()),
            }
        }

        fn write_bundle(&self, bundle_id: &str, manifest: Value) -> PathBuf {
            let path = self.dir.path().join("bundles").join(bundle_id);
            std::fs::create_dir_all(&path).unwrap();
            std::fs::write(path.join("manifest.json"), manifest.to_string()).unwrap();
            path
        }

        fn dispatcher(&self, policy: CollisionPolicy) -> Dispatcher {
            let root = self.dir.path();
            let config = DispatcherConfig::new(root.join("middleware"), root.join("events"), root.join("bundles"))
                .with_collision_policy(policy);
            Dispatcher::new(config, self.loader.clone())
        }
    }

    fn tag(key: &'static str, value: &'static str) -> impl Fn(Object) -> Result<Object, HandlerError> + Send + Sync {
        move |mut object: Object| {
            object.extra.insert(key.to_string(), json!(value));
            Ok(object)
        }
    }

    fn message(api_id: &str, hook_name: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "hook_name": hook_name,
            "spec": {"APIID": api_id},
            "payload": "x"
        }))
        .unwrap()
    }

    fn pre_manifest(names: &[&str]) -> Value {
        let defs: Vec<Value> = names.iter().map(|n| json!({"name": n})).collect();
        json!({"custom_middleware": {"pre": defs}})
    }

    #[test]
    fn test_dispatch_runs_registered_hook() {
        let fx = Fixture::new();
        fx.loader.register_bundle_unit(
            "api1",
            "v1",
            "middleware",
            ModuleExports::new().hook("pre", |mut object: Object| -> Result<Object, HandlerError> {
                object.extra.insert("handled".into(), json!(true));
                object.request_mut().set_header("X-Handled", "true");
                Ok(object)
            }),
        );
        let path = fx.write_bundle("api1_v1", pre_manifest(&["pre"]));
        let dispatcher = fx.dispatcher(CollisionPolicy::Reject);
        dispatcher.load_bundle(&path).unwrap();

        let out: Value = serde_json::from_slice(&dispatcher.dispatch_hook(&message("api1", "pre"))).unwrap();
        assert_eq!(out["handled"], true);
        assert_eq!(out["payload"], "x");
        assert_eq!(out["request"]["set_headers"]["X-Handled"], "true");
        assert!(out.get("hook_type").is_none());
    }

    #[test]
    fn test_identity_hook_returns_equal_envelope() {
        let fx = Fixture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        fx.loader.register_bundle_unit(
            "api1",
            "v1",
            "middleware",
            ModuleExports::new().hook("noop", move |object: Object| -> Result<Object, HandlerError> {
                if object.dispatched_as == Some(HookType::Pre) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Ok(object)
            }),
        );
        let path = fx.write_bundle("api1_v1", pre_manifest(&["noop"]));
        let dispatcher = fx.dispatcher(CollisionPolicy::Reject);
        dispatcher.load_bundle(&path).unwrap();

        for hook_type in [Some(json!(1)), Some(json!("Pre")), None] {
            let mut input = json!({
                "hook_name": "noop",
                "spec": {"APIID": "api1", "OrgID": "o1"},
                "metadata": {},
                "request": {
                    "headers": {"Accept": "*/*"},
                    "body": "",
                    "return_overrides": {"response_code": 0},
                    "x_trace": [1, 2]
                },
                "session": {"rate": 10, "per": 60, "quota_max": -1, "expires": 0}
            });
            if let Some(hook_type) = hook_type {
                input["hook_type"] = hook_type;
            }

            let out: Value = serde_json::from_slice(&dispatcher.dispatch_hook(&serde_json::to_vec(&input).unwrap())).unwrap();
            assert_eq!(out, input);
        }
        // The hook ran each time rather than the input being echoed back
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_routing_miss_returns_input_unchanged() {
        let fx = Fixture::new();
        fx.loader
            .register_bundle_unit("api1", "v1", "middleware", ModuleExports::new().hook("pre", tag("h", "1")));
        let path = fx.write_bundle("api1_v1", pre_manifest(&["pre"]));
        let dispatcher = fx.dispatcher(CollisionPolicy::Reject);
        dispatcher.load_bundle(&path).unwrap();

        // Unknown API
        let input = br#"{ "hook_name": "pre", "spec": {"APIID": "api2"} }"#;
        assert_eq!(dispatcher.dispatch_hook(input), input.to_vec());

        // Known API, unknown hook
        let input = message("api1", "post");
        assert_eq!(dispatcher.dispatch_hook(&input), input);
    }

    #[test]
    fn test_malformed_envelope_returns_input() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(CollisionPolicy::Reject);

        for input in [&b"not json"[..], br#"{"hook_name": "pre"}"#, b""] {
            assert_eq!(dispatcher.dispatch_hook(input), input.to_vec());
        }
    }

    #[test]
    fn test_handler_failures_return_input() {
        let fx = Fixture::new();
        fx.loader.register_bundle_unit(
            "api1",
            "v1",
            "middleware",
            ModuleExports::new()
                .hook("fails", |_o: Object| -> Result<Object, HandlerError> {
                    Err(HandlerError::internal("upstream lookup failed"))
                })
                .hook("panics", |_o: Object| -> Result<Object, HandlerError> { panic!("hook bug") }),
        );
        let path = fx.write_bundle("api1_v1", pre_manifest(&["fails", "panics"]));
        let dispatcher = fx.dispatcher(CollisionPolicy::Reject);
        dispatcher.load_bundle(&path).unwrap();

        for hook in ["fails", "panics"] {
            let input = message("api1", hook);
            assert_eq!(dispatcher.dispatch_hook(&input), input);
        }
    }

    #[test]
    fn test_reloading_same_path_keeps_hook_set() {
        let fx = Fixture::new();
        fx.loader
            .register_bundle_unit("api1", "v1", "middleware", ModuleExports::new().hook("pre", tag("v", "1")));
        let path = fx.write_bundle("api1_v1", pre_manifest(&["pre"]));
        let dispatcher = fx.dispatcher(CollisionPolicy::Reject);

        let first = dispatcher.load_bundle(&path).unwrap();
        let set_before = dispatcher.hook_set("api1").unwrap();
        let handler_before = Arc::clone(set_before.get("pre").unwrap());

        let second = dispatcher.load_bundle(&path).unwrap();
        let set_after = dispatcher.hook_set("api1").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&set_before, &set_after));
        assert!(Arc::ptr_eq(&handler_before, set_after.get("pre").unwrap()));
        assert_eq!(dispatcher.bundles().len(), 1);
        assert_eq!(fx.loader.resolutions(), 1);
        assert_eq!(dispatcher.update_hook_table(&first).unwrap(), InstallOutcome::Unchanged);
    }

    #[test]
    fn test_last_installed_bundle_handles_hook() {
        let fx = Fixture::new();
        fx.loader
            .register_bundle_unit("api1", "v1", "middleware", ModuleExports::new().hook("pre", tag("v", "1")));
        fx.loader
            .register_bundle_unit("api1", "v2", "middleware", ModuleExports::new().hook("pre", tag("v", "2")));
        fx.loader
            .register_bundle_unit("api3", "v1", "middleware", ModuleExports::new().hook("pre", tag("v", "other")));
        let v1 = fx.write_bundle("api1_v1", pre_manifest(&["pre"]));
        let v2 = fx.write_bundle("api1_v2", pre_manifest(&["pre"]));
        let other = fx.write_bundle("api3_v1", pre_manifest(&["pre"]));
        let dispatcher = fx.dispatcher(CollisionPolicy::Reject);

        let version = |d: &Dispatcher, api: &str| -> Value {
            let out: Value = serde_json::from_slice(&d.dispatch_hook(&message(api, "pre"))).unwrap();
            out["v"].clone()
        };

        dispatcher.load_bundle(&v1).unwrap();
        dispatcher.load_bundle(&other).unwrap();
        assert_eq!(version(&dispatcher, "api1"), "1");

        dispatcher.load_bundle(&v2).unwrap();
        assert_eq!(version(&dispatcher, "api1"), "2");
        assert_eq!(version(&dispatcher, "api3"), "other");

        // Going back to a known bundle re-publishes it without reconstruction
        dispatcher.load_bundle(&v1).unwrap();
        assert_eq!(version(&dispatcher, "api1"), "1");
        assert_eq!(dispatcher.bundles().len(), 3);
        assert_eq!(fx.loader.resolutions(), 3);
    }

    #[test]
    fn test_concurrent_lookups_see_one_generation() {
        let fx = Fixture::new();
        let names = ["a", "b", "c", "d"];
        for revision in ["v1", "v2"] {
            let mut exports = ModuleExports::new();
            for name in names {
                exports.register_hook(name, tag("v", if revision == "v1" { "1" } else { "2" }));
            }
            fx.loader.register_bundle_unit("api1", revision, "middleware", exports);
        }
        let v1 = fx.write_bundle("api1_v1", pre_manifest(&names));
        let v2 = fx.write_bundle("api1_v2", pre_manifest(&names));
        let dispatcher = Arc::new(fx.dispatcher(CollisionPolicy::Reject));
        dispatcher.load_bundle(&v1).unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = Arc::clone(&dispatcher);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let set = dispatcher.hook_set("api1").unwrap();
                        let bundle_id = set.bundle().bundle_id();
                        assert_eq!(set.len(), 4);
                        assert!(set.hooks().values().all(|h| h.bundle_id() == bundle_id));

                        let out: Value =
                            serde_json::from_slice(&dispatcher.dispatch_hook(&message("api1", "c"))).unwrap();
                        assert!(out["v"] == "1" || out["v"] == "2");
                    }
                })
            })
            .collect();

        for i in 0..200 {
            let path = if i % 2 == 0 { &v2 } else { &v1 };
            dispatcher.load_bundle(path).unwrap();
        }

        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_collision_policy_applies_on_install() {
        let fx = Fixture::new();
        fx.loader
            .register_bundle_unit("api1", "v1", "middleware", ModuleExports::new().hook("pre", tag("v", "1")));
        fx.loader
            .register_bundle_unit("api1", "v2", "middleware", ModuleExports::new().hook("dup", tag("v", "2")));
        let good = fx.write_bundle("api1_v1", pre_manifest(&["pre"]));
        let colliding = fx.write_bundle(
            "api1_v2",
            json!({"custom_middleware": {"pre": [{"name": "dup"}], "post": [{"name": "dup"}]}}),
        );

        let strict = fx.dispatcher(CollisionPolicy::Reject);
        strict.load_bundle(&good).unwrap();
        let err = strict.load_bundle(&colliding).unwrap_err();
        assert_eq!(err.kind(), "collision");
        assert_eq!(strict.hook_set("api1").unwrap().bundle().bundle_id(), "api1_v1");
        assert_eq!(strict.bundles().len(), 1);

        let lenient = fx.dispatcher(CollisionPolicy::Warn);
        lenient.load_bundle(&colliding).unwrap();
        let set = lenient.hook_set("api1").unwrap();
        assert_eq!(set.get("dup").unwrap().hook_type(), gateway_coprocess_sdk::HookType::Post);
    }

    #[test]
    fn test_load_bundle_errors() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(CollisionPolicy::Reject);

        // No manifest on disk
        let err = dispatcher.load_bundle(fx.dir.path().join("bundles/api1_v9")).unwrap_err();
        assert_eq!(err.kind(), "load");

        // Directory name without an API id separator
        let path = fx.write_bundle("plainname", pre_manifest(&["pre"]));
        let err = dispatcher.load_bundle(&path).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidBundlePath(_)));
        assert!(dispatcher.bundles().is_empty());
    }

    #[test]
    fn test_bundle_without_resolvable_hooks_is_replaced_on_refresh() {
        let fx = Fixture::new();
        let empty = fx.write_bundle("api1_v1", pre_manifest(&["pre"]));
        let dispatcher = fx.dispatcher(CollisionPolicy::Reject);

        // Unit missing: bundle loads with no hooks
        dispatcher.load_bundle(&empty).unwrap();
        let first = dispatcher.hook_set("api1").unwrap();
        assert!(first.is_empty());

        // An empty entry never short-circuits
        dispatcher.load_bundle(&empty).unwrap();
        let second = dispatcher.hook_set("api1").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_broken_revision_keeps_working_hooks() {
        let fx = Fixture::new();
        fx.loader
            .register_bundle_unit("api1", "v1", "middleware", ModuleExports::new().hook("pre", tag("v", "1")));
        // No unit registered for v2
        let v1 = fx.write_bundle("api1_v1", pre_manifest(&["pre"]));
        let v2 = fx.write_bundle("api1_v2", pre_manifest(&["pre"]));
        let dispatcher = fx.dispatcher(CollisionPolicy::Reject);
        dispatcher.load_bundle(&v1).unwrap();

        let err = dispatcher.load_bundle(&v2).unwrap_err();
        assert!(matches!(err, DispatchError::NoUsableHooks { ref bundle_id, .. } if bundle_id == "api1_v2"));
        assert_eq!(err.kind(), "load");

        assert_eq!(dispatcher.hook_set("api1").unwrap().bundle().bundle_id(), "api1_v1");
        assert_eq!(dispatcher.bundles().len(), 1);
        let out: Value = serde_json::from_slice(&dispatcher.dispatch_hook(&message("api1", "pre"))).unwrap();
        assert_eq!(out["v"], "1");
    }

    /// Records the bundle directory of every resolution
    struct RecordingLoader {
        inner: StaticLoader,
        dirs: Mutex<Vec<PathBuf>>,
    }

    impl UnitLoader for RecordingLoader {
        fn resolve(
            &self,
            bundle_dir: &Path,
            api_id: &str,
            revision: &str,
            module: &str,
        ) -> Result<Arc<LoadedUnit>, LoadError> {
            self.dirs.lock().unwrap().push(bundle_dir.to_path_buf());
            self.inner.resolve(bundle_dir, api_id, revision, module)
        }

        fn load_event_unit(&self, dir: &Path, name: &str) -> Result<Arc<LoadedUnit>, LoadError> {
            self.inner.load_event_unit(dir, name)
        }

        fn unit_extension(&self) -> &str {
            self.inner.unit_extension()
        }
    }

    #[test]
    fn test_bundle_outside_bundle_path_resolves_from_its_own_dir() {
        let fx = Fixture::new();
        let loader = Arc::new(RecordingLoader {
            inner: StaticLoader::new().with_bundle_unit(
                "api1",
                "v1",
                "middleware",
                ModuleExports::new().hook("pre", tag("v", "staged")),
            ),
            dirs: Mutex::new(Vec::new()),
        });
        let root = fx.dir.path();
        let config = DispatcherConfig::new(root.join("middleware"), root.join("events"), root.join("bundles"));
        let dispatcher = Dispatcher::new(config, loader.clone());

        let staging = tempfile::tempdir().unwrap();
        let path = staging.path().join("api1_v1");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("manifest.json"), pre_manifest(&["pre"]).to_string()).unwrap();

        let bundle = dispatcher.load_bundle(&path).unwrap();
        assert_eq!(bundle.path(), path.as_path());
        assert_eq!(*loader.dirs.lock().unwrap(), vec![path.clone()]);
        assert!(!path.starts_with(&dispatcher.config().bundle_path));

        let out: Value = serde_json::from_slice(&dispatcher.dispatch_hook(&message("api1", "pre"))).unwrap();
        assert_eq!(out["v"], "staged");
    }

    fn bundle_zip(manifest: Value) -> Vec<u8> {
        use std::io::Write;
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("manifest.json", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(manifest.to_string().as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_install_archive_loads_bundle() {
        let fx = Fixture::new();
        fx.loader
            .register_bundle_unit("api1", "r7", "middleware", ModuleExports::new().hook("pre", tag("v", "r7")));
        let dispatcher = fx.dispatcher(CollisionPolicy::Reject);

        let mut manifest = pre_manifest(&["pre"]);
        manifest["checksum"] = json!("r7");
        let bundle = dispatcher.install_archive("api1", &bundle_zip(manifest)).unwrap();
        assert_eq!(bundle.bundle_id(), "api1_r7");
        assert!(bundle.path().starts_with(&dispatcher.config().bundle_path));

        let out: Value = serde_json::from_slice(&dispatcher.dispatch_hook(&message("api1", "pre"))).unwrap();
        assert_eq!(out["v"], "r7");

        let err = dispatcher.install_archive("api1", b"not a zip").unwrap_err();
        assert_eq!(err.kind(), "archive");
        assert_eq!(dispatcher.bundles().len(), 1);
    }

    /// Collects formatted log output
    #[derive(Clone, Default)]
    struct LogCapture(Arc<Mutex<Vec<u8>>>);

    impl LogCapture {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
        type Writer = LogCapture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_dispatch_failures_are_logged() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(CollisionPolicy::Reject);
        let logs = LogCapture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            dispatcher.dispatch_hook(&message("api1", "pre"));
            dispatcher.dispatch_hook(b"not json");
            dispatcher.dispatch_event(b"garbage");
        });

        let out = logs.contents();
        assert!(out.contains("Can't dispatch 'pre', hook is not defined."), "{out}");
        assert!(out.contains("api_id=api1"), "{out}");
        assert_eq!(out.matches("Can't dispatch, error: Malformed envelope").count(), 2, "{out}");
        assert!(out.contains("error_kind=\"decode\""), "{out}");
    }

    #[test]
    fn test_event_dispatch() {
        let fx = Fixture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        fx.loader.register_event_unit(
            "keys",
            ModuleExports::new().event_handler("onKeyExpired", move |event: &Event| -> Result<(), HandlerError> {
                assert_eq!(event.message["key"], "abc");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let dispatcher = fx.dispatcher(CollisionPolicy::Reject);
        assert_eq!(dispatcher.event_handlers().names(), vec!["onKeyExpired"]);

        dispatcher.dispatch_event(br#"{"handler_name": "onKeyExpired", "message": {"key": "abc"}}"#);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        dispatcher.dispatch_event(br#"{"handler_name": "onSomethingElse"}"#);
        dispatcher.dispatch_event(b"garbage");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reload_keeps_tables() {
        let fx = Fixture::new();
        fx.loader
            .register_bundle_unit("api1", "v1", "middleware", ModuleExports::new().hook("pre", tag("v", "1")));
        fx.loader.register_event_unit(
            "keys",
            ModuleExports::new().event_handler("onKeyExpired", |_e: &Event| -> Result<(), HandlerError> { Ok(()) }),
        );
        let path = fx.write_bundle("api1_v1", pre_manifest(&["pre"]));
        let dispatcher = fx.dispatcher(CollisionPolicy::Reject);
        dispatcher.load_bundle(&path).unwrap();
        let before = dispatcher.hook_set("api1").unwrap();

        dispatcher.reload();

        assert!(Arc::ptr_eq(&before, &dispatcher.hook_set("api1").unwrap()));
        assert_eq!(dispatcher.event_handlers().len(), 1);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let fx = Fixture::new();
        fx.loader
            .register_bundle_unit("api1", "v1", "middleware", ModuleExports::new().hook("pre", tag("v", "1")));
        let path = fx.write_bundle("api1_v1", pre_manifest(&["pre"]));
        let dispatcher = fx.dispatcher(CollisionPolicy::Reject);
        dispatcher.load_bundle(&path).unwrap();

        // A dispatch in flight keeps its hook set alive
        let in_flight = dispatcher.hook_set("api1").unwrap();
        dispatcher.shutdown();

        assert!(dispatcher.hook_table.is_empty());
        assert!(dispatcher.bundles().is_empty());
        assert!(dispatcher.event_handlers().is_empty());
        assert_eq!(in_flight.get("pre").unwrap().name(), "pre");

        let input = message("api1", "pre");
        assert_eq!(dispatcher.dispatch_hook(&input), input);
    }
}
