//! Module exports for loadable extension units
//!
//! A unit (a bundle's middleware module or an event handler module) publishes
//! its callable logic through a `ModuleExports` value. Dynamically loaded
//! units export it from a `coprocess_module` symbol, generated by
//! [`export_module!`].
//!
//! # Example
//!
//! ```ignore
//! use gateway_coprocess_sdk::prelude::*;
//!
//! fn add_header(mut object: Object) -> Result<Object, HandlerError> {
//!     object.request_mut().set_header("X-Handled", "true");
//!     Ok(object)
//! }
//!
//! fn exports() -> ModuleExports {
//!     ModuleExports::new().hook("add_header", add_header)
//! }
//!
//! gateway_coprocess_sdk::export_module!(exports);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::HandlerError;
use crate::event::Event;
use crate::object::Object;

/// Symbol name dynamic units must export
pub const MODULE_ENTRY_SYMBOL: &[u8] = b"coprocess_module";

/// Signature of the exported entry point.
///
/// The returned pointer is a boxed `ModuleExports` that the loader takes
/// ownership of.
pub type ModuleEntryFn = unsafe extern "C" fn() -> *mut ModuleExports;

/// A hook function: receives the object, returns it (possibly modified)
pub trait HookFn: Send + Sync {
    fn call(&self, object: Object) -> Result<Object, HandlerError>;
}

impl<F> HookFn for F
where
    F: Fn(Object) -> Result<Object, HandlerError> + Send + Sync,
{
    fn call(&self, object: Object) -> Result<Object, HandlerError> {
        self(object)
    }
}

/// An event handler function
pub trait EventFn: Send + Sync {
    fn call(&self, event: &Event) -> Result<(), HandlerError>;
}

impl<F> EventFn for F
where
    F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync,
{
    fn call(&self, event: &Event) -> Result<(), HandlerError> {
        self(event)
    }
}

/// Everything a unit makes available to the dispatcher
#[derive(Default)]
pub struct ModuleExports {
    hooks: HashMap<String, Arc<dyn HookFn>>,
    event_handlers: HashMap<String, Arc<dyn EventFn>>,
}

impl ModuleExports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hook function under `name`
    pub fn hook<F: HookFn + 'static>(mut self, name: impl Into<String>, hook: F) -> Self {
        self.register_hook(name, hook);
        self
    }

    /// Add an event handler under `name`
    pub fn event_handler<F: EventFn + 'static>(mut self, name: impl Into<String>, handler: F) -> Self {
        self.register_event_handler(name, handler);
        self
    }

    pub fn register_hook<F: HookFn + 'static>(&mut self, name: impl Into<String>, hook: F) {
        self.hooks.insert(name.into(), Arc::new(hook));
    }

    pub fn register_event_handler<F: EventFn + 'static>(&mut self, name: impl Into<String>, handler: F) {
        self.event_handlers.insert(name.into(), Arc::new(handler));
    }

    /// Look up a hook function by name
    pub fn get_hook(&self, name: &str) -> Option<Arc<dyn HookFn>> {
        self.hooks.get(name).cloned()
    }

    /// Names of all exported hooks, sorted
    pub fn hook_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.hooks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// All exported event handlers
    pub fn event_handlers(&self) -> impl Iterator<Item = (&str, &Arc<dyn EventFn>)> {
        self.event_handlers.iter().map(|(name, f)| (name.as_str(), f))
    }
}

impl fmt::Debug for ModuleExports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut event_handlers: Vec<&str> = self.event_handlers.keys().map(String::as_str).collect();
        event_handlers.sort_unstable();
        f.debug_struct("ModuleExports")
            .field("hooks", &self.hook_names())
            .field("event_handlers", &event_handlers)
            .finish()
    }
}

/// Export a unit's `ModuleExports` from a `cdylib`.
///
/// Takes the path of a `fn() -> ModuleExports` and generates the
/// `coprocess_module` entry point the dynamic loader looks up.
#[macro_export]
macro_rules! export_module {
    ($build:path) => {
        #[no_mangle]
        pub extern "C" fn coprocess_module() -> *mut $crate::ModuleExports {
            let exports: $crate::ModuleExports = $build();
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(exports))
        }
    };
}
