//! Event handler registry
//!
//! Built once at startup from the units discovered in the event handler
//! directory. A unit that fails to load is logged and skipped.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use gateway_coprocess_sdk::{Event, EventFn};

use crate::error::{panic_message, DispatchError};
use crate::loader::{LoadedUnit, UnitLoader};

/// A loaded event handler
pub struct EventHandler {
    name: String,
    // Declared before `unit` so the function drops before its library.
    func: Arc<dyn EventFn>,
    unit: Arc<LoadedUnit>,
}

impl EventHandler {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit_name(&self) -> &str {
        self.unit.name()
    }

    /// Run the handler, turning errors and panics into `Err`
    pub fn process(&self, event: &Event) -> Result<(), DispatchError> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.func.call(event))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(DispatchError::Handler {
                hook_name: self.name.clone(),
                source,
            }),
            Err(payload) => Err(DispatchError::Panicked {
                name: self.name.clone(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandler")
            .field("name", &self.name)
            .field("unit", &self.unit.name())
            .finish()
    }
}

/// Flat `handler_name -> handler` map
#[derive(Debug, Default)]
pub struct EventHandlerRegistry {
    handlers: HashMap<String, EventHandler>,
}

impl EventHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discover and load every event handler unit in `dir`
    pub fn load(dir: &Path, loader: &dyn UnitLoader) -> Self {
        tracing::debug!("Loading event handlers.");
        let mut registry = Self::new();

        for unit_name in loader.discover(dir) {
            match loader.load_event_unit(dir, &unit_name) {
                Ok(unit) => registry.register_unit(unit),
                Err(e) => {
                    tracing::error!(unit = %unit_name, "Failed to load event handler unit: {}", e);
                }
            }
        }

        tracing::info!(count = registry.len(), "Event handlers loaded");
        registry
    }

    /// Register every event handler a unit exports
    pub fn register_unit(&mut self, unit: Arc<LoadedUnit>) {
        for (name, func) in unit.exports().event_handlers() {
            let handler = EventHandler {
                name: name.to_string(),
                func: Arc::clone(func),
                unit: Arc::clone(&unit),
            };
            if let Some(previous) = self.handlers.insert(name.to_string(), handler) {
                tracing::warn!(
                    unit = %unit.name(),
                    "Event handler '{}' from unit '{}' replaced",
                    name,
                    previous.unit_name()
                );
            } else {
                tracing::debug!(unit = %unit.name(), "Registered event handler '{}'", name);
            }
        }
    }

    pub fn find(&self, handler_name: &str) -> Option<&EventHandler> {
        self.handlers.get(handler_name)
    }

    /// Registered handler names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}
