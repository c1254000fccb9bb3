//! Gateway coprocess dispatcher
//!
//! Routes hook invocations and events from the gateway to handlers shipped
//! in versioned bundles, and keeps a per-API hook table current as bundles
//! are loaded.
//!
//! # Overview
//!
//! - [`Dispatcher`] owns the bundle list, the hook table and the event
//!   handler registry
//! - [`Bundle`] resolves the hooks a bundle declares through a
//!   [`UnitLoader`]
//! - [`host::serve`] speaks the framed protocol with the gateway

pub mod bundle;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod hook_table;
pub mod host;
pub mod loader;

pub use bundle::{Bundle, BundleArchive, BundleManifest, HookHandler, HookMap, InstalledBundle};
pub use config::{CollisionPolicy, DispatcherConfig};
pub use dispatcher::{Dispatcher, InstallOutcome};
pub use error::{DispatchError, LoadError};
pub use events::{EventHandler, EventHandlerRegistry};
pub use hook_table::{HookSet, HookTable};
pub use loader::{DylibLoader, LoadedUnit, StaticLoader, UnitLoader};
