//! Gateway Coprocess SDK - Types shared by the dispatcher and extension units
//!
//! This crate provides the envelope types the gateway sends to the coprocess
//! dispatcher, the error type extension code reports failures with, and the
//! registration surface a loadable unit uses to publish its hooks and event
//! handlers.

pub mod error;
pub mod event;
pub mod handler;
pub mod hook;
pub mod ipc;
pub mod object;

pub mod prelude {
    //! Common imports for extension units
    pub use crate::error::HandlerError;
    pub use crate::event::Event;
    pub use crate::handler::{EventFn, HookFn, ModuleExports};
    pub use crate::hook::HookType;
    pub use crate::object::{MiniRequestObject, Object, ReturnOverrides, SessionState};
    pub use serde_json::{json, Value as JsonValue};
}

// Re-export key types at crate root
pub use error::HandlerError;
pub use event::Event;
pub use handler::{EventFn, HookFn, ModuleEntryFn, ModuleExports, MODULE_ENTRY_SYMBOL};
pub use hook::HookType;
pub use object::Object;
