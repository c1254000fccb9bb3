//! Error types for the dispatch core

use std::path::PathBuf;

use gateway_coprocess_sdk::{HandlerError, HookType};
use thiserror::Error;

/// Failures resolving or loading an executable unit
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Unit not found: {0:?}")]
    NotFound(PathBuf),

    #[error("Unit not registered: {0}")]
    NotRegistered(String),

    #[error("Failed to load library {path:?}: {source}")]
    Library {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("Library {path:?} has no coprocess_module entry: {source}")]
    MissingEntry {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("Unit {0} returned no exports")]
    EmptyExports(String),

    #[error("Invalid bundle manifest: {0}")]
    Manifest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the dispatcher
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Malformed envelope: {0}")]
    Decode(#[source] HandlerError),

    #[error("Envelope is missing {0}")]
    MissingField(&'static str),

    #[error("Failed to encode result: {0}")]
    Encode(#[source] HandlerError),

    #[error("Hook '{hook_name}' is not defined for API '{api_id}'")]
    HookNotDefined { api_id: String, hook_name: String },

    #[error("Hook '{hook_name}' failed: {source}")]
    Handler {
        hook_name: String,
        #[source]
        source: HandlerError,
    },

    #[error("Handler '{name}' panicked: {message}")]
    Panicked { name: String, message: String },

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Invalid bundle path {0:?}: expected a directory named <api_id>_<revision>")]
    InvalidBundlePath(PathBuf),

    #[error("Bundle '{bundle_id}' declares hook '{name}' as both {first} and {second}")]
    HookCollision {
        bundle_id: String,
        name: String,
        first: HookType,
        second: HookType,
    },

    #[error("Bundle '{bundle_id}' resolved no hooks; keeping the current hooks of API '{api_id}'")]
    NoUsableHooks { bundle_id: String, api_id: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bundle archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl DispatchError {
    /// Stable short classification, logged as `error_kind`
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Decode(_) | DispatchError::MissingField(_) => "decode",
            DispatchError::Encode(_) => "encode",
            DispatchError::HookNotDefined { .. } => "routing",
            DispatchError::Handler { .. } | DispatchError::Panicked { .. } => "handler",
            DispatchError::Load(_) | DispatchError::InvalidBundlePath(_) | DispatchError::NoUsableHooks { .. } => {
                "load"
            }
            DispatchError::HookCollision { .. } => "collision",
            DispatchError::Config(_) => "config",
            DispatchError::Archive(_) => "archive",
        }
    }
}

/// Render a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
