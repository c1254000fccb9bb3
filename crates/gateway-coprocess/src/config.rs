//! Dispatcher configuration

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::DispatchError;

/// What to do when two handlers in one bundle share a name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollisionPolicy {
    /// Fail the install; the previous table entry stays in place
    #[default]
    Reject,
    /// Later handler wins, a warning is logged
    Warn,
    /// Later handler wins silently
    LastWriteWins,
}

impl FromStr for CollisionPolicy {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(CollisionPolicy::Reject),
            "warn" => Ok(CollisionPolicy::Warn),
            "last-write-wins" | "last_write_wins" => Ok(CollisionPolicy::LastWriteWins),
            other => Err(DispatchError::Config(format!(
                "unknown hook collision policy '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for CollisionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CollisionPolicy::Reject => "reject",
            CollisionPolicy::Warn => "warn",
            CollisionPolicy::LastWriteWins => "last-write-wins",
        })
    }
}

/// Dispatcher configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Root of middleware sources
    pub middleware_path: PathBuf,

    /// Directory scanned for event handler units at startup
    pub event_handler_path: PathBuf,

    /// Directory holding extracted bundles (`<api_id>_<revision>/`)
    pub bundle_path: PathBuf,

    /// How same-named handlers within one bundle are merged
    pub collision_policy: CollisionPolicy,

    /// `tracing` filter directive for the host binary
    pub log_filter: String,
}

const DEFAULT_LOG_FILTER: &str = "info,gateway_coprocess=debug";

impl DispatcherConfig {
    /// Build a config from the three locations supplied by the host
    pub fn new(
        middleware_path: impl Into<PathBuf>,
        event_handler_path: impl Into<PathBuf>,
        bundle_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            middleware_path: middleware_path.into(),
            event_handler_path: event_handler_path.into(),
            bundle_path: bundle_path.into(),
            collision_policy: CollisionPolicy::default(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }

    pub fn with_collision_policy(mut self, policy: CollisionPolicy) -> Self {
        self.collision_policy = policy;
        self
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, DispatchError> {
        let collision_policy = match env::var("COPROCESS_HOOK_COLLISIONS") {
            Ok(value) => value.parse()?,
            Err(_) => CollisionPolicy::default(),
        };

        Ok(Self {
            middleware_path: env::var("COPROCESS_MIDDLEWARE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./middleware")),

            event_handler_path: env::var("COPROCESS_EVENT_HANDLER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./event_handlers")),

            bundle_path: env::var("COPROCESS_BUNDLE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./middleware/bundles")),

            collision_policy,

            log_filter: env::var("COPROCESS_LOG")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string()),
        })
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::new("./middleware", "./event_handlers", "./middleware/bundles")
    }
}
