//! Bundle manifest parsing
//!
//! A bundle carries either `manifest.json` or `bundle.yaml`. YAML manifests
//! get environment variable substitution before parsing.

use std::path::Path;
use std::sync::LazyLock;

use gateway_coprocess_sdk::HookType;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::LoadError;

/// Manifest file names, in lookup order
pub const MANIFEST_FILENAMES: &[&str] = &["manifest.json", "bundle.yaml", "bundle.yml"];

/// Unit name used when a declaration does not name one
pub const DEFAULT_MODULE: &str = "middleware";

/// The bundle manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleManifest {
    /// Files shipped in the bundle
    #[serde(default)]
    pub file_list: Vec<String>,

    /// Declared hooks, per category
    #[serde(default)]
    pub custom_middleware: CustomMiddleware,

    /// Checksum of the bundle contents, used as the bundle revision
    #[serde(default)]
    pub checksum: Option<String>,

    /// Signature over the checksum
    #[serde(default)]
    pub signature: Option<String>,
}

/// Hook declarations grouped by category
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomMiddleware {
    #[serde(default, deserialize_with = "one_or_many")]
    pub pre: Vec<MiddlewareDefinition>,

    /// A single object in most manifests, a list is accepted too
    #[serde(default, deserialize_with = "one_or_many")]
    pub auth_check: Vec<MiddlewareDefinition>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub post_key_auth: Vec<MiddlewareDefinition>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub post: Vec<MiddlewareDefinition>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub response: Vec<MiddlewareDefinition>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub custom: Vec<MiddlewareDefinition>,

    /// Extension runtime the bundle targets
    #[serde(default)]
    pub driver: Option<String>,
}

/// One declared hook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareDefinition {
    /// Hook name (matches the function name exported by the unit)
    pub name: String,

    /// Unit exporting the hook, defaults to `middleware`
    #[serde(default)]
    pub module: Option<String>,

    /// Whether the gateway should attach the session
    #[serde(default)]
    pub require_session: bool,
}

impl MiddlewareDefinition {
    pub fn module(&self) -> &str {
        self.module.as_deref().unwrap_or(DEFAULT_MODULE)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(MiddlewareDefinition),
    Many(Vec<MiddlewareDefinition>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<MiddlewareDefinition>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(def)) => vec![def],
        Some(OneOrMany::Many(defs)) => defs,
    })
}

impl CustomMiddleware {
    /// Declarations for one category
    pub fn for_type(&self, hook_type: HookType) -> &[MiddlewareDefinition] {
        match hook_type {
            HookType::Pre => &self.pre,
            HookType::CustomKeyCheck => &self.auth_check,
            HookType::PostKeyAuth => &self.post_key_auth,
            HookType::Post => &self.post,
            HookType::Response => &self.response,
            HookType::Custom => &self.custom,
        }
    }

    /// All declarations in merge order
    pub fn declared(&self) -> impl Iterator<Item = (HookType, &MiddlewareDefinition)> {
        HookType::ALL
            .into_iter()
            .flat_map(move |t| self.for_type(t).iter().map(move |def| (t, def)))
    }
}

impl BundleManifest {
    /// Parse a JSON manifest
    pub fn parse_json(json: &str) -> Result<Self, LoadError> {
        serde_json::from_str(json).map_err(|e| LoadError::Manifest(e.to_string()))
    }

    /// Parse a YAML manifest, expanding environment variables first
    pub fn parse_yaml(yaml: &str) -> Result<Self, LoadError> {
        let expanded = expand_env_vars(yaml);
        serde_yaml::from_str(&expanded).map_err(|e| LoadError::Manifest(e.to_string()))
    }

    /// Parse manifest content by file name
    pub fn parse_named(file_name: &str, content: &str) -> Result<Self, LoadError> {
        if file_name.ends_with(".json") {
            Self::parse_json(content)
        } else {
            Self::parse_yaml(content)
        }
    }

    /// Load the manifest found in a bundle directory
    pub fn load<P: AsRef<Path>>(bundle_dir: P) -> Result<Self, LoadError> {
        let dir = bundle_dir.as_ref();
        for file_name in MANIFEST_FILENAMES {
            let path = dir.join(file_name);
            if path.is_file() {
                let content = std::fs::read_to_string(&path)?;
                let manifest = Self::parse_named(file_name, &content)?;
                manifest.validate()?;
                return Ok(manifest);
            }
        }
        Err(LoadError::Manifest(format!("no manifest found in {:?}", dir)))
    }

    /// Validate the manifest
    pub fn validate(&self) -> Result<(), LoadError> {
        for (hook_type, def) in self.custom_middleware.declared() {
            if def.name.trim().is_empty() {
                return Err(LoadError::Manifest(format!("{} hook without a name", hook_type)));
            }
            if def.module().trim().is_empty() {
                return Err(LoadError::Manifest(format!("hook '{}' names an empty module", def.name)));
            }
        }
        Ok(())
    }
}

static BRACED_VAR: LazyLock<regex_lite::Regex> = LazyLock::new(|| {
    regex_lite::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid pattern")
});

static BARE_VAR: LazyLock<regex_lite::Regex> =
    LazyLock::new(|| regex_lite::Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").expect("valid pattern"));

/// Expand environment variables in a string
/// Supports: ${VAR}, ${VAR:-default}, $VAR
fn expand_env_vars(input: &str) -> String {
    let result = BRACED_VAR.replace_all(input, |caps: &regex_lite::Captures| {
        let default = caps.get(2).map(|m| m.as_str());
        std::env::var(&caps[1]).unwrap_or_else(|_| default.unwrap_or("").to_string())
    });

    BARE_VAR
        .replace_all(&result, |caps: &regex_lite::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .to_string()
}
