//! Hook categories

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The dispatch category of a hook.
///
/// Variants are declared in request pipeline order; the derived `Ord` is the
/// order in which a bundle's handlers are merged into its hook table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "HookTypeRepr", into = "&'static str")]
pub enum HookType {
    /// Runs before authentication
    Pre,
    /// Custom authentication (`auth_check` in bundle manifests)
    CustomKeyCheck,
    /// Runs after key authentication
    PostKeyAuth,
    /// Runs before the request is proxied upstream
    Post,
    /// Runs on the upstream response
    Response,
    /// Anything addressed by name only
    Custom,
}

impl HookType {
    pub const ALL: [HookType; 6] = [
        HookType::Pre,
        HookType::CustomKeyCheck,
        HookType::PostKeyAuth,
        HookType::Post,
        HookType::Response,
        HookType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookType::Pre => "pre",
            HookType::CustomKeyCheck => "custom_key_check",
            HookType::PostKeyAuth => "post_key_auth",
            HookType::Post => "post",
            HookType::Response => "response",
            HookType::Custom => "custom",
        }
    }

    /// Map the numeric code used by the gateway's protobuf encoding
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(HookType::Pre),
            2 => Some(HookType::Post),
            3 => Some(HookType::PostKeyAuth),
            4 => Some(HookType::CustomKeyCheck),
            5 => Some(HookType::Response),
            6 => Some(HookType::Custom),
            _ => None,
        }
    }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre" | "Pre" => Ok(HookType::Pre),
            "custom_key_check" | "auth_check" | "CustomKeyCheck" => Ok(HookType::CustomKeyCheck),
            "post_key_auth" | "PostKeyAuth" => Ok(HookType::PostKeyAuth),
            "post" | "Post" => Ok(HookType::Post),
            "response" | "Response" => Ok(HookType::Response),
            "custom" | "Custom" => Ok(HookType::Custom),
            other => Err(format!("unknown hook type: {}", other)),
        }
    }
}

impl From<HookType> for &'static str {
    fn from(hook_type: HookType) -> Self {
        hook_type.as_str()
    }
}

/// Wire representation: either the protobuf enum code or a name
#[derive(Deserialize)]
#[serde(untagged)]
enum HookTypeRepr {
    Code(u8),
    Name(String),
}

impl TryFrom<HookTypeRepr> for HookType {
    type Error = String;

    fn try_from(repr: HookTypeRepr) -> Result<Self, Self::Error> {
        match repr {
            HookTypeRepr::Code(code) => {
                HookType::from_code(code).ok_or_else(|| format!("unknown hook type code: {}", code))
            }
            HookTypeRepr::Name(name) => name.parse(),
        }
    }
}
