//! The coprocess object envelope
//!
//! The gateway serializes one `Object` per hook invocation. Every modelled
//! field is optional and fields the dispatcher does not model are kept in
//! `extra`, so a hook that changes nothing hands back a JSON-equal document.
//! Values are never normalized on the way through: a `hook_type` sent as the
//! numeric code `1` goes back out as `1`.

use crate::error::HandlerError;
use crate::hook::HookType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Key under which the gateway stores the API identifier in `spec`
pub const SPEC_API_ID: &str = "APIID";

/// Represents one request passing through a hook
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Object {
    /// Hook category exactly as the gateway sent it (code or name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_type: Option<Value>,

    /// Name of the hook to run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_name: Option<String>,

    /// The request as seen by the gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<MiniRequestObject>,

    /// Session attached to the request, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionState>,

    /// Free-form metadata shared between hooks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,

    /// API definition values (API ID, org ID, config data)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Map<String, Value>>,

    /// Upstream response, present for response hooks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseObject>,

    /// Category of the handler the dispatcher routed this object to.
    ///
    /// Set by the dispatcher before the handler runs; never serialized.
    #[serde(skip)]
    pub dispatched_as: Option<HookType>,

    /// Fields not modelled above
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Object {
    /// Decode an object from its serialized form
    pub fn from_slice(bytes: &[u8]) -> Result<Self, HandlerError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encode the object for the gateway
    pub fn to_vec(&self) -> Result<Vec<u8>, HandlerError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Name of the hook to run, empty when the gateway sent none
    pub fn hook_name(&self) -> &str {
        self.hook_name.as_deref().unwrap_or("")
    }

    /// The hook category the gateway asked for, if it sent a known one.
    ///
    /// Accepts the numeric protobuf code as well as any of the names
    /// [`HookType`] parses.
    pub fn hook_category(&self) -> Option<HookType> {
        let raw = self.hook_type.as_ref()?;
        serde_json::from_value(raw.clone()).ok()
    }

    /// The API this object belongs to.
    ///
    /// Reads `spec.APIID`, falling back to `spec.api_id`.
    pub fn api_id(&self) -> Option<&str> {
        let spec = self.spec.as_ref()?;
        spec.get(SPEC_API_ID)
            .or_else(|| spec.get("api_id"))
            .and_then(Value::as_str)
    }

    /// Mutable access to the metadata, creating an empty map if absent
    pub fn metadata_mut(&mut self) -> &mut HashMap<String, String> {
        self.metadata.get_or_insert_with(HashMap::new)
    }

    /// Mutable access to the request, creating an empty one if absent
    pub fn request_mut(&mut self) -> &mut MiniRequestObject {
        self.request.get_or_insert_with(MiniRequestObject::default)
    }

    /// Stop the request in the gateway and answer with the given status.
    ///
    /// # Example
    /// ```ignore
    /// object.short_circuit(403, "forbidden by policy");
    /// ```
    pub fn short_circuit(&mut self, response_code: i32, response_error: impl Into<String>) {
        let request = self.request_mut();
        request.return_overrides = Some(ReturnOverrides {
            response_code: Some(response_code),
            response_error: Some(response_error.into()),
            ..ReturnOverrides::default()
        });
    }

    /// Whether a hook has asked the gateway to stop the request
    pub fn is_short_circuited(&self) -> bool {
        self.request
            .as_ref()
            .and_then(|r| r.return_overrides.as_ref())
            .and_then(|o| o.response_code)
            .map(|code| code > 0)
            .unwrap_or(false)
    }
}

/// The request portion of an object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiniRequestObject {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,

    /// Headers to add before the request continues
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_headers: Option<HashMap<String, String>>,

    /// Header names to remove
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_headers: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<HashMap<String, String>>,

    /// Query parameters to add
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_params: Option<HashMap<String, String>>,

    /// Query parameter names to remove
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_params: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_overrides: Option<ReturnOverrides>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_uri: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MiniRequestObject {
    /// Ask the gateway to set a header on the request
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.set_headers
            .get_or_insert_with(HashMap::new)
            .insert(name.into(), value.into());
    }

    /// Ask the gateway to drop a header from the request
    pub fn delete_header(&mut self, name: impl Into<String>) {
        let name = name.into();
        let deleted = self.delete_headers.get_or_insert_with(Vec::new);
        if !deleted.contains(&name) {
            deleted.push(name);
        }
    }

    /// Case-insensitive header lookup on the incoming headers
    pub fn header(&self, name: &str) -> Option<&String> {
        self.headers
            .as_ref()?
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

/// Response the gateway sends instead of proxying upstream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReturnOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Upstream response handed to response hooks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseObject {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Session state for the key used on the request.
///
/// Rate and quota numbers stay in `extra` as sent, so an integer rate is
/// not re-encoded as a float.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionState {
    pub fn rate(&self) -> Option<f64> {
        self.extra.get("rate").and_then(Value::as_f64)
    }

    pub fn per(&self) -> Option<f64> {
        self.extra.get("per").and_then(Value::as_f64)
    }

    pub fn quota_remaining(&self) -> Option<i64> {
        self.extra.get("quota_remaining").and_then(Value::as_i64)
    }

    /// Expiry as a unix timestamp
    pub fn expires(&self) -> Option<i64> {
        self.extra.get("expires").and_then(Value::as_i64)
    }
}
