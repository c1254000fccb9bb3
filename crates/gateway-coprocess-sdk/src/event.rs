//! Event envelope

use crate::error::HandlerError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A gateway event addressed to a named event handler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Name of the event handler that should receive the event
    pub handler_name: String,

    /// Event type as reported by the gateway (e.g. "KeyExpired")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    /// Event payload
    #[serde(default)]
    pub message: Value,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    /// Decode an event from its serialized form
    pub fn from_slice(bytes: &[u8]) -> Result<Self, HandlerError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event() {
        let event = Event::from_slice(br#"{"handler_name":"onKeyExpired","event":"KeyExpired","message":{"key":"abc"}}"#).unwrap();
        assert_eq!(event.handler_name, "onKeyExpired");
        assert_eq!(event.event.as_deref(), Some("KeyExpired"));
        assert_eq!(event.message["key"], "abc");
    }

    #[test]
    fn test_handler_name_required() {
        assert!(Event::from_slice(br#"{"message":{}}"#).is_err());
    }
}
