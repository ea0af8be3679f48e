//! Panel message type and JSON line encoding

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ProtocolError, Result};

/// Field carrying the dispatch key of every message
pub const EVENT_FIELD: &str = "event";

/// A single panel message: an `event` name plus an open set of payload fields.
///
/// Fields keep their insertion order so frames written to the panel are
/// stable and readable in a serial monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message {
    fields: Map<String, Value>,
}

impl Message {
    /// Create a message with only the `event` field set
    pub fn new(event: &str) -> Self {
        Self::with_payload(event, Map::new())
    }

    /// Create a message from an event name and payload fields.
    ///
    /// A stray `event` key inside `payload` is overwritten by `event`.
    pub fn with_payload(event: &str, payload: Map<String, Value>) -> Self {
        let mut fields = Map::with_capacity(payload.len() + 1);
        fields.insert(EVENT_FIELD.to_string(), Value::String(event.to_string()));
        for (key, value) in payload {
            if key != EVENT_FIELD {
                fields.insert(key, value);
            }
        }
        Self { fields }
    }

    /// Event name (dispatch key)
    pub fn event(&self) -> &str {
        self.fields
            .get(EVENT_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Look up an arbitrary field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Set a payload field, returning the previous value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.into(), value.into())
    }

    /// `version` field of a `protocol_version_return` reply
    pub fn version(&self) -> Option<u32> {
        self.get("version")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }

    /// `value` field carried by panel command replies
    pub fn value(&self) -> Option<&Value> {
        self.get("value")
    }

    /// All fields, including `event`
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Payload fields without `event`
    pub fn into_payload(mut self) -> Map<String, Value> {
        self.fields.remove(EVENT_FIELD);
        self.fields
    }

    /// Serialize to a single JSON line, without the terminator
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.fields)?)
    }

    /// Parse one frame. Surrounding whitespace (including `\r\n`) is ignored.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(frame.trim_ascii())?;
        let Value::Object(fields) = value else {
            return Err(ProtocolError::MalformedMessage(
                "frame is not a JSON object".to_string(),
            ));
        };
        match fields.get(EVENT_FIELD) {
            Some(Value::String(_)) => Ok(Self { fields }),
            Some(_) => Err(ProtocolError::MalformedMessage(
                "'event' field is not a string".to_string(),
            )),
            None => Err(ProtocolError::MalformedMessage(
                "missing 'event' field".to_string(),
            )),
        }
    }
}
