use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{EventError, EventResult};

/// Event payload in the shape it naturally arrived in.
///
/// Keeping the original shape avoids a forced re-encode: a Redis stream hands
/// over string fields, a producer may hand over a ready JSON object or raw bytes.
/// Every shape supports the same operations (decode into a typed target, coerce
/// into the envelope's string form).
///
/// An absent payload is represented as `Binary` with no bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A key-ordered JSON object.
    Structured(Map<String, Value>),
    /// Opaque bytes, expected to hold JSON when decoded.
    Binary(Vec<u8>),
    /// A string, expected to hold JSON when decoded.
    Text(String),
}

impl Payload {
    pub fn empty() -> Self {
        Payload::Binary(Vec::new())
    }

    /// JSON-encode any serializable value into a `Binary` payload.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> EventResult<Self> {
        serde_json::to_vec(value)
            .map(Payload::Binary)
            .map_err(EventError::Encode)
    }

    /// Map the value found under an incoming envelope's `payload` key.
    ///
    /// Objects and strings keep their shape, `null` counts as absent, any other
    /// JSON value is re-encoded to bytes.
    pub(crate) fn from_incoming(value: Option<Value>) -> EventResult<Self> {
        match value {
            None | Some(Value::Null) => Ok(Payload::empty()),
            Some(Value::Object(map)) => Ok(Payload::Structured(map)),
            Some(Value::String(s)) => Ok(Payload::Text(s)),
            Some(other) => Self::from_serialize(&other),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Structured(map) => map.is_empty(),
            Payload::Binary(bytes) => bytes.is_empty(),
            Payload::Text(s) => s.is_empty(),
        }
    }

    /// Decode the payload into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> EventResult<T> {
        match self {
            Payload::Structured(map) => {
                serde_json::from_value(Value::Object(map.clone())).map_err(EventError::Decode)
            }
            Payload::Binary(bytes) => serde_json::from_slice(bytes).map_err(EventError::Decode),
            Payload::Text(s) => serde_json::from_str(s).map_err(EventError::Decode),
        }
    }

    /// The string carried under the envelope's `payload` key.
    pub fn to_wire_string(&self) -> EventResult<String> {
        match self {
            Payload::Structured(map) => serde_json::to_string(map).map_err(EventError::Encode),
            Payload::Binary(bytes) => {
                String::from_utf8(bytes.clone()).map_err(|_| EventError::NonUtf8Payload)
            }
            Payload::Text(s) => Ok(s.clone()),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(value: Map<String, Value>) -> Self {
        Payload::Structured(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Binary(value)
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Payload::Binary(value.to_vec())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}
