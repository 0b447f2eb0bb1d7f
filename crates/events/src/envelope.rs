//! Canonical wire envelope and the containers it can be normalized into.
//!
//! Every backend stores the same JSON object:
//!
//! ```text
//! { "action": "/some/action", "ttl": 30, "timestamp": 1699999999000, "payload": "<string>" }
//! ```
//!
//! Only the container differs: a pub/sub channel carries a string, a log entry
//! carries a field map, other transports may want raw bytes.

use core::fmt;
use core::str::FromStr;

use serde_json::{Map, Value};

use crate::error::{EventError, EventResult};

pub const ACTION_KEY: &str = "action";
pub const TTL_KEY: &str = "ttl";
pub const TIMESTAMP_KEY: &str = "timestamp";
pub const PAYLOAD_KEY: &str = "payload";

/// A wire value as received from (or handed to) a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    Map(Map<String, Value>),
    Text(String),
    Bytes(Vec<u8>),
}

impl RawEvent {
    /// Decode into a JSON object. Text and bytes must hold a JSON object.
    pub fn into_object(self) -> EventResult<Map<String, Value>> {
        match self {
            RawEvent::Map(map) => Ok(map),
            RawEvent::Text(s) => {
                serde_json::from_str(&s).map_err(|e| EventError::Malformed(e.to_string()))
            }
            RawEvent::Bytes(b) => {
                serde_json::from_slice(&b).map_err(|e| EventError::Malformed(e.to_string()))
            }
        }
    }

    pub fn format(&self) -> WireFormat {
        match self {
            RawEvent::Map(_) => WireFormat::Map,
            RawEvent::Text(_) => WireFormat::Text,
            RawEvent::Bytes(_) => WireFormat::Bytes,
        }
    }
}

impl From<Map<String, Value>> for RawEvent {
    fn from(value: Map<String, Value>) -> Self {
        RawEvent::Map(value)
    }
}

impl From<String> for RawEvent {
    fn from(value: String) -> Self {
        RawEvent::Text(value)
    }
}

impl From<&str> for RawEvent {
    fn from(value: &str) -> Self {
        RawEvent::Text(value.to_string())
    }
}

impl From<Vec<u8>> for RawEvent {
    fn from(value: Vec<u8>) -> Self {
        RawEvent::Bytes(value)
    }
}

/// Container shape selected at runtime (e.g. from configuration).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WireFormat {
    Map,
    Bytes,
    Text,
}

impl WireFormat {
    pub(crate) fn encode(self, envelope: Map<String, Value>) -> EventResult<RawEvent> {
        Ok(match self {
            WireFormat::Map => RawEvent::Map(envelope),
            WireFormat::Bytes => RawEvent::Bytes(Vec::<u8>::from_envelope(envelope)?),
            WireFormat::Text => RawEvent::Text(String::from_envelope(envelope)?),
        })
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WireFormat::Map => "map",
            WireFormat::Bytes => "bytes",
            WireFormat::Text => "text",
        };
        f.write_str(name)
    }
}

impl FromStr for WireFormat {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "map" => Ok(WireFormat::Map),
            "bytes" => Ok(WireFormat::Bytes),
            "text" | "string" => Ok(WireFormat::Text),
            other => Err(EventError::UnsupportedTarget(other.to_string())),
        }
    }
}

/// Containers an envelope can be normalized into.
pub trait NormalizeTarget: Sized {
    fn from_envelope(envelope: Map<String, Value>) -> EventResult<Self>;
}

impl NormalizeTarget for Map<String, Value> {
    fn from_envelope(envelope: Map<String, Value>) -> EventResult<Self> {
        Ok(envelope)
    }
}

impl NormalizeTarget for String {
    fn from_envelope(envelope: Map<String, Value>) -> EventResult<Self> {
        serde_json::to_string(&envelope).map_err(EventError::Encode)
    }
}

impl NormalizeTarget for Vec<u8> {
    fn from_envelope(envelope: Map<String, Value>) -> EventResult<Self> {
        serde_json::to_vec(&envelope).map_err(EventError::Encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_names() {
        assert_eq!("map".parse::<WireFormat>().unwrap(), WireFormat::Map);
        assert_eq!("Bytes".parse::<WireFormat>().unwrap(), WireFormat::Bytes);
        assert_eq!("string".parse::<WireFormat>().unwrap(), WireFormat::Text);
        assert!(matches!(
            "xml".parse::<WireFormat>(),
            Err(EventError::UnsupportedTarget(name)) if name == "xml"
        ));
    }

    #[test]
    fn raw_text_must_be_an_object() {
        assert!(RawEvent::from(r#"{"action":"/a"}"#).into_object().is_ok());
        assert!(matches!(
            RawEvent::from("[1,2,3]").into_object(),
            Err(EventError::Malformed(_))
        ));
        assert!(matches!(
            RawEvent::from(b"not json".to_vec()).into_object(),
            Err(EventError::Malformed(_))
        ));
    }
}
