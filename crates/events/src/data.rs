use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

use crate::envelope::{
    ACTION_KEY, NormalizeTarget, PAYLOAD_KEY, RawEvent, TIMESTAMP_KEY, TTL_KEY, WireFormat,
};
use crate::error::{EventError, EventResult};
use crate::normalize::{clamp_ttl, normalize_action, normalize_ttl, parse_timestamp};
use crate::payload::Payload;

/// Immutable event body: action, TTL, creation time and payload.
///
/// Construction always normalizes: the action gets a leading `/` and the TTL is
/// clamped at [`crate::MINIMUM_TTL`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    action: String,
    ttl: u32,
    timestamp: i64,
    payload: Payload,
}

impl EventData {
    pub fn new(action: &str, ttl: i64, timestamp: i64, payload: Payload) -> Self {
        Self {
            action: normalize_action(action),
            ttl: clamp_ttl(ttl),
            timestamp,
            payload,
        }
    }

    /// Build producer-side data stamped with the current wall-clock time.
    pub fn outgoing(action: impl AsRef<str>, ttl: i64, payload: impl Into<Payload>) -> Self {
        Self::new(
            action.as_ref(),
            ttl,
            chrono::Utc::now().timestamp_millis(),
            payload.into(),
        )
    }

    /// Like [`EventData::outgoing`] but JSON-encodes an arbitrary value.
    pub fn outgoing_json<T: Serialize + ?Sized>(
        action: impl AsRef<str>,
        ttl: i64,
        payload: &T,
    ) -> EventResult<Self> {
        Ok(Self::outgoing(action, ttl, Payload::from_serialize(payload)?))
    }

    /// Parse backend data (field map, JSON string or JSON bytes).
    ///
    /// Requires a string `action`; `ttl`, `timestamp` and `payload` are optional.
    pub fn parse_incoming(raw: impl Into<RawEvent>) -> EventResult<Self> {
        let mut object = raw.into().into_object()?;

        let action = match object.get(ACTION_KEY) {
            Some(Value::String(action)) => normalize_action(action),
            _ => return Err(EventError::UnknownAction),
        };
        let ttl = normalize_ttl(object.get(TTL_KEY));
        let timestamp = parse_timestamp(object.get(TIMESTAMP_KEY));

        let payload = object.remove(PAYLOAD_KEY);
        if payload.is_none() {
            debug!(action = %action, "event carries no payload");
        }

        Ok(Self {
            action,
            ttl,
            timestamp,
            payload: Payload::from_incoming(payload)?,
        })
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// Unix milliseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn raw_payload(&self) -> &Payload {
        &self.payload
    }

    pub fn unmarshal_payload<T: DeserializeOwned>(&self) -> EventResult<T> {
        self.payload.decode()
    }

    /// The canonical envelope object. The payload key is omitted when empty.
    pub fn envelope(&self) -> EventResult<Map<String, Value>> {
        let mut envelope = Map::new();
        envelope.insert(ACTION_KEY.to_string(), Value::from(self.action.as_str()));
        envelope.insert(TTL_KEY.to_string(), Value::from(self.ttl));
        envelope.insert(TIMESTAMP_KEY.to_string(), Value::from(self.timestamp));

        let payload = self.payload.to_wire_string()?;
        if !payload.is_empty() {
            envelope.insert(PAYLOAD_KEY.to_string(), Value::String(payload));
        }

        Ok(envelope)
    }

    /// Normalize into a statically chosen container (`Map`, `String` or `Vec<u8>`).
    pub fn normalize_into<T: NormalizeTarget>(&self) -> EventResult<T> {
        T::from_envelope(self.envelope()?)
    }

    /// Normalize into a container chosen at runtime.
    pub fn normalize_to(&self, format: WireFormat) -> EventResult<RawEvent> {
        format.encode(self.envelope()?)
    }
}
