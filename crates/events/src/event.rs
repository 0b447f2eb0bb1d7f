use core::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::data::EventData;
use crate::envelope::RawEvent;
use crate::error::EventResult;
use crate::payload::Payload;

/// Where an event lives: its topic and, for log backends, the entry id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventId {
    topic: String,
    entry_id: Option<String>,
}

impl EventId {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            entry_id: None,
        }
    }

    pub fn with_entry_id(mut self, entry_id: impl Into<String>) -> Self {
        let entry_id = entry_id.into();
        self.entry_id = (!entry_id.is_empty()).then_some(entry_id);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn entry_id(&self) -> Option<&str> {
        self.entry_id.as_deref()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entry_id {
            Some(id) => write!(f, "{}@{}", self.topic, id),
            None => f.write_str(&self.topic),
        }
    }
}

/// An [`EventData`] addressed to (or received from) a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    id: EventId,
    data: EventData,
}

impl Event {
    pub fn new(id: EventId, data: EventData) -> Self {
        Self { id, data }
    }

    /// Parse an event delivered by a backend.
    pub fn incoming(id: EventId, raw: impl Into<RawEvent>) -> EventResult<Self> {
        Ok(Self {
            id,
            data: EventData::parse_incoming(raw)?,
        })
    }

    /// Build an event to publish.
    pub fn outgoing(
        topic: impl Into<String>,
        action: impl AsRef<str>,
        ttl: i64,
        payload: impl Into<Payload>,
    ) -> Self {
        Self {
            id: EventId::new(topic),
            data: EventData::outgoing(action, ttl, payload),
        }
    }

    /// Build an event to publish from any serializable payload.
    pub fn outgoing_json<T: Serialize + ?Sized>(
        topic: impl Into<String>,
        action: impl AsRef<str>,
        ttl: i64,
        payload: &T,
    ) -> EventResult<Self> {
        Ok(Self {
            id: EventId::new(topic),
            data: EventData::outgoing_json(action, ttl, payload)?,
        })
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn data(&self) -> &EventData {
        &self.data
    }

    pub fn into_data(self) -> EventData {
        self.data
    }

    pub fn topic(&self) -> &str {
        self.id.topic()
    }

    pub fn entry_id(&self) -> Option<&str> {
        self.id.entry_id()
    }

    pub fn action(&self) -> &str {
        self.data.action()
    }

    pub fn ttl(&self) -> u32 {
        self.data.ttl()
    }

    pub fn timestamp(&self) -> i64 {
        self.data.timestamp()
    }

    pub fn unmarshal_payload<T: DeserializeOwned>(&self) -> EventResult<T> {
        self.data.unmarshal_payload()
    }
}
