//! `unipubsub-events`: the event model shared by every backend.
//!
//! Pure data and marshalling: no I/O, no threads. Backends hand raw wire values
//! to [`Event::incoming`]; producers build events with [`Event::outgoing`] and the
//! transport picks the container via [`EventData::normalize_into`].

pub mod data;
pub mod envelope;
pub mod error;
pub mod event;
pub mod handler;
pub mod normalize;
pub mod payload;

pub use data::EventData;
pub use envelope::{
    ACTION_KEY, NormalizeTarget, PAYLOAD_KEY, RawEvent, TIMESTAMP_KEY, TTL_KEY, WireFormat,
};
pub use error::{EventError, EventResult};
pub use event::{Event, EventId};
pub use handler::{ActionHandler, ActionRouter, HandlerRegistry, RouteError};
pub use normalize::{MINIMUM_TTL, clamp_ttl, normalize_action, normalize_ttl, parse_timestamp};
pub use payload::Payload;
