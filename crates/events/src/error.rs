//! Event model error types.

use thiserror::Error;

/// Failures while parsing, encoding or decoding events.
#[derive(Debug, Error)]
pub enum EventError {
    /// The raw event had no string `action` key.
    #[error("unknown event action: missing or non-string `action` key")]
    UnknownAction,

    /// The raw event could not be decoded as a JSON object.
    #[error("malformed event: {0}")]
    Malformed(String),

    /// The payload could not be decoded into the requested type.
    #[error("payload decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// A payload or envelope could not be encoded to JSON.
    #[error("payload encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// Binary payload bytes are not valid UTF-8 and cannot be carried as a string.
    #[error("binary payload is not valid UTF-8")]
    NonUtf8Payload,

    /// A wire format name was not one of `map`, `bytes` or `text`.
    #[error("unsupported normalize target: {0}")]
    UnsupportedTarget(String),
}

/// Result alias for event operations.
pub type EventResult<T> = Result<T, EventError>;
