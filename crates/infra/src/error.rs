//! Infrastructure error model.

use thiserror::Error;

use unipubsub_events::EventError;

/// Backend I/O failure. Propagated as-is, never retried by the engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend connection error: {0}")]
    Connection(String),

    #[error("backend command error: {0}")]
    Command(String),

    /// The backend did not confirm a new subscription in time.
    #[error("subscription was not confirmed by the backend")]
    NotConfirmed,

    /// The subscription or backend was already closed.
    #[error("backend subscription closed")]
    Closed,
}

/// Checkpoint persistence failure.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint format error: {0}")]
    Format(#[from] serde_json::Error),

    #[error("no checkpoint stored")]
    Missing,
}

/// Errors surfaced by workers and the [`crate::PubSub`] orchestrator.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// `Worker::run` was called on a worker that already ran.
    #[error("worker already started")]
    AlreadyStarted,

    /// A broadcast publish reached zero live subscribers.
    #[error("no subscriber consumed the message")]
    NoSubscriberConsumed,

    /// A log append returned no entry id.
    #[error("no entry id assigned by the backend")]
    NoEntryId,

    /// The event channel was closed by `stop`.
    #[error("pubsub already stopped")]
    Closed,

    /// No checkpoint store was configured for `persist`.
    #[error("no checkpoint store configured")]
    NoCheckpointStore,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("internal lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

pub type PubSubResult<T> = Result<T, PubSubError>;
