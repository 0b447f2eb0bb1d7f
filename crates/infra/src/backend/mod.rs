//! Backend seams.
//!
//! Two delivery semantics, two traits:
//!
//! - [`BroadcastBackend`]: fire-and-forget channels. No persistence, messages reach
//!   only subscribers live at publish time (Redis pub/sub).
//! - [`LogBackend`]: ordered, durable logs with per-entry ids and resumable read
//!   offsets (Redis Streams).
//!
//! Connection setup belongs to whoever builds the backend; the engine receives a
//! ready backend and never touches process-wide client state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::BackendError;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::{InMemoryBroadcast, InMemoryLog};

/// One message received on a broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessage {
    pub channel: String,
    pub payload: String,
}

/// Live broadcast subscription.
///
/// Messages are forwarded by the backend onto an internal channel. Dropping the
/// subscription (or calling [`SubscriptionCloser::close`]) tells the backend to
/// stop forwarding and release the underlying connection.
#[derive(Debug)]
pub struct BroadcastSubscription {
    receiver: Receiver<BroadcastMessage>,
    closed: Arc<AtomicBool>,
}

impl BroadcastSubscription {
    pub fn new(receiver: Receiver<BroadcastMessage>, closed: Arc<AtomicBool>) -> Self {
        Self { receiver, closed }
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<BroadcastMessage, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn closer(&self) -> SubscriptionCloser {
        SubscriptionCloser(self.closed.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for BroadcastSubscription {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Closes a [`BroadcastSubscription`] from outside the thread that owns it.
#[derive(Debug, Clone)]
pub struct SubscriptionCloser(Arc<AtomicBool>);

impl SubscriptionCloser {
    pub fn close(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Fire-and-forget channel backend.
pub trait BroadcastBackend: Send + Sync + 'static {
    /// Publish a message; returns how many subscribers received it.
    fn publish(&self, channel: &str, message: &str) -> Result<u64, BackendError>;

    /// Subscribe to every channel in `channels`.
    ///
    /// Returns only after the backend confirmed the subscription is live.
    fn subscribe(&self, channels: &[String]) -> Result<BroadcastSubscription, BackendError>;
}

impl<B> BroadcastBackend for Arc<B>
where
    B: BroadcastBackend + ?Sized,
{
    fn publish(&self, channel: &str, message: &str) -> Result<u64, BackendError> {
        (**self).publish(channel, message)
    }

    fn subscribe(&self, channels: &[String]) -> Result<BroadcastSubscription, BackendError> {
        (**self).subscribe(channels)
    }
}

/// One entry read from a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: String,
    pub fields: Map<String, Value>,
}

/// Entries read from one log, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBatch {
    pub stream: String,
    pub entries: Vec<LogEntry>,
}

/// Ordered, offset-addressable log backend.
pub trait LogBackend: Send + Sync + 'static {
    /// Append an entry; `entry_id` may be [`crate::AUTO_ENTRY_ID`].
    ///
    /// Returns the assigned id, or an empty string when the backend assigned none
    /// (e.g. the stream does not exist and the backend refuses to create it).
    fn append(
        &self,
        stream: &str,
        entry_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<String, BackendError>;

    /// Read entries strictly after each `(stream, offset)` position.
    ///
    /// Waits up to `block` for data; an empty result means nothing arrived.
    /// [`crate::LATEST_OFFSET`] resolves to the newest entry at call time.
    fn read(
        &self,
        request: &[(String, String)],
        block: Duration,
    ) -> Result<Vec<LogBatch>, BackendError>;
}

impl<L> LogBackend for Arc<L>
where
    L: LogBackend + ?Sized,
{
    fn append(
        &self,
        stream: &str,
        entry_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<String, BackendError> {
        (**self).append(stream, entry_id, fields)
    }

    fn read(
        &self,
        request: &[(String, String)],
        block: Duration,
    ) -> Result<Vec<LogBatch>, BackendError> {
        (**self).read(request, block)
    }
}
