//! Delivery strategies: how an orchestrator publishes and which worker consumes.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use unipubsub_events::{Event, EventId};

use crate::backend::{BroadcastBackend, LogBackend};
use crate::config::WorkerConfig;
use crate::error::{PubSubError, PubSubResult};
use crate::topic::AUTO_ENTRY_ID;
use crate::worker::{BroadcastWorker, LogWorker, Worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Fire-and-forget, no resumable position.
    Broadcast,
    /// Ordered log with per-entry ids and resumable offsets.
    Log,
}

impl fmt::Display for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Broadcast => f.write_str("broadcast"),
            Delivery::Log => f.write_str("log"),
        }
    }
}

/// Backend-specific half of the orchestrator.
pub trait Strategy: Send + Sync + 'static {
    fn delivery(&self) -> Delivery;

    /// Encode `event` for the backend and write it.
    ///
    /// Returns the event id, carrying the assigned entry id for log backends.
    fn publish(&self, event: &Event) -> PubSubResult<EventId>;

    /// A fresh, idle worker. `last_sync` is the replay-suppression baseline.
    fn worker(&self, name: String, config: &WorkerConfig, last_sync: i64) -> Box<dyn Worker>;
}

/// Pub/sub channel delivery.
pub struct BroadcastStrategy<B: BroadcastBackend> {
    backend: Arc<B>,
}

impl<B: BroadcastBackend> BroadcastStrategy<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }
}

impl<B: BroadcastBackend> Strategy for BroadcastStrategy<B> {
    fn delivery(&self) -> Delivery {
        Delivery::Broadcast
    }

    fn publish(&self, event: &Event) -> PubSubResult<EventId> {
        let wire: String = event.data().normalize_into()?;
        let receivers = self.backend.publish(event.topic(), &wire)?;
        if receivers == 0 {
            return Err(PubSubError::NoSubscriberConsumed);
        }

        debug!(topic = %event.topic(), action = %event.action(), receivers, "published");
        Ok(event.id().clone())
    }

    fn worker(&self, name: String, config: &WorkerConfig, _last_sync: i64) -> Box<dyn Worker> {
        Box::new(BroadcastWorker::new(self.backend.clone(), config.clone()).with_name(name))
    }
}

/// Stream delivery.
pub struct LogStrategy<L: LogBackend> {
    backend: Arc<L>,
}

impl<L: LogBackend> LogStrategy<L> {
    pub fn new(backend: Arc<L>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<L> {
        &self.backend
    }
}

impl<L: LogBackend> Strategy for LogStrategy<L> {
    fn delivery(&self) -> Delivery {
        Delivery::Log
    }

    fn publish(&self, event: &Event) -> PubSubResult<EventId> {
        let fields: Map<String, Value> = event.data().normalize_into()?;
        let requested = event.entry_id().unwrap_or(AUTO_ENTRY_ID);

        let assigned = self.backend.append(event.topic(), requested, &fields)?;
        if assigned.is_empty() {
            return Err(PubSubError::NoEntryId);
        }

        debug!(topic = %event.topic(), entry_id = %assigned, action = %event.action(), "appended");
        Ok(EventId::new(event.topic()).with_entry_id(assigned))
    }

    fn worker(&self, name: String, config: &WorkerConfig, last_sync: i64) -> Box<dyn Worker> {
        Box::new(
            LogWorker::new(self.backend.clone(), config.clone())
                .with_name(name)
                .with_last_sync(last_sync),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryBroadcast, InMemoryLog};
    use std::time::Duration;

    #[test]
    fn broadcast_without_subscribers_is_reported() {
        let strategy = BroadcastStrategy::new(Arc::new(InMemoryBroadcast::new()));
        let event = Event::outgoing("t", "a", 0, "x");

        assert!(matches!(
            strategy.publish(&event),
            Err(PubSubError::NoSubscriberConsumed)
        ));
    }

    #[test]
    fn broadcast_publishes_the_string_envelope() {
        let backend = Arc::new(InMemoryBroadcast::new());
        let sub = backend.subscribe(&["t".to_string()]).unwrap();
        let strategy = BroadcastStrategy::new(backend);

        let id = strategy.publish(&Event::outgoing("t", "a", 5, "x")).unwrap();
        assert_eq!(id.entry_id(), None);

        let msg = sub.recv_timeout(Duration::from_millis(100)).unwrap();
        let parsed: Value = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(parsed["action"], "/a");
        assert_eq!(parsed["ttl"], 5);
        assert_eq!(parsed["payload"], "x");
    }

    #[test]
    fn log_publish_returns_assigned_entry_id() {
        let backend = Arc::new(InMemoryLog::new());
        let strategy = LogStrategy::new(backend.clone());

        let id = strategy.publish(&Event::outgoing("s", "a", 0, "x")).unwrap();
        assert_eq!(id.topic(), "s");
        assert!(id.entry_id().is_some_and(|e| !e.is_empty()));
        assert_eq!(backend.len("s"), 1);
    }

    #[test]
    fn log_publish_without_entry_id_is_reported() {
        let strategy = LogStrategy::new(Arc::new(InMemoryLog::strict()));

        assert!(matches!(
            strategy.publish(&Event::outgoing("missing", "a", 0, "x")),
            Err(PubSubError::NoEntryId)
        ));
    }
}
