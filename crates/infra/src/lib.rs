//! `unipubsub-infra`: backends, workers and the [`PubSub`] orchestrator.
//!
//! ```text
//! producer ── PubSub::publish ──> Strategy ──> backend (channel / log)
//!                                                  │
//! consumer <── EventStream <── Worker loop <───────┘
//! ```
//!
//! The strategy decides delivery semantics:
//! - [`BroadcastStrategy`]: fire-and-forget channels, no replay
//! - [`LogStrategy`]: ordered logs resumed from checkpointed offsets

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod pubsub;
pub mod strategy;
pub mod stream;
pub mod sync_point;
pub mod topic;
pub mod worker;

pub use backend::{
    BroadcastBackend, BroadcastMessage, BroadcastSubscription, InMemoryBroadcast, InMemoryLog,
    LogBackend, LogBatch, LogEntry, SubscriptionCloser,
};
#[cfg(feature = "redis")]
pub use backend::redis::{RedisBackend, RedisConfig};
pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore, JsonFileCheckpointStore};
pub use config::{PubSubConfig, WorkerConfig};
pub use error::{BackendError, CheckpointError, PubSubError, PubSubResult};
pub use pubsub::PubSub;
pub use strategy::{BroadcastStrategy, Delivery, LogStrategy, Strategy};
pub use stream::EventStream;
pub use sync_point::SyncPoint;
pub use topic::{AUTO_ENTRY_ID, EARLIEST_OFFSET, LATEST_OFFSET, Topic, TrackedTopics};
pub use worker::{BroadcastWorker, EventSink, LogWorker, StateCell, Worker, WorkerState};
