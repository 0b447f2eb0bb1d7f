//! The orchestrator.
//!
//! [`PubSub`] owns the tracked topics, the active workers, the shared event
//! channel and the running checkpoint. Its mutex guards bookkeeping only:
//! stopping and starting workers (backend I/O) happens with the lock released,
//! serialized by a `reconfiguring` flag so two subscribes never interleave.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use flume::Receiver;
use tracing::{debug, info, warn};

use unipubsub_events::{Event, EventId};

use crate::checkpoint::{CheckpointStore, JsonFileCheckpointStore};
use crate::config::PubSubConfig;
use crate::error::{CheckpointError, PubSubError, PubSubResult};
use crate::strategy::{Delivery, Strategy};
use crate::stream::EventStream;
use crate::sync_point::SyncPoint;
use crate::topic::Topic;
use crate::worker::{EventSink, StateCell, Worker, WorkerState};

struct State {
    topics: BTreeMap<String, Topic>,
    workers: Vec<Box<dyn Worker>>,
    checkpoint: SyncPoint,
    /// `None` once `stop` closed the channel.
    sink: Option<EventSink>,
    events: Option<Receiver<Event>>,
    reconfiguring: bool,
}

pub struct PubSub<S: Strategy> {
    strategy: S,
    config: PubSubConfig,
    store: Option<Arc<dyn CheckpointStore>>,
    /// Timestamp of the checkpoint loaded at construction.
    last_sync: i64,
    state: Mutex<State>,
    idle: Condvar,
    worker_seq: AtomicUsize,
}

impl<S: Strategy> PubSub<S> {
    /// Build an orchestrator. With `config.checkpoint_path` set, the checkpoint is
    /// loaded from (and persisted to) that JSON file.
    pub fn new(strategy: S, config: PubSubConfig) -> Self {
        let store = config
            .checkpoint_path
            .clone()
            .map(|path| Arc::new(JsonFileCheckpointStore::new(path)) as Arc<dyn CheckpointStore>);
        Self::build(strategy, config, store)
    }

    pub fn with_checkpoint_store(
        strategy: S,
        config: PubSubConfig,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self::build(strategy, config, Some(store))
    }

    fn build(strategy: S, config: PubSubConfig, store: Option<Arc<dyn CheckpointStore>>) -> Self {
        let checkpoint = match store.as_ref().map(|s| s.load()) {
            None => SyncPoint::empty(),
            Some(Ok(point)) => {
                info!(
                    pubsub = %config.name,
                    timestamp = point.timestamp,
                    offsets = point.offsets.len(),
                    "checkpoint loaded"
                );
                point
            }
            Some(Err(CheckpointError::Missing)) => SyncPoint::empty(),
            Some(Err(e)) => {
                warn!(pubsub = %config.name, error = %e, "checkpoint unreadable; starting empty");
                SyncPoint::empty()
            }
        };

        let (sink, events) = flume::bounded(0);

        Self {
            strategy,
            last_sync: checkpoint.timestamp,
            store,
            state: Mutex::new(State {
                topics: BTreeMap::new(),
                workers: Vec::new(),
                checkpoint,
                sink: Some(sink),
                events: Some(events),
                reconfiguring: false,
            }),
            idle: Condvar::new(),
            worker_seq: AtomicUsize::new(0),
            config,
        }
    }

    pub fn delivery(&self) -> Delivery {
        self.strategy.delivery()
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Entries stamped at or before this time are never delivered by log workers.
    pub fn last_sync(&self) -> i64 {
        self.last_sync
    }

    /// Encode and write `event` to its topic.
    ///
    /// Broadcast: [`PubSubError::NoSubscriberConsumed`] when nobody was listening.
    /// Log: [`PubSubError::NoEntryId`] when the backend assigned no id.
    pub fn publish(&self, event: &Event) -> PubSubResult<EventId> {
        self.strategy.publish(event)
    }

    /// Start consuming `topics` in addition to those already tracked.
    ///
    /// Broadcast: already-tracked names are ignored; when nothing is new and the
    /// worker is live this returns without touching the backend. Log: the worker
    /// is always replaced by one reading the union, each topic resuming from the
    /// checkpoint offset when there is one.
    pub fn subscribe<I, T>(&self, topics: I) -> PubSubResult<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        let requested: Vec<Topic> = topics.into_iter().map(Into::into).collect();
        let _reconfiguring = self.begin_reconfigure()?;

        // Plan under the lock.
        let (retired, sink) = {
            let mut st = self.lock()?;
            let sink = st.sink.clone().ok_or(PubSubError::Closed)?;

            let mut added = 0usize;
            for topic in requested {
                if !st.topics.contains_key(topic.name()) {
                    st.topics.insert(topic.name().to_string(), topic);
                    added += 1;
                }
            }

            if st.topics.is_empty() {
                return Ok(());
            }

            if self.delivery() == Delivery::Broadcast && added == 0 {
                let cells: Vec<StateCell> = st.workers.iter().map(|w| w.state_cell()).collect();
                drop(st);
                if cells.iter().any(|c| c.get().is_live()) {
                    debug!(pubsub = %self.config.name, "all topics already subscribed");
                    return Ok(());
                }
                // Still reconfiguring, so the worker list cannot change meanwhile.
                st = self.lock()?;
            }

            (std::mem::take(&mut st.workers), sink)
        };

        // Stop the old workers with the lock released.
        let points: Vec<SyncPoint> = retired.into_iter().map(|mut w| w.stop()).collect();

        let seeded = {
            let mut st = self.lock()?;
            for point in &points {
                st.checkpoint.merge_from(point);
            }

            let State {
                topics, checkpoint, ..
            } = &mut *st;
            for topic in topics.values_mut() {
                if let Some(offset) = checkpoint.offset(topic.name()) {
                    topic.sync_offset(offset);
                }
            }
            topics.values().cloned().collect::<Vec<Topic>>()
        };

        let seq = self.worker_seq.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}-{}-{}", self.config.name, self.delivery(), seq);
        let mut worker = self
            .strategy
            .worker(name.clone(), &self.config.worker, self.last_sync);

        if let Err(e) = worker.run(seeded, sink) {
            warn!(pubsub = %self.config.name, worker = %name, error = %e, "worker failed to start");
            return Err(e);
        }

        self.lock()?.workers.push(worker);
        info!(pubsub = %self.config.name, worker = %name, "subscribed");
        Ok(())
    }

    /// The consumer end of the event channel. Handed out once.
    pub fn events(&self) -> Option<EventStream> {
        self.lock().ok()?.events.take().map(EventStream::new)
    }

    /// Stop every worker in start order, merge their checkpoints and close the
    /// event channel. Without active workers this returns the checkpoint unchanged.
    pub fn stop(&self) -> PubSubResult<SyncPoint> {
        let _reconfiguring = self.begin_reconfigure()?;

        let workers = {
            let mut st = self.lock()?;
            if st.workers.is_empty() {
                return Ok(st.checkpoint.clone());
            }
            std::mem::take(&mut st.workers)
        };

        let mut points = Vec::with_capacity(workers.len());
        for mut worker in workers {
            let point = worker.stop();
            debug!(pubsub = %self.config.name, state = %worker.state(), "worker stopped");
            points.push(point);
        }

        let mut st = self.lock()?;
        for point in &points {
            st.checkpoint.merge_from(point);
        }
        st.sink = None;

        info!(
            pubsub = %self.config.name,
            timestamp = st.checkpoint.timestamp,
            offsets = ?st.checkpoint.offsets,
            "stopped"
        );
        Ok(st.checkpoint.clone())
    }

    /// Tracked topics with their last known offsets.
    pub fn topics(&self) -> Vec<Topic> {
        self.lock()
            .map(|st| st.topics.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The running checkpoint.
    pub fn checkpoint(&self) -> SyncPoint {
        self.lock()
            .map(|st| st.checkpoint.clone())
            .unwrap_or_default()
    }

    /// Write the running checkpoint through the configured store.
    pub fn persist(&self) -> PubSubResult<()> {
        let store = self.store.as_ref().ok_or(PubSubError::NoCheckpointStore)?;
        let point = self.checkpoint();
        store.store(&point)?;
        info!(pubsub = %self.config.name, offsets = point.offsets.len(), "checkpoint persisted");
        Ok(())
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        let cells: Vec<StateCell> = self
            .lock()
            .map(|st| st.workers.iter().map(|w| w.state_cell()).collect())
            .unwrap_or_default();
        cells.iter().map(StateCell::get).collect()
    }

    fn lock(&self) -> PubSubResult<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| PubSubError::Poisoned)
    }

    /// Wait for any other reconfiguration to finish, then claim the flag.
    fn begin_reconfigure(&self) -> PubSubResult<Reconfiguring<'_>> {
        let mut st = self.lock()?;
        while st.reconfiguring {
            st = self.idle.wait(st).map_err(|_| PubSubError::Poisoned)?;
        }
        st.reconfiguring = true;
        Ok(Reconfiguring {
            state: &self.state,
            idle: &self.idle,
        })
    }
}

impl<S: Strategy> Drop for PubSub<S> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(pubsub = %self.config.name, error = %e, "stop on drop failed");
        }
    }
}

/// Clears the `reconfiguring` flag when dropped.
struct Reconfiguring<'a> {
    state: &'a Mutex<State>,
    idle: &'a Condvar,
}

impl Drop for Reconfiguring<'_> {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reconfiguring = false;
        self.idle.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryBroadcast, InMemoryLog, LogBackend};
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::config::WorkerConfig;
    use crate::strategy::{BroadcastStrategy, LogStrategy};
    use crate::topic::{AUTO_ENTRY_ID, EARLIEST_OFFSET};
    use serde::{Deserialize, Serialize};
    use serde_json::{Map, Value, json};
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Person {
        name: String,
    }

    fn config() -> PubSubConfig {
        PubSubConfig::default().with_name("test").with_worker(
            WorkerConfig::default()
                .with_poll_interval(Duration::from_millis(10))
                .with_read_block(Duration::from_millis(20)),
        )
    }

    fn broadcast() -> (Arc<InMemoryBroadcast>, PubSub<BroadcastStrategy<InMemoryBroadcast>>) {
        let backend = Arc::new(InMemoryBroadcast::new());
        let pubsub = PubSub::new(BroadcastStrategy::new(backend.clone()), config());
        (backend, pubsub)
    }

    fn log_with(
        store: InMemoryCheckpointStore,
    ) -> (Arc<InMemoryLog>, PubSub<LogStrategy<InMemoryLog>>) {
        let backend = Arc::new(InMemoryLog::new());
        let pubsub = PubSub::with_checkpoint_store(
            LogStrategy::new(backend.clone()),
            config(),
            Arc::new(store),
        );
        (backend, pubsub)
    }

    fn recv(events: &EventStream) -> Event {
        events.recv_timeout(Duration::from_secs(2)).unwrap()
    }

    /// Log entry fields stamped now, so no checkpoint suppresses them.
    fn fresh(action: &str) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("action".into(), json!(action));
        fields.insert("timestamp".into(), json!(chrono::Utc::now().timestamp_millis()));
        fields
    }

    #[test]
    fn broadcast_end_to_end_delivers_exactly_once() {
        let (_backend, pubsub) = broadcast();
        pubsub.subscribe(["T"]).unwrap();
        let events = pubsub.events().unwrap();

        let event =
            Event::outgoing_json("T", "/custom", 1, &Person { name: "John".into() }).unwrap();
        pubsub.publish(&event).unwrap();

        let got = recv(&events);
        assert_eq!(got.topic(), "T");
        assert_eq!(got.action(), "/custom");
        assert_eq!(got.ttl(), 1);
        assert_eq!(
            got.unmarshal_payload::<Person>().unwrap(),
            Person { name: "John".into() }
        );
        assert!(events.recv_timeout(Duration::from_millis(50)).is_err());

        let point = pubsub.stop().unwrap();
        assert!(point.offsets.is_empty());
    }

    #[test]
    fn log_end_to_end_checkpoints_the_entry_id() {
        let (_backend, pubsub) = log_with(InMemoryCheckpointStore::new());
        pubsub
            .subscribe([Topic::new("S").with_offset(EARLIEST_OFFSET)])
            .unwrap();
        let events = pubsub.events().unwrap();

        let event =
            Event::outgoing_json("S", "/custom", 1, &Person { name: "John".into() }).unwrap();
        let id = pubsub.publish(&event).unwrap();

        let got = recv(&events);
        let entry_id = got.entry_id().map(str::to_string).unwrap();
        assert!(!entry_id.is_empty());
        assert_eq!(id.entry_id(), Some(entry_id.as_str()));
        assert_eq!(got.unmarshal_payload::<Person>().unwrap().name, "John");

        let point = pubsub.stop().unwrap();
        assert_eq!(point.offset("S"), Some(entry_id.as_str()));
    }

    #[test]
    fn publish_reports_missing_consumers_and_ids() {
        let (_b, pubsub) = broadcast();
        assert!(matches!(
            pubsub.publish(&Event::outgoing("T", "a", 0, "x")),
            Err(PubSubError::NoSubscriberConsumed)
        ));

        let strict = PubSub::new(LogStrategy::new(Arc::new(InMemoryLog::strict())), config());
        assert!(matches!(
            strict.publish(&Event::outgoing("S", "a", 0, "x")),
            Err(PubSubError::NoEntryId)
        ));
    }

    #[test]
    fn duplicate_broadcast_subscribe_makes_no_backend_call() {
        let (backend, pubsub) = broadcast();
        pubsub.subscribe(["T"]).unwrap();
        pubsub.subscribe(["T"]).unwrap();
        assert_eq!(backend.subscribe_calls(), 1);

        pubsub.subscribe(["T", "U"]).unwrap();
        assert_eq!(backend.subscribe_calls(), 2);
        assert_eq!(backend.live_subscriptions(), 1);
        assert_eq!(pubsub.worker_states(), vec![WorkerState::Running]);

        let names: Vec<String> = pubsub.topics().iter().map(|t| t.name().to_string()).collect();
        assert_eq!(names, vec!["T", "U"]);
        pubsub.stop().unwrap();
    }

    #[test]
    fn log_subscribe_replaces_worker_with_union() {
        let (backend, pubsub) = log_with(InMemoryCheckpointStore::new());
        pubsub
            .subscribe([Topic::new("A").with_offset(EARLIEST_OFFSET)])
            .unwrap();
        pubsub
            .subscribe([Topic::new("B").with_offset(EARLIEST_OFFSET)])
            .unwrap();
        assert_eq!(pubsub.worker_states(), vec![WorkerState::Running]);

        let events = pubsub.events().unwrap();
        backend.append("A", AUTO_ENTRY_ID, &fresh("/a")).unwrap();
        backend.append("B", AUTO_ENTRY_ID, &fresh("/a")).unwrap();

        let mut topics = vec![
            recv(&events).topic().to_string(),
            recv(&events).topic().to_string(),
        ];
        topics.sort();
        assert_eq!(topics, vec!["A", "B"]);

        let point = pubsub.stop().unwrap();
        assert_eq!(point.offsets.len(), 2);
    }

    #[test]
    fn replacement_worker_resumes_after_consumed_entries() {
        let (backend, pubsub) = log_with(InMemoryCheckpointStore::new());
        pubsub
            .subscribe([Topic::new("A").with_offset(EARLIEST_OFFSET)])
            .unwrap();
        let events = pubsub.events().unwrap();

        let first = backend.append("A", AUTO_ENTRY_ID, &fresh("/first")).unwrap();
        assert_eq!(recv(&events).entry_id(), Some(first.as_str()));

        pubsub
            .subscribe([Topic::new("B").with_offset(EARLIEST_OFFSET)])
            .unwrap();
        assert_eq!(pubsub.checkpoint().offset("A"), Some(first.as_str()));
        let a = pubsub.topics().into_iter().find(|t| t.name() == "A").unwrap();
        assert_eq!(a.offset(), Some(first.as_str()));

        // The new worker reads A after `first`, so nothing is re-delivered.
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());

        let second = backend.append("A", AUTO_ENTRY_ID, &fresh("/second")).unwrap();
        let got = recv(&events);
        assert_eq!((got.action(), got.entry_id()), ("/second", Some(second.as_str())));
        assert_eq!(pubsub.worker_states(), vec![WorkerState::Running]);

        let point = pubsub.stop().unwrap();
        assert_eq!(point.offset("A"), Some(second.as_str()));
    }

    #[test]
    fn polling_consumer_receives_pending_entries() {
        let (backend, pubsub) = log_with(InMemoryCheckpointStore::new());
        backend.append("S", AUTO_ENTRY_ID, &fresh("/a")).unwrap();
        pubsub
            .subscribe([Topic::new("S").with_offset(EARLIEST_OFFSET)])
            .unwrap();
        let events = pubsub.events().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let got = loop {
            if let Ok(event) = events.try_recv() {
                break event;
            }
            assert!(Instant::now() < deadline, "pending entry never reached try_recv");
            thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(got.action(), "/a");
        pubsub.stop().unwrap();
    }

    #[test]
    fn backlog_drains_at_consumer_speed() {
        let (backend, pubsub) = log_with(InMemoryCheckpointStore::new());
        for _ in 0..1000 {
            backend.append("S", AUTO_ENTRY_ID, &fresh("/bulk")).unwrap();
        }
        pubsub
            .subscribe([Topic::new("S").with_offset(EARLIEST_OFFSET)])
            .unwrap();
        let events = pubsub.events().unwrap();

        let started = Instant::now();
        for _ in 0..1000 {
            recv(&events);
        }
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_secs(2), "1000 entries took {elapsed:?}");
        pubsub.stop().unwrap();
    }

    #[test]
    fn resumes_from_checkpoint_offsets() {
        let (backend, _) = log_with(InMemoryCheckpointStore::new());
        let mut fields = Map::new();
        fields.insert("action".into(), Value::from("/a"));
        fields.insert("timestamp".into(), Value::from(10));
        let seen = backend.append("S", AUTO_ENTRY_ID, &fields).unwrap();
        fields.insert("action".into(), Value::from("/b"));
        let fresh = backend.append("S", AUTO_ENTRY_ID, &fields).unwrap();

        let mut offsets = BTreeMap::new();
        offsets.insert("S".to_string(), seen);
        let store = InMemoryCheckpointStore::with_point(SyncPoint::new(5, offsets));
        let pubsub = PubSub::with_checkpoint_store(
            LogStrategy::new(backend.clone()),
            config(),
            Arc::new(store),
        );
        assert_eq!(pubsub.last_sync(), 5);

        pubsub.subscribe(["S"]).unwrap();
        let events = pubsub.events().unwrap();
        let got = recv(&events);
        assert_eq!(got.action(), "/b");
        assert_eq!(got.entry_id(), Some(fresh.as_str()));
    }

    #[test]
    fn entries_older_than_checkpoint_are_suppressed() {
        let (backend, _) = log_with(InMemoryCheckpointStore::new());
        let mut fields = Map::new();
        fields.insert("action".into(), Value::from("/old"));
        fields.insert("timestamp".into(), Value::from(100));
        let last = backend.append("S", AUTO_ENTRY_ID, &fields).unwrap();

        let mut offsets = BTreeMap::new();
        offsets.insert("S".to_string(), EARLIEST_OFFSET.to_string());
        let store = InMemoryCheckpointStore::with_point(SyncPoint::new(100, offsets));
        let pubsub =
            PubSub::with_checkpoint_store(LogStrategy::new(backend), config(), Arc::new(store));

        pubsub.subscribe(["S"]).unwrap();
        let events = pubsub.events().unwrap();
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());

        let point = pubsub.stop().unwrap();
        assert_eq!(point.offset("S"), Some(last.as_str()));
    }

    #[test]
    fn stop_without_workers_is_a_no_op() {
        let store = InMemoryCheckpointStore::with_point(SyncPoint::new(42, BTreeMap::new()));
        let (_, pubsub) = log_with(store);

        assert_eq!(pubsub.stop().unwrap(), SyncPoint::new(42, BTreeMap::new()));
        // The channel stays open.
        pubsub.subscribe(["S"]).unwrap();
        pubsub.stop().unwrap();
    }

    #[test]
    fn stop_closes_the_channel() {
        let (_b, pubsub) = broadcast();
        pubsub.subscribe(["T"]).unwrap();
        let events = pubsub.events().unwrap();

        pubsub.stop().unwrap();
        assert!(pubsub.worker_states().is_empty());
        assert!(events.recv_timeout(Duration::from_secs(2)).is_err());
        assert!(matches!(pubsub.subscribe(["T"]), Err(PubSubError::Closed)));
    }

    #[test]
    fn events_are_handed_out_once() {
        let (_b, pubsub) = broadcast();
        assert!(pubsub.events().is_some());
        assert!(pubsub.events().is_none());
    }

    #[test]
    fn unreadable_checkpoint_falls_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        std::fs::write(&path, "{broken").unwrap();

        let pubsub = PubSub::new(
            LogStrategy::new(Arc::new(InMemoryLog::new())),
            config().with_checkpoint_path(&path),
        );
        assert_eq!(pubsub.checkpoint(), SyncPoint::empty());
        assert_eq!(pubsub.last_sync(), 0);
    }

    #[test]
    fn persist_writes_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let pubsub = PubSub::new(
            LogStrategy::new(Arc::new(InMemoryLog::new())),
            config().with_checkpoint_path(&path),
        );

        pubsub.subscribe([Topic::new("S").with_offset("7-0")]).unwrap();
        pubsub.stop().unwrap();
        pubsub.persist().unwrap();

        let stored = JsonFileCheckpointStore::new(&path).load().unwrap();
        assert_eq!(stored.offset("S"), Some("7-0"));

        let (_b, bare) = broadcast();
        assert!(matches!(bare.persist(), Err(PubSubError::NoCheckpointStore)));
    }
}
