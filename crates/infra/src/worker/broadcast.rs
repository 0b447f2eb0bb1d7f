//! Broadcast worker: one live backend subscription, no resumable position.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use tracing::{debug, info, warn};

use unipubsub_events::{Event, EventId};

use crate::backend::{BroadcastBackend, BroadcastSubscription, SubscriptionCloser};
use crate::config::WorkerConfig;
use crate::error::{PubSubError, PubSubResult};
use crate::sync_point::SyncPoint;
use crate::topic::Topic;
use crate::worker::{
    EventSink, Handoff, LoopExit, LoopHandle, StateCell, Worker, WorkerState, hand_off,
    Shutdown, shutdown_requested,
};

pub struct BroadcastWorker<B: BroadcastBackend> {
    backend: Arc<B>,
    config: WorkerConfig,
    name: String,
    state: StateCell,
    started: bool,
    handle: Option<LoopHandle>,
    closer: Option<SubscriptionCloser>,
}

impl<B: BroadcastBackend> BroadcastWorker<B> {
    pub fn new(backend: Arc<B>, config: WorkerConfig) -> Self {
        Self {
            backend,
            config,
            name: "broadcast".to_string(),
            state: StateCell::default(),
            started: false,
            handle: None,
            closer: None,
        }
    }

    /// Name used for the loop thread and in logs.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<B: BroadcastBackend> Worker for BroadcastWorker<B> {
    fn run(&mut self, topics: Vec<Topic>, sink: EventSink) -> PubSubResult<()> {
        if self.started {
            return Err(PubSubError::AlreadyStarted);
        }
        self.started = true;

        let channels: Vec<String> = topics.iter().map(|t| t.name().to_string()).collect();

        // Returns once the backend confirmed the subscription is live.
        let subscription = match self.backend.subscribe(&channels) {
            Ok(sub) => sub,
            Err(e) => {
                self.state.set(WorkerState::Failed(e.to_string()));
                return Err(e.into());
            }
        };
        self.closer = Some(subscription.closer());

        let poll = self.config.poll_interval;
        let worker = self.name.clone();
        self.handle = Some(LoopHandle::spawn(
            self.name.clone(),
            self.state.clone(),
            move |shutdown| broadcast_loop(&worker, subscription, sink, shutdown, poll),
        )?);

        info!(worker = %self.name, topics = ?channels, "broadcast worker running");
        Ok(())
    }

    fn stop(&mut self) -> SyncPoint {
        match self.handle.as_mut() {
            Some(handle) => handle.stop(self.config.join_timeout),
            None if !self.started => {
                self.started = true;
                self.state.set(WorkerState::Stopped);
            }
            None => {}
        }
        if let Some(closer) = self.closer.take() {
            closer.close();
        }

        SyncPoint::stamped_now(BTreeMap::new())
    }

    fn state_cell(&self) -> StateCell {
        self.state.clone()
    }
}

fn broadcast_loop(
    worker: &str,
    subscription: BroadcastSubscription,
    sink: EventSink,
    shutdown: Shutdown,
    poll: Duration,
) -> LoopExit {
    loop {
        if shutdown_requested(&shutdown) {
            return Ok(());
        }

        let message = match subscription.recv_timeout(poll) {
            Ok(m) => m,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return Err("backend subscription closed".to_string());
            }
        };

        let event = match Event::incoming(EventId::new(message.channel.as_str()), message.payload)
        {
            Ok(e) => e,
            Err(err) => {
                warn!(
                    worker,
                    topic = %message.channel,
                    error = %err,
                    "dropping unparsable broadcast message"
                );
                continue;
            }
        };

        match hand_off(&sink, event, &shutdown) {
            Handoff::Delivered => {}
            Handoff::Shutdown => return Ok(()),
            Handoff::Disconnected => {
                debug!(worker, "event channel closed; broadcast loop exiting");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBroadcast;
    use serde::Deserialize;
    use std::thread;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Person {
        name: String,
    }

    fn config() -> WorkerConfig {
        WorkerConfig::default().with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn delivers_published_events_tagged_with_topic() {
        let backend = Arc::new(InMemoryBroadcast::new());
        let mut worker = BroadcastWorker::new(backend.clone(), config());
        let (sink, events) = flume::bounded(0);

        worker.run(vec![Topic::new("people")], sink).unwrap();
        assert_eq!(worker.state(), WorkerState::Running);

        let person = serde_json::json!({"name": "John"});
        let outgoing = Event::outgoing_json("people", "custom", 1, &person).unwrap();
        let wire: String = outgoing.data().normalize_into().unwrap();
        assert_eq!(backend.publish("people", &wire).unwrap(), 1);

        let got = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got.topic(), "people");
        assert_eq!(got.entry_id(), None);
        assert_eq!(got.action(), "/custom");
        assert_eq!(got.unmarshal_payload::<Person>().unwrap().name, "John");

        let point = worker.stop();
        assert!(point.offsets.is_empty());
        assert!(point.timestamp > 0);
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(backend.live_subscriptions(), 0);
    }

    #[test]
    fn unparsable_messages_are_skipped() {
        let backend = Arc::new(InMemoryBroadcast::new());
        let mut worker = BroadcastWorker::new(backend.clone(), config());
        let (sink, events) = flume::bounded(0);
        worker.run(vec![Topic::new("t")], sink).unwrap();

        backend.publish("t", "not json").unwrap();
        backend.publish("t", r#"{"action":"ok"}"#).unwrap();

        let got = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got.action(), "/ok");
        worker.stop();
    }

    #[test]
    fn second_run_is_rejected() {
        let backend = Arc::new(InMemoryBroadcast::new());
        let mut worker = BroadcastWorker::new(backend, config());
        let (sink, _events) = flume::bounded(0);

        worker.run(vec![Topic::new("t")], sink.clone()).unwrap();
        assert!(matches!(
            worker.run(vec![Topic::new("t")], sink),
            Err(PubSubError::AlreadyStarted)
        ));
        worker.stop();
    }

    #[test]
    fn stop_is_idempotent_and_does_not_wait_for_a_consumer() {
        let backend = Arc::new(InMemoryBroadcast::new());
        let mut worker = BroadcastWorker::new(backend.clone(), config());
        let (sink, _events) = flume::bounded(0);
        worker.run(vec![Topic::new("t")], sink).unwrap();

        // Nobody reads: the loop is parked in the hand-off when stop arrives.
        backend.publish("t", r#"{"action":"/a"}"#).unwrap();
        thread::sleep(Duration::from_millis(30));

        worker.stop();
        assert_eq!(worker.state(), WorkerState::Stopped);
        worker.stop();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn stopping_an_idle_worker_retires_it() {
        let backend = Arc::new(InMemoryBroadcast::new());
        let mut worker = BroadcastWorker::new(backend.clone(), config());
        worker.stop();

        assert_eq!(worker.state(), WorkerState::Stopped);
        let (sink, _events) = flume::bounded(0);
        assert!(matches!(
            worker.run(vec![Topic::new("t")], sink),
            Err(PubSubError::AlreadyStarted)
        ));
        assert_eq!(backend.subscribe_calls(), 0);
    }
}
