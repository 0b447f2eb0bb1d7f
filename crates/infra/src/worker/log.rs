//! Log worker: polls ordered logs from tracked offsets.
//!
//! Each iteration reads every tracked topic from its current offset, forwards
//! entries in arrival order and advances the topic to the last entry it
//! processed. Entries stamped at or before `last_sync` were already accounted
//! for by a prior checkpoint; they are skipped but still advance the offset.
//!
//! A backend error or a panic inside an iteration ends the loop (fail-stop) and
//! leaves the worker `Failed`.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use flume::RecvTimeoutError;
use tracing::{debug, error, info, warn};

use unipubsub_events::{Event, EventId};

use crate::backend::{LogBackend, LogBatch};
use crate::config::WorkerConfig;
use crate::error::{BackendError, PubSubError, PubSubResult};
use crate::sync_point::SyncPoint;
use crate::topic::{Topic, TrackedTopics};
use crate::worker::{
    EventSink, Handoff, LoopExit, LoopHandle, StateCell, Worker, WorkerState, hand_off,
    Shutdown, shutdown_requested,
};

pub struct LogWorker<L: LogBackend> {
    backend: Arc<L>,
    config: WorkerConfig,
    name: String,
    last_sync: i64,
    tracked: TrackedTopics,
    state: StateCell,
    started: bool,
    handle: Option<LoopHandle>,
}

impl<L: LogBackend> LogWorker<L> {
    pub fn new(backend: Arc<L>, config: WorkerConfig) -> Self {
        Self {
            backend,
            config,
            name: "log".to_string(),
            last_sync: 0,
            tracked: TrackedTopics::default(),
            state: StateCell::default(),
            started: false,
            handle: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Entries stamped at or before `timestamp` (unix ms) are not delivered.
    pub fn with_last_sync(mut self, timestamp: i64) -> Self {
        self.last_sync = timestamp;
        self
    }

    pub fn last_sync(&self) -> i64 {
        self.last_sync
    }

    /// The offset table this worker advances.
    pub fn tracked(&self) -> &TrackedTopics {
        &self.tracked
    }
}

impl<L: LogBackend> Worker for LogWorker<L> {
    fn run(&mut self, topics: Vec<Topic>, sink: EventSink) -> PubSubResult<()> {
        if self.started {
            return Err(PubSubError::AlreadyStarted);
        }
        self.started = true;
        self.tracked = TrackedTopics::new(topics);

        let poll = LogLoop {
            worker: self.name.clone(),
            backend: self.backend.clone(),
            tracked: self.tracked.clone(),
            sink,
            last_sync: self.last_sync,
            read_block: self.config.read_block,
        };
        self.handle = Some(LoopHandle::spawn(
            self.name.clone(),
            self.state.clone(),
            move |shutdown| poll.run(shutdown),
        )?);

        info!(
            worker = %self.name,
            last_sync = self.last_sync,
            topics = ?self.tracked.read_request(),
            "log worker running"
        );
        Ok(())
    }

    /// The returned offsets may lag by the batch in flight if the loop was detached.
    fn stop(&mut self) -> SyncPoint {
        match self.handle.as_mut() {
            Some(handle) => handle.stop(self.config.join_timeout),
            None if !self.started => {
                self.started = true;
                self.state.set(WorkerState::Stopped);
            }
            None => {}
        }

        SyncPoint::stamped_now(self.tracked.offsets())
    }

    fn state_cell(&self) -> StateCell {
        self.state.clone()
    }
}

enum Flow {
    Continue,
    Exit,
}

struct LogLoop<L: LogBackend> {
    worker: String,
    backend: Arc<L>,
    tracked: TrackedTopics,
    sink: EventSink,
    last_sync: i64,
    read_block: Duration,
}

impl<L: LogBackend> LogLoop<L> {
    fn run(self, shutdown: Shutdown) -> LoopExit {
        loop {
            if shutdown_requested(&shutdown) {
                return Ok(());
            }

            match panic::catch_unwind(AssertUnwindSafe(|| self.iteration(&shutdown))) {
                Ok(Ok(Flow::Continue)) => {}
                Ok(Ok(Flow::Exit)) => return Ok(()),
                Ok(Err(e)) => return Err(format!("log read failed: {e}")),
                Err(panic) => {
                    let reason = panic_reason(panic.as_ref());
                    error!(
                        worker = %self.worker,
                        panic = %reason,
                        "log iteration panicked; stopping worker"
                    );
                    return Err(format!("log iteration panicked: {reason}"));
                }
            }
        }
    }

    fn iteration(&self, shutdown: &Shutdown) -> Result<Flow, BackendError> {
        let request = self.tracked.read_request();
        if request.is_empty() {
            return Ok(match shutdown.recv_timeout(self.read_block) {
                Err(RecvTimeoutError::Timeout) => Flow::Continue,
                _ => Flow::Exit,
            });
        }

        for batch in self.backend.read(&request, self.read_block)? {
            if let Flow::Exit = self.deliver(batch, shutdown) {
                return Ok(Flow::Exit);
            }
        }
        Ok(Flow::Continue)
    }

    fn deliver(&self, batch: LogBatch, shutdown: &Shutdown) -> Flow {
        let stream = batch.stream;
        let mut last: Option<String> = None;
        let mut flow = Flow::Continue;

        for entry in batch.entries {
            let id = EventId::new(stream.as_str()).with_entry_id(entry.id.as_str());
            match Event::incoming(id, entry.fields) {
                Ok(event) if event.timestamp() <= self.last_sync => {
                    debug!(
                        topic = %stream,
                        entry_id = %entry.id,
                        "skipping entry covered by checkpoint"
                    );
                }
                Ok(event) => match hand_off(&self.sink, event, shutdown) {
                    Handoff::Delivered => {}
                    Handoff::Shutdown | Handoff::Disconnected => {
                        flow = Flow::Exit;
                        break;
                    }
                },
                Err(err) => {
                    warn!(
                        topic = %stream,
                        entry_id = %entry.id,
                        error = %err,
                        "dropping unparsable log entry"
                    );
                }
            }
            last = Some(entry.id);
        }

        if let Some(offset) = last {
            self.tracked.advance(&stream, &offset);
        }
        flow
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
