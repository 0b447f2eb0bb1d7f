//! Consumption engine.
//!
//! A [`Worker`] owns one background receive loop that turns raw backend messages
//! into [`Event`]s and hands them to the orchestrator's event channel.
//!
//! Lifecycle: `Idle -> Running -> Stopping -> Stopped`, or `Failed` when the loop
//! ended because of a backend error or a panic. Workers are single-use.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender, TryRecvError};
use tracing::warn;

use unipubsub_events::Event;

use crate::error::{PubSubError, PubSubResult};
use crate::sync_point::SyncPoint;
use crate::topic::Topic;

pub mod broadcast;
pub mod log;

pub use broadcast::BroadcastWorker;
pub use log::LogWorker;

/// Sending end of the orchestrator's unbuffered event channel.
pub type EventSink = Sender<Event>;

/// Disconnects once the loop's handle requests shutdown.
pub(crate) type Shutdown = Receiver<()>;

/// How often `stop` re-checks whether the loop thread exited.
const JOIN_TICK: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Stopping,
    Stopped,
    Failed(String),
}

impl WorkerState {
    pub fn is_live(&self) -> bool {
        matches!(self, WorkerState::Running)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Idle => f.write_str("idle"),
            WorkerState::Running => f.write_str("running"),
            WorkerState::Stopping => f.write_str("stopping"),
            WorkerState::Stopped => f.write_str("stopped"),
            WorkerState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// One backend consumption loop.
pub trait Worker: Send {
    /// Start consuming `topics`, pushing parsed events into `sink`.
    ///
    /// Fails with [`PubSubError::AlreadyStarted`] on a worker that already ran.
    fn run(&mut self, topics: Vec<Topic>, sink: EventSink) -> PubSubResult<()>;

    /// Stop the loop and return this worker's final checkpoint. Idempotent.
    fn stop(&mut self) -> SyncPoint;

    /// Shared handle onto this worker's state, readable without the worker.
    fn state_cell(&self) -> StateCell;

    fn state(&self) -> WorkerState {
        self.state_cell().get()
    }
}

/// Shared, lock-guarded worker state.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<Mutex<WorkerState>>);

impl Default for StateCell {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(WorkerState::Idle)))
    }
}

impl StateCell {
    pub fn get(&self) -> WorkerState {
        self.0
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| WorkerState::Failed("state lock poisoned".into()))
    }

    pub(crate) fn set(&self, state: WorkerState) {
        if let Ok(mut s) = self.0.lock() {
            *s = state;
        }
    }

    /// Set `to` only while the current state is `from`.
    fn transition(&self, from: &WorkerState, to: WorkerState) {
        if let Ok(mut s) = self.0.lock() {
            if *s == *from {
                *s = to;
            }
        }
    }
}

/// Why a loop returned.
pub(crate) type LoopExit = Result<(), String>;

/// Handle to control and join a background loop thread.
#[derive(Debug)]
pub(crate) struct LoopHandle {
    name: String,
    /// Dropped to signal shutdown.
    shutdown: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
    state: StateCell,
}

impl LoopHandle {
    /// Spawn `body` on a named thread. The state is `Running` once this returns.
    pub(crate) fn spawn<F>(name: String, state: StateCell, body: F) -> PubSubResult<Self>
    where
        F: FnOnce(Shutdown) -> LoopExit + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = flume::bounded::<()>(0);
        state.set(WorkerState::Running);

        let loop_state = state.clone();
        let loop_name = name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || match body(shutdown_rx) {
                Ok(()) => loop_state.set(WorkerState::Stopped),
                Err(reason) => {
                    warn!(worker = %loop_name, error = %reason, "worker loop failed");
                    loop_state.set(WorkerState::Failed(reason));
                }
            })
            .map_err(|e| {
                state.set(WorkerState::Failed(e.to_string()));
                PubSubError::Spawn(e)
            })?;

        Ok(Self {
            name,
            shutdown: Some(shutdown_tx),
            join: Some(join),
            state,
        })
    }

    /// Request shutdown and wait up to `timeout` for the loop to exit.
    ///
    /// A loop that does not exit in time is detached and stays `Stopping`.
    pub(crate) fn stop(&mut self, timeout: Duration) {
        let Some(join) = self.join.take() else {
            return;
        };

        self.state
            .transition(&WorkerState::Running, WorkerState::Stopping);
        drop(self.shutdown.take());

        let deadline = Instant::now() + timeout;
        while !join.is_finished() {
            if Instant::now() >= deadline {
                warn!(worker = %self.name, ?timeout, "worker loop did not exit in time; detaching");
                return;
            }
            thread::sleep(JOIN_TICK);
        }

        if join.join().is_err() {
            self.state.set(WorkerState::Failed("worker loop panicked".into()));
        }
    }
}

pub(crate) fn shutdown_requested(shutdown: &Shutdown) -> bool {
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}

/// Outcome of handing one event to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handoff {
    Delivered,
    /// Shutdown was requested before a consumer took the event.
    Shutdown,
    /// The consuming end is gone.
    Disconnected,
}

/// Block until a consumer takes `event` or shutdown is requested, whichever
/// comes first.
pub(crate) fn hand_off(sink: &EventSink, event: Event, shutdown: &Shutdown) -> Handoff {
    flume::Selector::new()
        .send(sink, event, |sent| match sent {
            Ok(()) => Handoff::Delivered,
            Err(_) => Handoff::Disconnected,
        })
        .recv(shutdown, |_| Handoff::Shutdown)
        .wait()
}
