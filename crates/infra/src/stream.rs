//! Consumer end of the orchestrator's event channel.

use std::time::Duration;

use flume::{Receiver, RecvError, RecvTimeoutError, TryRecvError};

use unipubsub_events::Event;

/// The single fan-in stream every worker pushes onto.
///
/// The channel is unbuffered: a worker's hand-off blocks until this side
/// receives, so a slow consumer slows every loop down. `try_recv` takes an
/// event a worker is already blocked on. After
/// [`crate::PubSub::stop`] the stream yields any final in-flight event and then
/// reports disconnection.
///
/// ```ignore
/// let events = pubsub.events().expect("taken once");
/// for event in events.iter() {
///     router.route(&event)?;
/// }
/// ```
#[derive(Debug)]
pub struct EventStream {
    receiver: Receiver<Event>,
}

impl EventStream {
    pub(crate) fn new(receiver: Receiver<Event>) -> Self {
        Self { receiver }
    }

    /// Block until the next event is available.
    pub fn recv(&self) -> Result<Event, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&self) -> Result<Event, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for an event.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Event, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Blocking iterator ending once the stream is closed.
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.receiver.iter()
    }
}

impl IntoIterator for EventStream {
    type Item = Event;
    type IntoIter = flume::IntoIter<Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.receiver.into_iter()
    }
}
