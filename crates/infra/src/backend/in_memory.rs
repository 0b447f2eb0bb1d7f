//! In-memory backends for tests/dev.
//!
//! - No IO
//! - [`InMemoryBroadcast`] mirrors pub/sub channel semantics: no persistence,
//!   delivery only to subscribers live at publish time
//! - [`InMemoryLog`] mirrors stream semantics: ordered entries with `ms-seq` ids,
//!   blocking reads strictly after an offset

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, mpsc};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::backend::{
    BroadcastBackend, BroadcastMessage, BroadcastSubscription, LogBackend, LogBatch, LogEntry,
};
use crate::error::BackendError;
use crate::topic::{AUTO_ENTRY_ID, LATEST_OFFSET};

#[derive(Debug)]
struct Subscriber {
    channels: HashSet<String>,
    tx: mpsc::Sender<BroadcastMessage>,
    closed: Arc<AtomicBool>,
}

/// In-memory fire-and-forget channels.
#[derive(Debug, Default)]
pub struct InMemoryBroadcast {
    subscribers: Mutex<Vec<Subscriber>>,
    subscribe_calls: AtomicUsize,
}

impl InMemoryBroadcast {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `subscribe` was called over this backend's lifetime.
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Subscriptions not yet closed or dropped.
    pub fn live_subscriptions(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subs| {
                subs.iter()
                    .filter(|s| !s.closed.load(Ordering::Acquire))
                    .count()
            })
            .unwrap_or(0)
    }
}

impl BroadcastBackend for InMemoryBroadcast {
    fn publish(&self, channel: &str, message: &str) -> Result<u64, BackendError> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| BackendError::Connection("in-memory broadcast poisoned".into()))?;

        let mut delivered = 0u64;

        // Drop closed and dead subscribers while publishing.
        subs.retain(|sub| {
            if sub.closed.load(Ordering::Acquire) {
                return false;
            }
            if !sub.channels.contains(channel) {
                return true;
            }
            let msg = BroadcastMessage {
                channel: channel.to_string(),
                payload: message.to_string(),
            };
            match sub.tx.send(msg) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });

        Ok(delivered)
    }

    fn subscribe(&self, channels: &[String]) -> Result<BroadcastSubscription, BackendError> {
        let (tx, rx) = mpsc::channel();
        let closed = Arc::new(AtomicBool::new(false));

        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| BackendError::Connection("in-memory broadcast poisoned".into()))?;
        subs.push(Subscriber {
            channels: channels.iter().cloned().collect(),
            tx,
            closed: closed.clone(),
        });
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        Ok(BroadcastSubscription::new(rx, closed))
    }
}

/// Log entry id: `<millis>-<sequence>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
struct EntryId {
    ms: u64,
    seq: u64,
}

impl FromStr for EntryId {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BackendError::Command(format!("invalid stream id: {s}"));
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Debug, Default)]
struct LogState {
    streams: HashMap<String, Vec<(EntryId, Map<String, Value>)>>,
}

impl LogState {
    fn last_id(&self, stream: &str) -> EntryId {
        self.streams
            .get(stream)
            .and_then(|entries| entries.last())
            .map(|(id, _)| *id)
            .unwrap_or_default()
    }

    fn entries_after(&self, stream: &str, after: EntryId) -> Vec<LogEntry> {
        self.streams
            .get(stream)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(id, _)| *id > after)
                    .map(|(id, fields)| LogEntry {
                        id: id.to_string(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// In-memory ordered logs.
///
/// By default streams are created on first append. [`InMemoryLog::strict`] refuses
/// to append to unknown streams and reports no entry id instead, the way
/// `XADD NOMKSTREAM` does.
#[derive(Debug)]
pub struct InMemoryLog {
    state: Mutex<LogState>,
    appended: Condvar,
    auto_create: bool,
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self {
            state: Mutex::new(LogState::default()),
            appended: Condvar::new(),
            auto_create: true,
        }
    }
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self {
            auto_create: false,
            ..Self::default()
        }
    }

    pub fn create_stream(&self, stream: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.streams.entry(stream.to_string()).or_default();
        }
    }

    pub fn len(&self, stream: &str) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.streams.get(stream).map(Vec::len))
            .unwrap_or(0)
    }

    fn poisoned() -> BackendError {
        BackendError::Connection("in-memory log poisoned".into())
    }
}

impl LogBackend for InMemoryLog {
    fn append(
        &self,
        stream: &str,
        entry_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<String, BackendError> {
        let mut state = self.state.lock().map_err(|_| Self::poisoned())?;

        if !self.auto_create && !state.streams.contains_key(stream) {
            return Ok(String::new());
        }

        let last = state.last_id(stream);
        let id = if entry_id == AUTO_ENTRY_ID {
            let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
            if now > last.ms {
                EntryId { ms: now, seq: 0 }
            } else {
                EntryId {
                    ms: last.ms,
                    seq: last.seq + 1,
                }
            }
        } else {
            let id: EntryId = entry_id.parse()?;
            if id <= last {
                return Err(BackendError::Command(format!(
                    "entry id {id} is equal or smaller than the stream top item {last}"
                )));
            }
            id
        };

        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .push((id, fields.clone()));
        drop(state);

        self.appended.notify_all();
        Ok(id.to_string())
    }

    fn read(
        &self,
        request: &[(String, String)],
        block: Duration,
    ) -> Result<Vec<LogBatch>, BackendError> {
        let deadline = Instant::now() + block;
        let mut state = self.state.lock().map_err(|_| Self::poisoned())?;

        // `$` resolves once, at call time.
        let mut positions = Vec::with_capacity(request.len());
        for (stream, offset) in request {
            let after = if offset == LATEST_OFFSET {
                state.last_id(stream)
            } else {
                offset.parse()?
            };
            positions.push((stream.as_str(), after));
        }

        loop {
            let batches: Vec<LogBatch> = positions
                .iter()
                .filter_map(|(stream, after)| {
                    let entries = state.entries_after(stream, *after);
                    (!entries.is_empty()).then(|| LogBatch {
                        stream: stream.to_string(),
                        entries,
                    })
                })
                .collect();

            if !batches.is_empty() {
                return Ok(batches);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let (next, _) = self
                .appended
                .wait_timeout(state, deadline - now)
                .map_err(|_| Self::poisoned())?;
            state = next;
        }
    }
}
