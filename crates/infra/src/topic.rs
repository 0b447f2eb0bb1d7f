//! Subscription targets and the per-worker offset table.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Log offset meaning "from the very first entry".
pub const EARLIEST_OFFSET: &str = "0";

/// Log offset meaning "only entries appended after the read starts".
pub const LATEST_OFFSET: &str = "$";

/// Entry id asking the log backend to assign the id on append.
pub const AUTO_ENTRY_ID: &str = "*";

/// A named subscription target with an optional resume offset.
///
/// Broadcast backends ignore the offset. Log backends treat it as the id of the
/// last delivered entry; `None` reads only new entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    name: String,
    offset: Option<String>,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            offset: None,
        }
    }

    pub fn with_offset(mut self, offset: impl Into<String>) -> Self {
        let offset = offset.into();
        self.offset = (!offset.is_empty()).then_some(offset);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn offset(&self) -> Option<&str> {
        self.offset.as_deref()
    }

    /// Record the id of the last delivered entry.
    ///
    /// Only the worker that owns this topic calls this, after a delivered batch.
    pub fn sync_offset(&mut self, offset: impl Into<String>) {
        self.offset = Some(offset.into());
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Topic::new(value)
    }
}

impl From<String> for Topic {
    fn from(value: String) -> Self {
        Topic::new(value)
    }
}

/// Topics tracked by one log worker, shared between the worker handle and its loop.
///
/// The loop writes only through [`TrackedTopics::advance`]; the handle reads a
/// snapshot on stop.
#[derive(Debug, Clone, Default)]
pub struct TrackedTopics {
    inner: Arc<Mutex<BTreeMap<String, Topic>>>,
}

impl TrackedTopics {
    pub fn new(topics: impl IntoIterator<Item = Topic>) -> Self {
        let map = topics
            .into_iter()
            .map(|t| (t.name().to_string(), t))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(map)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map(|m| m.is_empty()).unwrap_or(true)
    }

    /// Advance a tracked topic's offset. Unknown names are ignored.
    pub fn advance(&self, name: &str, offset: &str) {
        if let Ok(mut topics) = self.inner.lock() {
            if let Some(topic) = topics.get_mut(name) {
                topic.sync_offset(offset);
            }
        }
    }

    /// `(stream, offset)` pairs for the next read; unset offsets read only new entries.
    pub fn read_request(&self) -> Vec<(String, String)> {
        self.inner
            .lock()
            .map(|topics| {
                topics
                    .values()
                    .map(|t| {
                        let offset = t.offset().unwrap_or(LATEST_OFFSET);
                        (t.name().to_string(), offset.to_string())
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Offsets of every topic that has one.
    pub fn offsets(&self) -> BTreeMap<String, String> {
        self.inner
            .lock()
            .map(|topics| {
                topics
                    .values()
                    .filter_map(|t| t.offset().map(|o| (t.name().to_string(), o.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}
