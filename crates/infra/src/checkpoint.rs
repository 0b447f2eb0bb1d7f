//! Checkpoint persistence.
//!
//! The orchestrator loads a [`SyncPoint`] once at construction and stores it only
//! when asked. Stores overwrite wholesale; there is no history.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::CheckpointError;
use crate::sync_point::SyncPoint;

/// Load/store of a single checkpoint record.
pub trait CheckpointStore: Send + Sync {
    fn load(&self) -> Result<SyncPoint, CheckpointError>;

    fn store(&self, point: &SyncPoint) -> Result<(), CheckpointError>;
}

/// Pretty-printed JSON file, diffable by humans.
#[derive(Debug, Clone)]
pub struct JsonFileCheckpointStore {
    path: PathBuf,
}

impl JsonFileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for JsonFileCheckpointStore {
    fn load(&self) -> Result<SyncPoint, CheckpointError> {
        let bytes = fs::read(&self.path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn store(&self, point: &SyncPoint) -> Result<(), CheckpointError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec_pretty(point)?;
        fs::write(&self.path, json)?;
        debug!(path = %self.path.display(), offsets = point.offsets.len(), "checkpoint stored");
        Ok(())
    }
}

/// In-memory store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    point: Mutex<Option<SyncPoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_point(point: SyncPoint) -> Self {
        Self {
            point: Mutex::new(Some(point)),
        }
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn load(&self) -> Result<SyncPoint, CheckpointError> {
        self.point
            .lock()
            .map_err(|_| CheckpointError::Missing)?
            .clone()
            .ok_or(CheckpointError::Missing)
    }

    fn store(&self, point: &SyncPoint) -> Result<(), CheckpointError> {
        if let Ok(mut slot) = self.point.lock() {
            *slot = Some(point.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileCheckpointStore::new(dir.path().join("nested/checkpoint.json"));

        let mut offsets = BTreeMap::new();
        offsets.insert("stream-test".to_string(), "1700000000000-0".to_string());
        let point = SyncPoint::new(1_700_000_000_123, offsets);

        store.store(&point).unwrap();
        assert_eq!(store.load().unwrap(), point);

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("\"offsets\""));
        assert!(text.lines().count() > 1);
    }

    #[test]
    fn missing_and_malformed_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        let missing = JsonFileCheckpointStore::new(dir.path().join("nope.json"));
        assert!(matches!(missing.load(), Err(CheckpointError::Io(_))));

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let bad = JsonFileCheckpointStore::new(path);
        assert!(matches!(bad.load(), Err(CheckpointError::Format(_))));
    }

    #[test]
    fn in_memory_starts_empty() {
        let store = InMemoryCheckpointStore::new();
        assert!(matches!(store.load(), Err(CheckpointError::Missing)));

        store.store(&SyncPoint::new(9, BTreeMap::new())).unwrap();
        assert_eq!(store.load().unwrap().timestamp, 9);
    }
}
