//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Timing knobs shared by every worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// How long a broadcast loop waits for a message before re-checking for shutdown.
    pub poll_interval: Duration,
    /// Block window of one log read call.
    pub read_block: Duration,
    /// Upper bound `stop` waits for a loop to exit.
    pub join_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            read_block: Duration::from_millis(1000),
            join_timeout: Duration::from_secs(2),
        }
    }
}

impl WorkerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_read_block(mut self, block: Duration) -> Self {
        self.read_block = block;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubConfig {
    /// Name for logging and worker thread names.
    pub name: String,
    pub worker: WorkerConfig,
    /// Where the checkpoint file lives, if any.
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            name: "unipubsub".to_string(),
            worker: WorkerConfig::default(),
            checkpoint_path: None,
        }
    }
}

impl PubSubConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    /// Read overrides from `UNIPUBSUB_*` environment variables on top of the defaults.
    ///
    /// - `UNIPUBSUB_NAME`
    /// - `UNIPUBSUB_CHECKPOINT`
    /// - `UNIPUBSUB_POLL_MS`
    /// - `UNIPUBSUB_READ_BLOCK_MS`
    /// - `UNIPUBSUB_JOIN_TIMEOUT_MS`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(name) = lookup("UNIPUBSUB_NAME") {
            config.name = name;
        }
        if let Some(path) = lookup("UNIPUBSUB_CHECKPOINT").filter(|p| !p.is_empty()) {
            config.checkpoint_path = Some(PathBuf::from(path));
        }
        if let Some(d) = millis(&lookup, "UNIPUBSUB_POLL_MS") {
            config.worker.poll_interval = d;
        }
        if let Some(d) = millis(&lookup, "UNIPUBSUB_READ_BLOCK_MS") {
            config.worker.read_block = d;
        }
        if let Some(d) = millis(&lookup, "UNIPUBSUB_JOIN_TIMEOUT_MS") {
            config.worker.join_timeout = d;
        }

        config
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            warn!(key, value = %raw, "ignoring non-numeric duration override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("UNIPUBSUB_NAME", "orders"),
            ("UNIPUBSUB_CHECKPOINT", "/tmp/cp.json"),
            ("UNIPUBSUB_POLL_MS", "50"),
            ("UNIPUBSUB_READ_BLOCK_MS", "oops"),
        ]
        .into_iter()
        .collect();

        let config = PubSubConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.name, "orders");
        assert_eq!(config.checkpoint_path, Some(PathBuf::from("/tmp/cp.json")));
        assert_eq!(config.worker.poll_interval, Duration::from_millis(50));
        assert_eq!(config.worker.read_block, WorkerConfig::default().read_block);
    }
}
