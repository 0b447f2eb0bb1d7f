//! Redis backends (optional, `redis` feature).
//!
//! - Broadcast: `PUBLISH` / `SUBSCRIBE`. Not durable; subscribers offline at
//!   publish time miss the message.
//! - Log: `XADD` / `XREAD`. Entries persist and are addressed by stream id.
//!
//! Connections are opened per call, except for a live subscription, which owns
//! one connection on a background reader thread until it is closed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use redis::Commands;
use redis::streams::StreamReadReply;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::backend::{
    BroadcastBackend, BroadcastMessage, BroadcastSubscription, LogBackend, LogBatch, LogEntry,
};
use crate::error::BackendError;

/// Default Redis URL when `UNIPUBSUB_REDIS_URL` is unset.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub url: String,
    /// How long `subscribe` waits for the server to confirm the subscription.
    pub confirm_timeout: Duration,
    /// Read timeout of the subscription socket; bounds how long closing takes.
    pub read_tick: Duration,
    /// When false, appends use `NOMKSTREAM` and unknown streams yield no entry id.
    pub create_streams: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
            confirm_timeout: Duration::from_secs(5),
            read_tick: Duration::from_millis(250),
            create_streams: true,
        }
    }
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn with_create_streams(mut self, create: bool) -> Self {
        self.create_streams = create;
        self
    }

    /// `UNIPUBSUB_REDIS_URL`, `UNIPUBSUB_REDIS_CONFIRM_MS`, `UNIPUBSUB_REDIS_CREATE_STREAMS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("UNIPUBSUB_REDIS_URL") {
            if !url.is_empty() {
                config.url = url;
            }
        }
        if let Ok(raw) = std::env::var("UNIPUBSUB_REDIS_CONFIRM_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.confirm_timeout = Duration::from_millis(ms),
                Err(_) => warn!(value = %raw, "ignoring non-numeric UNIPUBSUB_REDIS_CONFIRM_MS"),
            }
        }
        if let Ok(raw) = std::env::var("UNIPUBSUB_REDIS_CREATE_STREAMS") {
            config.create_streams = !matches!(raw.trim(), "0" | "false" | "no");
        }

        config
    }
}

/// Redis client serving both broadcast and log semantics.
#[derive(Debug, Clone)]
pub struct RedisBackend {
    client: redis::Client,
    config: RedisConfig,
}

impl RedisBackend {
    pub fn new(config: RedisConfig) -> Result<Self, BackendError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| BackendError::Connection(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    fn connection(&self) -> Result<redis::Connection, BackendError> {
        self.client
            .get_connection()
            .map_err(|e| BackendError::Connection(e.to_string()))
    }
}

impl BroadcastBackend for RedisBackend {
    fn publish(&self, channel: &str, message: &str) -> Result<u64, BackendError> {
        let mut conn = self.connection()?;
        conn.publish(channel, message)
            .map_err(|e| BackendError::Command(format!("PUBLISH failed: {e}")))
    }

    fn subscribe(&self, channels: &[String]) -> Result<BroadcastSubscription, BackendError> {
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), BackendError>>(1);
        let closed = Arc::new(AtomicBool::new(false));

        let client = self.client.clone();
        let channels = channels.to_vec();
        let read_tick = self.config.read_tick;
        let loop_closed = closed.clone();

        // The reader thread owns the connection; the subscription only holds the
        // receiving end and the close flag.
        thread::Builder::new()
            .name("unipubsub-redis-sub".to_string())
            .spawn(move || {
                let mut conn = match client.get_connection() {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = ready_tx.send(Err(BackendError::Connection(e.to_string())));
                        return;
                    }
                };

                let mut pubsub = conn.as_pubsub();
                if let Err(e) = pubsub.subscribe(&channels) {
                    let _ = ready_tx.send(Err(BackendError::Command(format!(
                        "SUBSCRIBE failed: {e}"
                    ))));
                    return;
                }
                if let Err(e) = pubsub.set_read_timeout(Some(read_tick)) {
                    let _ = ready_tx.send(Err(BackendError::Connection(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while !loop_closed.load(Ordering::Acquire) {
                    let msg = match pubsub.get_message() {
                        Ok(m) => m,
                        Err(e) if e.is_timeout() => continue,
                        Err(e) => {
                            warn!(error = %e, "redis subscription ended");
                            return;
                        }
                    };

                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            debug!(error = %e, "skipping non-string pub/sub payload");
                            continue;
                        }
                    };

                    let forwarded = BroadcastMessage {
                        channel: msg.get_channel_name().to_string(),
                        payload,
                    };
                    if tx.send(forwarded).is_err() {
                        return;
                    }
                }

                let _ = pubsub.unsubscribe(&channels);
            })
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        match ready_rx.recv_timeout(self.config.confirm_timeout) {
            Ok(Ok(())) => Ok(BroadcastSubscription::new(rx, closed)),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                closed.store(true, Ordering::Release);
                Err(BackendError::NotConfirmed)
            }
        }
    }
}

impl LogBackend for RedisBackend {
    fn append(
        &self,
        stream: &str,
        entry_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<String, BackendError> {
        let mut conn = self.connection()?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if !self.config.create_streams {
            cmd.arg("NOMKSTREAM");
        }
        cmd.arg(entry_id);
        for (key, value) in fields {
            cmd.arg(key).arg(field_value(value));
        }

        // Nil reply: NOMKSTREAM against a missing stream.
        let id: Option<String> = cmd
            .query(&mut conn)
            .map_err(|e| BackendError::Command(format!("XADD failed: {e}")))?;

        Ok(id.unwrap_or_default())
    }

    fn read(
        &self,
        request: &[(String, String)],
        block: Duration,
    ) -> Result<Vec<LogBatch>, BackendError> {
        if request.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection()?;

        let mut cmd = redis::cmd("XREAD");
        // BLOCK 0 means forever in Redis; a zero window is a plain poll here.
        let block_ms = u64::try_from(block.as_millis()).unwrap_or(u64::MAX);
        if block_ms > 0 {
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS");
        for (stream, _) in request {
            cmd.arg(stream);
        }
        for (_, offset) in request {
            cmd.arg(offset);
        }

        let reply: Option<StreamReadReply> = cmd
            .query(&mut conn)
            .map_err(|e| BackendError::Command(format!("XREAD failed: {e}")))?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        Ok(reply
            .keys
            .into_iter()
            .map(|key| LogBatch {
                stream: key.key,
                entries: key
                    .ids
                    .into_iter()
                    .map(|entry| LogEntry {
                        id: entry.id,
                        fields: entry
                            .map
                            .iter()
                            .filter_map(|(k, v)| {
                                redis::from_redis_value::<String>(v)
                                    .ok()
                                    .map(|s| (k.clone(), Value::String(s)))
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect())
    }
}

/// Stream field values are strings on the wire.
fn field_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_values_flatten_to_strings() {
        assert_eq!(field_value(&Value::String("/a".into())), "/a");
        assert_eq!(field_value(&serde_json::json!(30)), "30");
        assert_eq!(field_value(&serde_json::json!(true)), "true");
    }

    #[test]
    fn default_config_points_at_localhost() {
        let config = RedisConfig::default();
        assert_eq!(config.url, DEFAULT_REDIS_URL);
        assert!(config.create_streams);
    }

    #[test]
    fn invalid_url_is_a_connection_error() {
        let err = RedisBackend::new(RedisConfig::new("not a url")).unwrap_err();
        assert!(matches!(err, BackendError::Connection(_)));
    }
}
