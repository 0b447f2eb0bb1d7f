//! `unipubsub publish`: write one event and print its id.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::info;

use unipubsub_events::{Event, EventData, EventId, Payload};
use unipubsub_infra::{
    BroadcastStrategy, LogStrategy, PubSub, PubSubConfig, RedisBackend, RedisConfig,
};

use crate::cli::{Mode, PublishArgs};

pub fn run(redis: RedisConfig, mode: Mode, args: PublishArgs) -> Result<()> {
    let backend = Arc::new(RedisBackend::new(redis).context("invalid redis configuration")?);
    let event = build_event(&args);

    // Publishing never reads or writes a checkpoint.
    let mut config = PubSubConfig::from_env();
    config.checkpoint_path = None;

    let id = match mode {
        Mode::Broadcast => PubSub::new(BroadcastStrategy::new(backend), config).publish(&event),
        Mode::Log => PubSub::new(LogStrategy::new(backend), config).publish(&event),
    }
    .with_context(|| format!("failed to publish to {}", args.topic))?;

    info!(event_id = %id, action = %event.action(), "published");
    println!("{id}");
    Ok(())
}

fn build_event(args: &PublishArgs) -> Event {
    let mut id = EventId::new(args.topic.as_str());
    if let Some(entry_id) = &args.entry_id {
        id = id.with_entry_id(entry_id.as_str());
    }
    let data = EventData::outgoing(&args.action, args.ttl, payload(args.payload.as_deref()));
    Event::new(id, data)
}

fn payload(raw: Option<&str>) -> Payload {
    let Some(text) = raw else {
        return Payload::empty();
    };
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Payload::Structured(map),
        _ => Payload::Text(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn objects_are_structured_everything_else_is_text() {
        assert!(matches!(payload(Some(r#"{"name":"John"}"#)), Payload::Structured(_)));
        assert_eq!(payload(Some("[1,2]")), Payload::Text("[1,2]".into()));
        assert_eq!(payload(Some("hello")), Payload::Text("hello".into()));
        assert!(payload(None).is_empty());
    }

    #[test]
    fn explicit_entry_id_is_carried() {
        let event = build_event(&PublishArgs {
            topic: "s".into(),
            action: "orders/created".into(),
            ttl: -5,
            payload: None,
            entry_id: Some("9-0".into()),
        });

        assert_eq!(event.entry_id(), Some("9-0"));
        assert_eq!(event.action(), "/orders/created");
        assert_eq!(event.ttl(), 0);
    }
}
