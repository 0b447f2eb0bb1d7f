//! `unipubsub listen`: consume until ctrl-c or an event limit, then checkpoint.

use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use tracing::{info, warn};

use unipubsub_events::{ActionHandler, ActionRouter, Event, EventData, HandlerRegistry};
use unipubsub_infra::{
    BroadcastStrategy, EARLIEST_OFFSET, LogStrategy, PubSub, PubSubConfig, PubSubError,
    RedisBackend, RedisConfig, Strategy, Topic,
};

use crate::cli::{ListenArgs, Mode};

pub fn run(redis: RedisConfig, mode: Mode, args: ListenArgs) -> Result<()> {
    let backend = Arc::new(RedisBackend::new(redis).context("invalid redis configuration")?);

    let mut config = PubSubConfig::from_env();
    if let Some(path) = args.checkpoint.clone() {
        config = config.with_checkpoint_path(path);
    }

    match mode {
        Mode::Broadcast => consume(PubSub::new(BroadcastStrategy::new(backend), config), args),
        Mode::Log => consume(PubSub::new(LogStrategy::new(backend), config), args),
    }
}

fn consume<S: Strategy>(pubsub: PubSub<S>, args: ListenArgs) -> Result<()> {
    pubsub.subscribe(topics(&args))?;
    let events = pubsub
        .events()
        .ok_or_else(|| anyhow!("event stream already taken"))?;

    let router = router(&args.actions)?;
    let limit = args.max_events;
    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

    let consumer = thread::Builder::new()
        .name("unipubsub-consumer".to_string())
        .spawn(move || {
            let mut seen = 0usize;
            for event in events {
                seen += 1;
                match &router {
                    Some(router) => {
                        if let Err(e) = router.route(&event) {
                            warn!(
                                topic = %event.topic(),
                                action = %event.action(),
                                error = %e,
                                "event not handled"
                            );
                        }
                    }
                    None => println!("{}", render(&event)),
                }
                if limit.is_some_and(|max| seen >= max) {
                    break;
                }
            }
            let _ = done_tx.send(());
            seen
        })
        .context("failed to spawn consumer thread")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;

    runtime.block_on(async {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                info!("interrupted");
            }
            _ = done_rx => info!("consumer finished"),
        }
        anyhow::Ok(())
    })?;

    let checkpoint = pubsub.stop()?;
    match pubsub.persist() {
        Ok(()) | Err(PubSubError::NoCheckpointStore) => {}
        Err(e) => return Err(e).context("failed to persist checkpoint"),
    }

    let seen = consumer
        .join()
        .map_err(|_| anyhow!("consumer thread panicked"))?;
    info!(events = seen, offsets = ?checkpoint.offsets, "listen finished");
    Ok(())
}

fn topics(args: &ListenArgs) -> Vec<Topic> {
    args.topics
        .iter()
        .map(|name| {
            let topic = Topic::new(name.as_str());
            if args.from_start {
                topic.with_offset(EARLIEST_OFFSET)
            } else {
                topic
            }
        })
        .collect()
}

/// Prints the events of one action.
struct EchoHandler {
    action: String,
}

impl ActionHandler for EchoHandler {
    fn action(&self) -> &str {
        &self.action
    }

    fn handle(&self, data: &EventData) -> anyhow::Result<()> {
        println!("{}", serde_json::Value::Object(data.envelope()?));
        Ok(())
    }
}

fn router(actions: &[String]) -> Result<Option<HandlerRegistry>> {
    if actions.is_empty() {
        return Ok(None);
    }

    let registry = HandlerRegistry::new();
    for action in actions {
        registry.register(Arc::new(EchoHandler {
            action: action.clone(),
        }))?;
    }
    Ok(Some(registry))
}

fn render(event: &Event) -> serde_json::Value {
    json!({
        "topic": event.topic(),
        "entry_id": event.entry_id(),
        "action": event.action(),
        "ttl": event.ttl(),
        "timestamp": event.timestamp(),
        "payload": event.data().raw_payload().to_wire_string().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(from_start: bool) -> ListenArgs {
        ListenArgs {
            topics: vec!["a".into(), "b".into()],
            checkpoint: None,
            from_start,
            max_events: None,
            actions: Vec::new(),
        }
    }

    #[test]
    fn from_start_reads_from_the_first_entry() {
        assert!(topics(&args(false)).iter().all(|t| t.offset().is_none()));
        assert!(
            topics(&args(true))
                .iter()
                .all(|t| t.offset() == Some(EARLIEST_OFFSET))
        );
    }

    #[test]
    fn router_registers_normalized_actions() {
        assert!(router(&[]).unwrap().is_none());

        let registry = router(&["orders/created".to_string()]).unwrap().unwrap();
        assert!(registry.has("/orders/created"));
        assert!(router(&["a".to_string(), "/a".to_string()]).is_err());
    }

    #[test]
    fn render_includes_entry_id() {
        let event = Event::incoming(
            unipubsub_events::EventId::new("s").with_entry_id("1-0"),
            r#"{"action":"/a","ttl":3,"payload":"hi"}"#,
        )
        .unwrap();

        let line = render(&event);
        assert_eq!(line["entry_id"], "1-0");
        assert_eq!(line["payload"], "hi");
        assert_eq!(line["ttl"], 3);
    }
}
