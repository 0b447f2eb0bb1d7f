//! Action routing: dispatch a received [`Event`] to the handler registered for its action.
//!
//! The registry is process-level wiring; the consumption engine only needs
//! [`ActionRouter::route`]. Handlers are keyed by normalized action path, so
//! `"user/created"` and `"/user/created"` address the same handler.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::debug;

use crate::data::EventData;
use crate::error::EventError;
use crate::event::Event;
use crate::normalize::normalize_action;

/// Handles every event whose action matches [`ActionHandler::action`].
pub trait ActionHandler: Send + Sync {
    fn action(&self) -> &str;

    fn handle(&self, data: &EventData) -> anyhow::Result<()>;

    /// Optionally build outgoing data for this action from a loose payload.
    ///
    /// Handlers that don't know how to construct their own events keep the
    /// default, which makes [`HandlerRegistry::build_data`] fail with
    /// [`RouteError::NoDataBuilder`].
    fn build_data(
        &self,
        payload: serde_json::Value,
        ttl: i64,
    ) -> Option<Result<EventData, EventError>> {
        let _ = (payload, ttl);
        None
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no handler registered for action {0}")]
    HandlerNotFound(String),

    #[error("a handler is already registered for action {0}")]
    HandlerRegistered(String),

    #[error("handler for action {0} cannot build event data")]
    NoDataBuilder(String),

    #[error("handler for action {action} failed: {source}")]
    Handler {
        action: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Event(#[from] EventError),

    #[error("handler registry lock poisoned")]
    Poisoned,
}

/// Anything that can dispatch an event by action.
pub trait ActionRouter: Send + Sync {
    fn route(&self, event: &Event) -> Result<(), RouteError>;
}

/// Thread-safe action → handler registry.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn ActionHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn ActionHandler>) -> Result<(), RouteError> {
        let action = normalize_action(handler.action());
        let mut handlers = self.handlers.write().map_err(|_| RouteError::Poisoned)?;
        if handlers.contains_key(&action) {
            return Err(RouteError::HandlerRegistered(action));
        }
        debug!(action = %action, "registered action handler");
        handlers.insert(action, handler);
        Ok(())
    }

    pub fn unregister(&self, action: &str) -> Result<(), RouteError> {
        let action = normalize_action(action);
        let mut handlers = self.handlers.write().map_err(|_| RouteError::Poisoned)?;
        handlers
            .remove(&action)
            .map(|_| ())
            .ok_or(RouteError::HandlerNotFound(action))
    }

    pub fn has(&self, action: &str) -> bool {
        self.handlers
            .read()
            .map(|h| h.contains_key(&normalize_action(action)))
            .unwrap_or(false)
    }

    /// Ask the handler for `action` to construct outgoing data.
    pub fn build_data(
        &self,
        action: &str,
        payload: serde_json::Value,
        ttl: i64,
    ) -> Result<EventData, RouteError> {
        let action = normalize_action(action);
        let handler = self.lookup(&action)?;
        match handler.build_data(payload, ttl) {
            Some(result) => Ok(result?),
            None => Err(RouteError::NoDataBuilder(action)),
        }
    }

    fn lookup(&self, action: &str) -> Result<Arc<dyn ActionHandler>, RouteError> {
        let handlers = self.handlers.read().map_err(|_| RouteError::Poisoned)?;
        handlers
            .get(action)
            .cloned()
            .ok_or_else(|| RouteError::HandlerNotFound(action.to_string()))
    }
}

impl ActionRouter for HandlerRegistry {
    fn route(&self, event: &Event) -> Result<(), RouteError> {
        let action = event.action();
        // The lock is released before the handler runs.
        let handler = self.lookup(action)?;
        handler
            .handle(event.data())
            .map_err(|source| RouteError::Handler {
                action: action.to_string(),
                source,
            })
    }
}
