use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::event::Event;

// ============================================================================
// Aggregate Runtime
// ============================================================================
//
// Key principles:
// 1. State is derived from events (never stored directly)
// 2. Replay and fresh emission share exactly one mutation path
// 3. Newly emitted events accumulate in a pending buffer that the
//    repository drains at save time
// 4. A sealed instance accepts no further emission
//
// The runtime is GENERIC over the state type: a factory joins a base-state
// constructor with a registry of event handlers and produces one fresh
// instance per repository attempt.
//
// ============================================================================

/// Errors raised by the aggregate runtime.
///
/// `UnhandledEventType` and `SealedEmission` are programmer-class: the
/// first indicates a schema mismatch between recorded history and the
/// current handler registry, the second an attempt to raise events outside
/// a repository call's consistency boundary.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("unhandled event type: {0}")]
    UnhandledEventType(String),

    #[error("aggregate is sealed and no longer accepts events (attempted to emit {0})")]
    SealedEmission(String),

    #[error("event payload conversion failed: {0}")]
    Payload(#[from] serde_json::Error),
}

type Handler<S> = Box<dyn Fn(&mut S, &Value) -> Result<(), AggregateError> + Send + Sync>;

/// Registry mapping an event type name to the handler that folds it into
/// the aggregate state. Handlers see the payload only, never commit or
/// slot metadata.
pub struct EventHandlers<S> {
    handlers: HashMap<String, Handler<S>>,
}

impl<S> EventHandlers<S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler that receives the raw JSON payload.
    pub fn on<F>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut S, &Value) -> Result<(), AggregateError> + Send + Sync + 'static,
    {
        self.handlers.insert(event_type.into(), Box::new(handler));
        self
    }

    /// Register a handler that receives the payload deserialized into `P`.
    /// A payload that fails to deserialize leaves the state untouched.
    pub fn on_typed<P, F>(self, event_type: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned,
        F: Fn(&mut S, P) + Send + Sync + 'static,
    {
        self.on(event_type, move |state, payload| {
            let typed: P = serde_json::from_value(payload.clone())?;
            handler(state, typed);
            Ok(())
        })
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    fn get(&self, event_type: &str) -> Option<&Handler<S>> {
        self.handlers.get(event_type)
    }
}

impl<S> Default for EventHandlers<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Produces fresh aggregate instances from a base-state constructor and a
/// shared handler registry.
///
/// The repository builds one instance per pipeline attempt; instances are
/// never reused across attempts, so replay always starts from base state.
pub struct AggregateFactory<S> {
    constructor: Box<dyn Fn() -> S + Send + Sync>,
    handlers: Arc<EventHandlers<S>>,
}

impl<S> AggregateFactory<S> {
    pub fn new<C>(constructor: C, handlers: EventHandlers<S>) -> Self
    where
        C: Fn() -> S + Send + Sync + 'static,
    {
        Self {
            constructor: Box::new(constructor),
            handlers: Arc::new(handlers),
        }
    }

    /// Build a fresh, unsealed instance with an empty pending buffer.
    pub fn instantiate(&self) -> AggregateRoot<S> {
        AggregateRoot {
            state: (self.constructor)(),
            sealed: false,
            pending: Vec::new(),
            handlers: Arc::clone(&self.handlers),
        }
    }
}

/// One live aggregate instance: private state, the sealed flag and the
/// buffer of events emitted during the current attempt.
pub struct AggregateRoot<S> {
    state: S,
    sealed: bool,
    pending: Vec<Event>,
    handlers: Arc<EventHandlers<S>>,
}

impl<S> AggregateRoot<S> {
    /// Read access to the derived state. Mutation only happens through
    /// registered handlers.
    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Events emitted during the current attempt, in emission order.
    pub fn pending_events(&self) -> &[Event] {
        &self.pending
    }

    /// Fold one event into the state via its registered handler.
    ///
    /// Used both for replaying persisted history and for applying freshly
    /// emitted events, so the state after replay-then-operate is identical
    /// to having applied the same events in the same order in one sitting.
    /// Fails without touching state when no handler is registered for the
    /// event type.
    pub fn process_event(&mut self, event: &Event) -> Result<(), AggregateError> {
        let handler = self
            .handlers
            .get(&event.event_type)
            .ok_or_else(|| AggregateError::UnhandledEventType(event.event_type.clone()))?;
        handler(&mut self.state, &event.payload)
    }

    /// Emit a new domain event: apply it to state through the same path as
    /// replay, then append it to the pending buffer.
    ///
    /// Fails when the instance is sealed, before any payload work; a
    /// handler failure leaves the buffer untouched.
    pub fn emit<P>(&mut self, event_type: &str, payload: &P) -> Result<(), AggregateError>
    where
        P: Serialize + ?Sized,
    {
        if self.sealed {
            return Err(AggregateError::SealedEmission(event_type.to_string()));
        }
        let payload = serde_json::to_value(payload)?;
        let event = Event::new(event_type, payload);
        self.process_event(&event)?;
        self.pending.push(event);
        Ok(())
    }

    /// Stop further emission for the remaining lifetime of the instance.
    /// Idempotent and irreversible; catches state changes that escape the
    /// repository's consistency boundary (e.g. a stray deferred callback).
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Drain the pending buffer, handing ownership of the emitted events
    /// to the caller (normally the repository, at save time).
    pub fn take_pending_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending)
    }
}

// ============================================================================
// Tests
// ============================================================================
