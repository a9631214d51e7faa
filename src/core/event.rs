use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

// ============================================================================
// Event & Commit - Value Types
// ============================================================================
//
// An Event is a fact that has already happened: a type name plus a
// structured payload. A Commit is an ordered batch of events persisted
// atomically at one slot of one sequence.
//
// Both are plain immutable records; all behavior lives in the aggregate
// runtime and the repository.
//
// ============================================================================

/// A domain event: a type name plus its structured payload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Event {
    pub event_type: String,
    pub payload: Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// An ordered batch of events persisted together at one sequence slot.
///
/// `sequence_slot` is 1-based, strictly increasing and gap-free within the
/// stream identified by `sequence_id`. The slot doubles as the optimistic
/// concurrency token: a store must reject a commit whose slot is already
/// occupied.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Commit {
    pub sequence_id: Uuid,
    pub sequence_slot: u64,
    pub events: Vec<Event>,

    // Audit fields; the runtime attaches no semantics to them.
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl Commit {
    pub fn new(sequence_id: Uuid, sequence_slot: u64, events: Vec<Event>) -> Self {
        Self {
            sequence_id,
            sequence_slot,
            events,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
