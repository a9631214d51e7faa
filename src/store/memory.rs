use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, StreamExt};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::event_store::{EventStore, StoreError};
use crate::core::Commit;

// ============================================================================
// In-Memory Event Store
// ============================================================================
//
// Backs unit tests and local development without a database. Commits are
// held per sequence in append order, so the vector index encodes the slot:
// slot N lives at index N-1 and the next free slot is always len + 1.
//
// ============================================================================

pub struct InMemoryEventStore {
    sequences: Mutex<HashMap<Uuid, Vec<Commit>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            sequences: Mutex::new(HashMap::new()),
        }
    }

    /// Number of commits persisted for `sequence_id`.
    pub async fn commit_count(&self, sequence_id: Uuid) -> usize {
        self.sequences
            .lock()
            .await
            .get(&sequence_id)
            .map_or(0, Vec::len)
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    fn stream_sequence_commits(
        &self,
        sequence_id: Uuid,
        from_slot: u64,
    ) -> BoxStream<'_, Result<Commit, StoreError>> {
        async move {
            let sequences = self.sequences.lock().await;
            let commits: Vec<Commit> = sequences
                .get(&sequence_id)
                .map(|commits| {
                    commits
                        .iter()
                        .filter(|commit| commit.sequence_slot >= from_slot)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            stream::iter(commits.into_iter().map(Ok::<_, StoreError>))
        }
        .flatten_stream()
        .boxed()
    }

    async fn save_commit(&self, commit: Commit) -> Result<(), StoreError> {
        if commit.events.is_empty() {
            return Err(StoreError::EmptyCommit);
        }

        let mut sequences = self.sequences.lock().await;
        let persisted = sequences.entry(commit.sequence_id).or_default();
        let next_slot = persisted.len() as u64 + 1;

        if commit.sequence_slot >= 1 && commit.sequence_slot < next_slot {
            return Err(StoreError::ConcurrencyConflict {
                sequence_id: commit.sequence_id,
                sequence_slot: commit.sequence_slot,
            });
        }
        if commit.sequence_slot != next_slot {
            return Err(StoreError::InvalidSlot {
                sequence_id: commit.sequence_id,
                sequence_slot: commit.sequence_slot,
                next_slot,
            });
        }

        tracing::debug!(
            sequence_id = %commit.sequence_id,
            sequence_slot = commit.sequence_slot,
            event_count = commit.events.len(),
            "persisted commit"
        );
        persisted.push(commit);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
