use async_trait::async_trait;
use futures_util::stream::BoxStream;
use uuid::Uuid;

use crate::core::Commit;

// ============================================================================
// Event Store Interface
// ============================================================================
//
// The store is the only shared mutable resource in the model and the sole
// arbiter of conflicting writes: optimistic concurrency is enforced at
// save time through slot occupancy, never through locks held by callers.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The target slot is already occupied. Expected and transient: the
    /// repository re-runs its whole pipeline so the loser of a write race
    /// observes the winner's events before re-attempting.
    #[error("concurrency conflict: slot {sequence_slot} of sequence {sequence_id} is already occupied")]
    ConcurrencyConflict {
        sequence_id: Uuid,
        sequence_slot: u64,
    },

    /// The slot is zero or would leave a gap in the stream.
    #[error("invalid slot {sequence_slot} for sequence {sequence_id}: next free slot is {next_slot}")]
    InvalidSlot {
        sequence_id: Uuid,
        sequence_slot: u64,
        next_slot: u64,
    },

    #[error("commit must contain at least one event")]
    EmptyCommit,

    #[error("event store backend failure: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Persistence interface consumed by the repository.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Stream the commits of `sequence_id` with slot >= `from_slot`, in
    /// strictly ascending slot order.
    fn stream_sequence_commits(
        &self,
        sequence_id: Uuid,
        from_slot: u64,
    ) -> BoxStream<'_, Result<Commit, StoreError>>;

    /// Persist one commit. Must fail with [`StoreError::ConcurrencyConflict`]
    /// when the commit's slot is already occupied for its sequence.
    async fn save_commit(&self, commit: Commit) -> Result<(), StoreError>;
}
