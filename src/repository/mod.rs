use std::sync::Arc;

use futures_util::TryStreamExt;
use uuid::Uuid;

use crate::core::{AggregateError, AggregateFactory, AggregateRoot, Commit};
use crate::store::{EventStore, StoreError};
use crate::utils::retry::{IsTransient, NoRetry, RetryDecision, RetryError, RetryStrategy};

// ============================================================================
// Repository - Pipeline Orchestration
// ============================================================================
//
// Executes one logical operation against one aggregate under optimistic
// concurrency:
//
//   load -> operate -> seal -> save -> (retry)
//
// Each attempt works on a fresh envelope and a fresh instance; a failed
// attempt is discarded wholesale and a retry replays history again, so the
// loser of a write race observes the winner's events before re-attempting.
// No locks are held at any point. The store's slot check at save time is
// the only synchronization.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The caller-supplied operation rejected the request at the domain
    /// level. Nothing was persisted.
    #[error("operation rejected: {0}")]
    Operation(#[source] anyhow::Error),

    #[error(transparent)]
    Retry(#[from] RetryError),
}

impl IsTransient for RepositoryError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            RepositoryError::Store(StoreError::ConcurrencyConflict { .. })
        )
    }
}

/// Working record for one pipeline attempt: the instance being built up,
/// the sequence it belongs to and the next slot to write. A retry builds
/// an entirely new envelope, so partially applied state from a failed
/// attempt never leaks into the next one.
struct OperationEnvelope<S> {
    instance: AggregateRoot<S>,
    sequence_id: Uuid,
    next_slot: u64,
}

pub struct Repository<ES> {
    store: Arc<ES>,
}

impl<ES: EventStore> Repository<ES> {
    pub fn new(store: Arc<ES>) -> Self {
        Self { store }
    }

    /// Run `operation` against the aggregate identified by `sequence_id`,
    /// failing on the first error.
    pub async fn execute<S, R, F>(
        &self,
        factory: &AggregateFactory<S>,
        sequence_id: Uuid,
        operation: F,
    ) -> Result<R, RepositoryError>
    where
        F: FnMut(&mut AggregateRoot<S>) -> Result<R, anyhow::Error>,
    {
        self.execute_with_retry(factory, sequence_id, operation, NoRetry)
            .await
    }

    /// Run `operation` with a caller-chosen retry policy.
    ///
    /// The operation is `FnMut` because every retry re-runs it against a
    /// freshly rehydrated instance. Its `Ok` value from the winning
    /// attempt is returned verbatim, never the instance itself.
    pub async fn execute_with_retry<S, R, F, RS>(
        &self,
        factory: &AggregateFactory<S>,
        sequence_id: Uuid,
        mut operation: F,
        mut strategy: RS,
    ) -> Result<R, RepositoryError>
    where
        F: FnMut(&mut AggregateRoot<S>) -> Result<R, anyhow::Error>,
        RS: RetryStrategy<RepositoryError>,
    {
        loop {
            let error = match self.single_pass(factory, sequence_id, &mut operation).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            match strategy.decide(&error) {
                RetryDecision::RetryAfter(delay) => {
                    tracing::warn!(
                        sequence_id = %sequence_id,
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, re-running pipeline after delay"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Propagate => return Err(error),
                RetryDecision::Fail(terminal) => return Err(RepositoryError::Retry(terminal)),
            }
        }
    }

    /// One full attempt. Any error aborts the attempt wholesale; the
    /// retry loop decides whether a fresh one is made.
    async fn single_pass<S, R, F>(
        &self,
        factory: &AggregateFactory<S>,
        sequence_id: Uuid,
        operation: &mut F,
    ) -> Result<R, RepositoryError>
    where
        F: FnMut(&mut AggregateRoot<S>) -> Result<R, anyhow::Error>,
    {
        let mut envelope = self.load(factory, sequence_id).await?;

        let value = operation(&mut envelope.instance).map_err(RepositoryError::Operation)?;

        // The operation's final state is captured; emission past this
        // point is a consistency-boundary violation.
        envelope.instance.seal();

        self.save(envelope).await?;
        Ok(value)
    }

    /// Rehydrate a fresh instance by replaying persisted history from
    /// slot 1. Replay goes through `process_event`, never `emit`, so it
    /// cannot repopulate the pending buffer or count as a new change.
    async fn load<S>(
        &self,
        factory: &AggregateFactory<S>,
        sequence_id: Uuid,
    ) -> Result<OperationEnvelope<S>, RepositoryError> {
        let mut envelope = OperationEnvelope {
            instance: factory.instantiate(),
            sequence_id,
            next_slot: 1,
        };

        let mut commits = self
            .store
            .stream_sequence_commits(sequence_id, envelope.next_slot);
        while let Some(commit) = commits.try_next().await? {
            for event in &commit.events {
                envelope.instance.process_event(event)?;
            }
            envelope.next_slot += 1;
        }

        tracing::debug!(
            sequence_id = %sequence_id,
            replayed_commits = envelope.next_slot - 1,
            "rehydrated aggregate"
        );
        Ok(envelope)
    }

    /// Persist the attempt's emitted events, if any. An operation that
    /// read but changed nothing produces no commit at all.
    async fn save<S>(&self, mut envelope: OperationEnvelope<S>) -> Result<(), RepositoryError> {
        let events = envelope.instance.take_pending_events();
        if events.is_empty() {
            tracing::debug!(
                sequence_id = %envelope.sequence_id,
                "no events emitted, skipping save"
            );
            return Ok(());
        }

        let event_count = events.len();
        let commit = Commit::new(envelope.sequence_id, envelope.next_slot, events);
        self.store.save_commit(commit).await?;

        tracing::info!(
            sequence_id = %envelope.sequence_id,
            sequence_slot = envelope.next_slot,
            event_count,
            "✅ appended commit"
        );
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Event, EventHandlers};
    use crate::store::InMemoryEventStore;
    use crate::utils::retry::{BackoffConfig, ExponentialBackoff};
    use futures_util::stream::BoxStream;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Default, Clone, Debug, PartialEq)]
    struct Tally {
        total: i64,
        applied: Vec<i64>,
    }

    #[derive(Deserialize)]
    struct Added {
        amount: i64,
    }

    fn tally_factory() -> AggregateFactory<Tally> {
        let handlers =
            EventHandlers::new().on_typed("Added", |state: &mut Tally, event: Added| {
                state.total += event.amount;
                state.applied.push(event.amount);
            });
        AggregateFactory::new(Tally::default, handlers)
    }

    fn added(amount: i64) -> Event {
        Event::new("Added", json!({ "amount": amount }))
    }

    #[tokio::test]
    async fn test_read_only_operation_saves_nothing() {
        let store = Arc::new(InMemoryEventStore::new());
        let repository = Repository::new(store.clone());
        let factory = tally_factory();
        let sequence_id = Uuid::new_v4();

        let total = repository
            .execute(&factory, sequence_id, |tally| Ok(tally.state().total))
            .await
            .unwrap();

        assert_eq!(total, 0);
        assert_eq!(store.commit_count(sequence_id).await, 0);
    }

    #[tokio::test]
    async fn test_emitted_events_land_in_one_commit_after_history() {
        let store = Arc::new(InMemoryEventStore::new());
        let sequence_id = Uuid::new_v4();
        store
            .save_commit(Commit::new(sequence_id, 1, vec![added(1)]))
            .await
            .unwrap();
        store
            .save_commit(Commit::new(sequence_id, 2, vec![added(2)]))
            .await
            .unwrap();

        let repository = Repository::new(store.clone());
        let factory = tally_factory();

        let total = repository
            .execute(&factory, sequence_id, |tally| {
                tally.emit("Added", &json!({ "amount": 10 }))?;
                tally.emit("Added", &json!({ "amount": 20 }))?;
                Ok(tally.state().total)
            })
            .await
            .unwrap();

        assert_eq!(total, 33);
        assert_eq!(store.commit_count(sequence_id).await, 3);

        let commits: Vec<Commit> = store
            .stream_sequence_commits(sequence_id, 3)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].sequence_slot, 3);
        let amounts: Vec<i64> = commits[0]
            .events
            .iter()
            .map(|event| event.payload["amount"].as_i64().unwrap())
            .collect();
        assert_eq!(amounts, [10, 20]);
    }

    #[tokio::test]
    async fn test_replay_matches_direct_application() {
        let store = Arc::new(InMemoryEventStore::new());
        let sequence_id = Uuid::new_v4();
        store
            .save_commit(Commit::new(sequence_id, 1, vec![added(1), added(2)]))
            .await
            .unwrap();
        store
            .save_commit(Commit::new(sequence_id, 2, vec![added(3)]))
            .await
            .unwrap();
        store
            .save_commit(Commit::new(sequence_id, 3, vec![added(4), added(5)]))
            .await
            .unwrap();

        let repository = Repository::new(store.clone());
        let factory = tally_factory();

        let replayed = repository
            .execute(&factory, sequence_id, |tally| Ok(tally.state().clone()))
            .await
            .unwrap();

        let mut direct = factory.instantiate();
        for amount in 1..=5 {
            direct.process_event(&added(amount)).unwrap();
        }
        assert_eq!(&replayed, direct.state());

        // The next emission lands at the slot right after the history.
        repository
            .execute(&factory, sequence_id, |tally| {
                tally.emit("Added", &json!({ "amount": 6 }))?;
                Ok(())
            })
            .await
            .unwrap();
        let commits: Vec<Commit> = store
            .stream_sequence_commits(sequence_id, 4)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].sequence_slot, 4);
    }

    #[tokio::test]
    async fn test_domain_rejection_propagates_and_saves_nothing() {
        let store = Arc::new(InMemoryEventStore::new());
        let repository = Repository::new(store.clone());
        let factory = tally_factory();
        let sequence_id = Uuid::new_v4();

        let error = repository
            .execute(&factory, sequence_id, |_tally| {
                Err::<(), _>(anyhow::anyhow!("amount must be positive"))
            })
            .await
            .unwrap_err();

        assert!(matches!(error, RepositoryError::Operation(_)));
        assert_eq!(store.commit_count(sequence_id).await, 0);
    }

    #[tokio::test]
    async fn test_unhandled_history_event_is_not_retried() {
        let store = Arc::new(InMemoryEventStore::new());
        let sequence_id = Uuid::new_v4();
        store
            .save_commit(Commit::new(
                sequence_id,
                1,
                vec![Event::new("Vanished", json!({}))],
            ))
            .await
            .unwrap();

        let repository = Repository::new(store.clone());
        let factory = tally_factory();
        let runs = AtomicU32::new(0);

        // An unbounded backoff must still give up immediately: the error
        // is permanent, not a write race.
        let error = repository
            .execute_with_retry(
                &factory,
                sequence_id,
                |tally| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(tally.state().total)
                },
                ExponentialBackoff::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            RepositoryError::Aggregate(AggregateError::UnhandledEventType(_))
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    /// Store double that reports a conflict for the first N saves, then
    /// delegates to a real in-memory store.
    struct ConflictingStore {
        inner: InMemoryEventStore,
        conflicts_left: AtomicU32,
    }

    impl ConflictingStore {
        fn new(conflicts: u32) -> Self {
            Self {
                inner: InMemoryEventStore::new(),
                conflicts_left: AtomicU32::new(conflicts),
            }
        }
    }

    #[async_trait::async_trait]
    impl EventStore for ConflictingStore {
        fn stream_sequence_commits(
            &self,
            sequence_id: Uuid,
            from_slot: u64,
        ) -> BoxStream<'_, Result<Commit, StoreError>> {
            self.inner.stream_sequence_commits(sequence_id, from_slot)
        }

        async fn save_commit(&self, commit: Commit) -> Result<(), StoreError> {
            if self.conflicts_left.load(Ordering::SeqCst) > 0 {
                self.conflicts_left.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::ConcurrencyConflict {
                    sequence_id: commit.sequence_id,
                    sequence_slot: commit.sequence_slot,
                });
            }
            self.inner.save_commit(commit).await
        }
    }

    #[tokio::test]
    async fn test_conflict_triggers_full_pipeline_retry() {
        let store = Arc::new(ConflictingStore::new(1));
        let repository = Repository::new(store.clone());
        let factory = tally_factory();
        let sequence_id = Uuid::new_v4();
        let runs = AtomicU32::new(0);

        let strategy = ExponentialBackoff::new(BackoffConfig {
            initial_delay: Duration::from_millis(1),
            maximum_retries: Some(3),
            ..BackoffConfig::default()
        });

        let total = repository
            .execute_with_retry(
                &factory,
                sequence_id,
                |tally| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tally.emit("Added", &json!({ "amount": 7 }))?;
                    Ok(tally.state().total)
                },
                strategy,
            )
            .await
            .unwrap();

        assert_eq!(total, 7);
        // The whole pipeline ran twice: the losing attempt and the winner.
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(store.inner.commit_count(sequence_id).await, 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_surfaces_limit_error() {
        let store = Arc::new(ConflictingStore::new(u32::MAX));
        let repository = Repository::new(store.clone());
        let factory = tally_factory();
        let sequence_id = Uuid::new_v4();
        let runs = AtomicU32::new(0);

        let strategy = ExponentialBackoff::new(BackoffConfig {
            initial_delay: Duration::from_millis(1),
            maximum_retries: Some(2),
            ..BackoffConfig::default()
        });

        let error = repository
            .execute_with_retry(
                &factory,
                sequence_id,
                |tally| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tally.emit("Added", &json!({ "amount": 1 }))?;
                    Ok(())
                },
                strategy,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            RepositoryError::Retry(RetryError::LimitReached { retries: 2, .. })
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_propagates_conflict_unchanged() {
        let store = Arc::new(ConflictingStore::new(u32::MAX));
        let repository = Repository::new(store.clone());
        let factory = tally_factory();
        let sequence_id = Uuid::new_v4();

        let error = repository
            .execute(&factory, sequence_id, |tally| {
                tally.emit("Added", &json!({ "amount": 1 }))?;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            RepositoryError::Store(StoreError::ConcurrencyConflict { .. })
        ));
    }
}
