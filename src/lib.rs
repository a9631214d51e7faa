// ============================================================================
// Event-Sourced Aggregate Runtime
// ============================================================================
//
// Runtime for aggregates whose state is derived entirely by replaying an
// ordered sequence of domain events, and whose state changes are only ever
// expressed as newly emitted events.
//
// Layering:
// - core:       Event/Commit value types + the aggregate runtime
//               (handler registry, sealing, pending-event buffer)
// - store:      the EventStore persistence boundary + an in-memory store
// - repository: load -> operate -> seal -> save -> retry orchestration
// - utils:      pluggable retry strategies
//
// Each aggregate is its own consistency boundary. Concurrency control is
// optimistic: the store rejects a commit whose slot is already occupied,
// and the repository re-runs its whole pipeline on a conflict.
//
// ============================================================================

pub mod core;
pub mod repository;
pub mod store;
pub mod utils;

pub use crate::core::{
    AggregateError, AggregateFactory, AggregateRoot, Commit, Event, EventHandlers,
};
pub use crate::repository::{Repository, RepositoryError};
pub use crate::store::{EventStore, InMemoryEventStore, StoreError};
pub use crate::utils::retry::{
    BackoffConfig, ExponentialBackoff, IsTransient, NoRetry, RetryDecision, RetryError,
    RetryStrategy,
};
