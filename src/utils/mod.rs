pub mod retry;

pub use retry::{
    BackoffConfig, ExponentialBackoff, IsTransient, NoRetry, RetryDecision, RetryError,
    RetryStrategy,
};
