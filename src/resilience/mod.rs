//! Failure containment: breakers, backoff, retry planning and result caching.

mod backoff;
mod breaker;
mod cache;
mod retry;

pub use backoff::Backoff;
pub use breaker::{
    Admission, BreakerConfig, BreakerKey, CircuitBreaker, CircuitState, FailureOutcome,
};
pub use cache::{CacheKey, ResultCache};
pub use retry::{classify, FailureClass, RetryDecision, RetryPlan, RetryPolicy};
