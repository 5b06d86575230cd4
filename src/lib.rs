//! Tool Resilience: fault tolerance for calls to external tools and services
//!
//! # Overview
//!
//! This crate wraps calls to unreliable dependencies (HTTP APIs, databases,
//! model endpoints, anything async that can fail) so that failures stay
//! contained. It includes:
//!
//! - **Circuit Breaker**: Fails fast while a resource is unhealthy, probes it before trusting it again
//! - **Retry Budget**: Caps how much retrying a resource may do per time window
//! - **Bulkhead**: Bounds concurrent calls per resource with a bounded wait
//! - **Backoff**: Constant, linear, exponential, decorrelated-jitter, fibonacci and adaptive delays
//! - **Circuit Registry**: Process-wide named breakers with state-change fan-out
//! - **Resilient Invoker**: Composes all of the above around one protected call
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Transports (HTTP, gRPC, database drivers)
//! - What the wrapped operation does
//! - Application-specific fallbacks
//!
//! The caller supplies the operation and a way to classify its errors
//! ([`Classify`]); the crate only decides whether to run, retry, wait or refuse.
//! Every decision is reported as a [`ResilienceError`] variant, so "the call
//! never ran" is always distinguishable from "the call ran and kept failing".
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │ protect(name, op, config)
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Retry Budget                      │  ← Stop retry storms
//! │  (per-window rate + ratio caps)         │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Bulkhead                          │  ← Bound concurrency
//! │  (semaphore, bounded wait)              │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (looked up by name in the registry)    │
//! └─────────────┬───────────────────────────┘
//!               │        ▲
//!               ▼        │ retryable failure:
//!         External Service    sleep(backoff), try again
//! ```
//!
//! # Usage Example
//!
//! ```
//! use tool_resilience::prelude::*;
//! use std::time::Duration;
//!
//! #[derive(Debug)]
//! enum ApiError {
//!     Status(u16),
//! }
//!
//! impl Classify for ApiError {
//!     fn failure_kind(&self) -> FailureKind {
//!         match self {
//!             ApiError::Status(code) => FailureKind::from_status(*code),
//!         }
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread", start_paused = true)]
//! # async fn main() {
//! let invoker = ResilientInvoker::default();
//! invoker.registry().on_state_change(std::sync::Arc::new(TracingListener));
//!
//! let config = ResilienceConfig {
//!     max_attempts: 3,
//!     bulkhead: Some(BulkheadConfig {
//!         max_concurrent: 4,
//!         max_wait: Duration::from_millis(100),
//!     }),
//!     ..Default::default()
//! };
//!
//! let result = invoker
//!     .protect("billing-api", || async { Err::<(), _>(ApiError::Status(404)) }, &config)
//!     .await;
//!
//! match result {
//!     Err(err) if !err.operation_ran() => { /* never sent: use a fallback */ }
//!     Err(err) => assert_eq!(err.attempts(), 1), // 404 is not retried
//!     Ok(()) => unreachable!(),
//! }
//! # }
//! ```

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod classify;
pub mod config;
pub mod error;
pub mod invoker;
pub mod listener;
pub mod outcome_window;
pub mod registry;
pub mod retry_budget;

// Re-export main types for convenience
pub use backoff::{Backoff, BackoffAlgorithm, BackoffConfig};
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadPermit, BulkheadStats};
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState, OpenCircuit,
};
pub use classify::{Classify, FailureKind};
pub use config::ResilienceConfig;
pub use error::{ConfigError, ResilienceError};
pub use invoker::{ProtectedResource, ResilientInvoker};
pub use listener::{ListenerSet, StateChangeListener, TracingListener};
pub use outcome_window::{CallOutcome, SlidingWindowConfig, WindowStats};
pub use registry::CircuitRegistry;
pub use retry_budget::{BudgetStats, RetryBudget, RetryBudgetConfig};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use tool_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::backoff::{Backoff, BackoffAlgorithm, BackoffConfig};
    pub use super::bulkhead::{Bulkhead, BulkheadConfig};
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::classify::{Classify, FailureKind};
    pub use super::config::ResilienceConfig;
    pub use super::error::{ConfigError, ResilienceError};
    pub use super::invoker::{ProtectedResource, ResilientInvoker};
    pub use super::listener::{StateChangeListener, TracingListener};
    pub use super::registry::CircuitRegistry;
    pub use super::retry_budget::{RetryBudget, RetryBudgetConfig};
}
