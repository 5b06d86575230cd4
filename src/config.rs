//! Per-resource configuration
//!
//! [`ResilienceConfig`] gathers everything [`ResilientInvoker::protect`]
//! needs for one named resource. Every struct is `Serialize + Deserialize` with
//! defaults for missing fields, so an embedding application can keep these in
//! its own TOML or JSON; durations are written as (fractional) seconds.
//!
//! ```
//! use tool_resilience::ResilienceConfig;
//! use std::time::Duration;
//!
//! let config: ResilienceConfig = serde_json::from_str(
//!     r#"{ "max_attempts": 5, "breaker": { "recovery_timeout": 2.5 } }"#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.max_attempts, 5);
//! assert_eq!(config.breaker.recovery_timeout, Duration::from_millis(2500));
//! assert!(config.validate().is_ok());
//! ```
//!
//! [`ResilientInvoker::protect`]: crate::ResilientInvoker::protect

use crate::backoff::{BackoffAlgorithm, BackoffConfig};
use crate::bulkhead::BulkheadConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::classify::FailureKind;
use crate::error::ConfigError;
use crate::retry_budget::RetryBudgetConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serde adapter writing a `Duration` as floating-point seconds
pub mod serde_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Everything that governs calls to one named resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Circuit breaker thresholds
    pub breaker: CircuitBreakerConfig,

    /// Total attempts per protected call, including the first
    pub max_attempts: u32,

    /// Delay between attempts
    pub backoff: BackoffConfig,

    /// Retry volume limits
    pub budget: RetryBudgetConfig,

    /// Concurrency limit; `None` means unlimited
    pub bulkhead: Option<BulkheadConfig>,

    /// Failure kinds worth retrying. `Permanent` is ignored if listed.
    pub retry_on: Vec<FailureKind>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            breaker: CircuitBreakerConfig::default(),
            max_attempts: 3,
            backoff: BackoffConfig::default(),
            budget: RetryBudgetConfig::default(),
            bulkhead: None,
            retry_on: FailureKind::TRANSIENT.to_vec(),
        }
    }
}

impl ResilienceConfig {
    /// Interactive tools: few quick retries, short recovery, small bulkhead wait
    pub fn fast() -> Self {
        Self {
            breaker: CircuitBreakerConfig {
                recovery_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            max_attempts: 2,
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(500),
                ..Default::default()
            },
            bulkhead: Some(BulkheadConfig {
                max_concurrent: 32,
                max_wait: Duration::from_millis(50),
            }),
            ..Default::default()
        }
    }

    /// Slow or rate-limited remotes: more attempts, adaptive backoff
    pub fn patient() -> Self {
        Self {
            breaker: CircuitBreakerConfig {
                recovery_timeout: Duration::from_secs(60),
                ..Default::default()
            },
            max_attempts: 5,
            backoff: BackoffConfig {
                algorithm: BackoffAlgorithm::Adaptive,
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(60),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Calls that must not amplify an outage: trip early, retry once, tight budget
    pub fn critical() -> Self {
        Self {
            breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                failure_rate_threshold: 0.25,
                ..Default::default()
            },
            max_attempts: 2,
            budget: RetryBudgetConfig {
                max_retries_per_second: 2.0,
                max_retry_ratio: 0.1,
                ..Default::default()
            },
            bulkhead: Some(BulkheadConfig {
                max_concurrent: 8,
                max_wait: Duration::ZERO,
            }),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.breaker.validate()?;
        ConfigError::check_nonzero("max_attempts", u64::from(self.max_attempts))?;
        self.backoff.validate()?;
        self.budget.validate()?;
        if let Some(bulkhead) = &self.bulkhead {
            bulkhead.validate()?;
        }
        Ok(())
    }

    /// Whether failures of `kind` are retried under this config
    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        kind.is_transient() && self.retry_on.contains(&kind)
    }
}
