//! Error types for the resilience layer

use std::time::Duration;
use thiserror::Error;

/// Invalid configuration, detected when a breaker, budget, bulkhead or
/// backoff is constructed. Never produced by a call in flight.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// A numeric setting fell outside its allowed range
    #[error("{field} = {value} is out of range (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        expected: &'static str,
    },

    /// A setting that must be positive was zero
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    /// Two settings contradict each other
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

impl ConfigError {
    pub(crate) fn check_ratio(field: &'static str, value: f64) -> Result<(), ConfigError> {
        if (0.0..=1.0).contains(&value) {
            Ok(())
        } else {
            Err(ConfigError::OutOfRange {
                field,
                value,
                expected: "0.0..=1.0",
            })
        }
    }

    pub(crate) fn check_nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
        if value == 0 {
            Err(ConfigError::Zero { field })
        } else {
            Ok(())
        }
    }
}

/// Terminal outcome of a protected call.
///
/// `E` is the error type of the wrapped operation. The variants split into two
/// groups callers usually care about:
///
/// - the layer refused or stopped the call on its own authority
///   ([`CircuitOpen`](Self::CircuitOpen), [`BulkheadFull`](Self::BulkheadFull),
///   [`RetryBudgetExhausted`](Self::RetryBudgetExhausted)), see
///   [`is_fail_fast`](Self::is_fail_fast);
/// - the operation ran and its failure is being reported
///   ([`RetriesExhausted`](Self::RetriesExhausted), [`Operation`](Self::Operation)).
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// Circuit breaker is open (or its half-open probe slots are taken) and
    /// the operation never ran; a breaker opening between retries yields
    /// [`RetriesExhausted`](Self::RetriesExhausted) instead
    #[error("circuit '{name}' is open, rejecting calls")]
    CircuitOpen {
        name: String,
        /// Time left until the breaker will admit a probe, when known
        retry_in: Option<Duration>,
    },

    /// No bulkhead slot became free within the configured wait
    #[error("bulkhead '{name}' is full ({max_concurrent} in flight, waited {waited:?})")]
    BulkheadFull {
        name: String,
        max_concurrent: usize,
        waited: Duration,
    },

    /// A retry was warranted but the retry budget refused it
    #[error("retry budget for '{name}' exhausted after {attempts} attempt(s): {source}")]
    RetryBudgetExhausted {
        name: String,
        attempts: u32,
        #[source]
        source: E,
    },

    /// Every allowed attempt failed with a retryable error
    #[error("'{name}' failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        name: String,
        attempts: u32,
        #[source]
        source: E,
    },

    /// The operation failed with an error that is not retried
    #[error("'{name}' failed with a non-retryable error on attempt {attempts}: {source}")]
    Operation {
        name: String,
        attempts: u32,
        #[source]
        source: E,
    },

    /// An external cancellation fired while waiting for a slot or a backoff delay
    #[error("call to '{name}' cancelled after {attempts} attempt(s)")]
    Cancelled { name: String, attempts: u32 },

    /// The resource configuration was rejected
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl<E> ResilienceError<E> {
    /// True when the layer itself decided the outcome: the breaker was open,
    /// the bulkhead was full or the retry budget said no.
    ///
    /// A refused retry still follows at least one attempt, so use
    /// [`operation_ran`](Self::operation_ran) to decide whether a fallback is safe.
    pub fn is_fail_fast(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen { .. }
                | ResilienceError::BulkheadFull { .. }
                | ResilienceError::RetryBudgetExhausted { .. }
        )
    }

    /// True when the wrapped operation was executed at least once
    pub fn operation_ran(&self) -> bool {
        self.attempts() > 0
    }

    /// Number of times the wrapped operation was executed
    pub fn attempts(&self) -> u32 {
        match self {
            ResilienceError::RetryBudgetExhausted { attempts, .. }
            | ResilienceError::RetriesExhausted { attempts, .. }
            | ResilienceError::Operation { attempts, .. }
            | ResilienceError::Cancelled { attempts, .. } => *attempts,
            _ => 0,
        }
    }

    /// The last error returned by the operation, if it ran
    pub fn last_error(&self) -> Option<&E> {
        match self {
            ResilienceError::RetryBudgetExhausted { source, .. }
            | ResilienceError::RetriesExhausted { source, .. }
            | ResilienceError::Operation { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Consume the error, yielding the last operation error if there is one
    pub fn into_source(self) -> Option<E> {
        match self {
            ResilienceError::RetryBudgetExhausted { source, .. }
            | ResilienceError::RetriesExhausted { source, .. }
            | ResilienceError::Operation { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_error_classification() {
        let open: ResilienceError<Boom> = ResilienceError::CircuitOpen {
            name: "db".to_string(),
            retry_in: Some(Duration::from_secs(3)),
        };
        assert!(open.is_fail_fast());
        assert!(!open.operation_ran());
        assert!(open.last_error().is_none());

        let full: ResilienceError<Boom> = ResilienceError::BulkheadFull {
            name: "db".to_string(),
            max_concurrent: 1,
            waited: Duration::ZERO,
        };
        assert!(full.is_fail_fast());
        assert!(!full.operation_ran());

        let exhausted = ResilienceError::RetriesExhausted {
            name: "db".to_string(),
            attempts: 3,
            source: Boom,
        };
        assert!(!exhausted.is_fail_fast());
        assert!(exhausted.operation_ran());
        assert_eq!(exhausted.attempts(), 3);
        assert!(exhausted.last_error().is_some());
    }

    #[test]
    fn test_display_includes_context() {
        let err = ResilienceError::RetriesExhausted {
            name: "search".to_string(),
            attempts: 2,
            source: Boom,
        };
        assert_eq!(err.to_string(), "'search' failed after 2 attempt(s): boom");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_config_error_checks() {
        assert!(ConfigError::check_ratio("ratio", 0.5).is_ok());
        assert!(ConfigError::check_ratio("ratio", 1.0).is_ok());
        assert!(matches!(
            ConfigError::check_ratio("ratio", 1.5),
            Err(ConfigError::OutOfRange { field: "ratio", .. })
        ));
        assert!(ConfigError::check_ratio("ratio", f64::NAN).is_err());
        assert_eq!(
            ConfigError::check_nonzero("window", 0),
            Err(ConfigError::Zero { field: "window" })
        );

        let wrapped: ResilienceError<Boom> = ConfigError::Zero { field: "x" }.into();
        assert!(matches!(wrapped, ResilienceError::Config(_)));
    }
}
