//! Retry budget: a windowed cap on how much retrying a resource may do
//!
//! Retries amplify load exactly when a dependency is struggling. The budget
//! bounds that amplification two ways, both evaluated against the current
//! fixed window only (window key = `floor(elapsed / window)`):
//!
//! - **Rate**: retries in the window may not reach
//!   `max_retries_per_second * seconds_elapsed_in_window` (at least one second
//!   is credited, so a fresh window is not starved).
//! - **Ratio**: the retry being asked for may not push `retries / requests` to
//!   `max_retry_ratio` or beyond. The first `min_retries` retries of a window
//!   are exempt from the ratio so a quiet resource can still retry at all.
//!
//! Windows older than one full period are pruned on every access.
//!
//! # Example
//!
//! ```
//! use tool_resilience::retry_budget::{RetryBudget, RetryBudgetConfig};
//!
//! let budget = RetryBudget::new(RetryBudgetConfig {
//!     max_retries_per_second: 100.0,
//!     max_retry_ratio: 0.1,
//!     min_retries: 0,
//!     ..Default::default()
//! })
//! .unwrap();
//!
//! for _ in 0..100 {
//!     budget.record_request();
//! }
//! for _ in 0..9 {
//!     assert!(budget.can_retry());
//!     budget.record_retry();
//! }
//! assert!(!budget.can_retry());
//! ```

use crate::config::serde_secs;
use crate::error::ConfigError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for a retry budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryBudgetConfig {
    /// Sustained retry rate allowed within a window
    pub max_retries_per_second: f64,

    /// Maximum share of retries relative to requests (0.0-1.0)
    pub max_retry_ratio: f64,

    /// Retries per window that are exempt from the ratio check
    pub min_retries: u64,

    /// Length of one accounting window
    #[serde(with = "serde_secs")]
    pub window: Duration,
}

impl Default for RetryBudgetConfig {
    fn default() -> Self {
        Self {
            max_retries_per_second: 10.0,
            max_retry_ratio: 0.2,
            min_retries: 3,
            window: Duration::from_secs(10),
        }
    }
}

impl RetryBudgetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.max_retries_per_second.is_finite() || self.max_retries_per_second < 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "max_retries_per_second",
                value: self.max_retries_per_second,
                expected: ">= 0.0",
            });
        }
        ConfigError::check_ratio("max_retry_ratio", self.max_retry_ratio)?;
        if self.window.is_zero() {
            return Err(ConfigError::Zero { field: "window" });
        }
        Ok(())
    }
}

/// Counters of one fixed window
#[derive(Debug, Clone, Copy, Default)]
struct WindowCounters {
    retries: u64,
    requests: u64,
}

/// Point-in-time view of the current window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetStats {
    pub retries: u64,
    pub requests: u64,
    /// `retries / requests`, 0 when there were no requests
    pub ratio: f64,
    /// Index of the current window since the budget was created
    pub window: u64,
}

/// Shared retry limiter; all mutation goes through one mutex
#[derive(Debug)]
pub struct RetryBudget {
    config: RetryBudgetConfig,
    origin: Instant,
    windows: Mutex<BTreeMap<u64, WindowCounters>>,
}

impl RetryBudget {
    pub fn new(config: RetryBudgetConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            origin: Instant::now(),
            windows: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &RetryBudgetConfig {
        &self.config
    }

    /// Count one logical request (not its retries)
    pub fn record_request(&self) {
        self.with_current(|counters, _| counters.requests += 1);
    }

    /// Count one retry
    pub fn record_retry(&self) {
        self.with_current(|counters, _| counters.retries += 1);
    }

    /// Whether one more retry fits in the budget right now
    pub fn can_retry(&self) -> bool {
        self.with_current(|counters, elapsed| self.allows(counters, elapsed))
    }

    /// Check and record a retry in one critical section
    pub fn try_acquire_retry(&self) -> bool {
        self.with_current(|counters, elapsed| {
            let allowed = self.allows(counters, elapsed);
            if allowed {
                counters.retries += 1;
            }
            allowed
        })
    }

    pub fn stats(&self) -> BudgetStats {
        let (key, _) = self.position();
        let mut windows = self.windows.lock();
        Self::prune(&mut windows, key);
        let counters = windows.get(&key).copied().unwrap_or_default();
        let ratio = if counters.requests > 0 {
            counters.retries as f64 / counters.requests as f64
        } else {
            0.0
        };
        BudgetStats {
            retries: counters.retries,
            requests: counters.requests,
            ratio,
            window: key,
        }
    }

    /// Forget every window
    pub fn reset(&self) {
        self.windows.lock().clear();
    }

    fn allows(&self, counters: &WindowCounters, elapsed_in_window: Duration) -> bool {
        let credited_secs = elapsed_in_window.as_secs_f64().max(1.0);
        let rate_bound = self.config.max_retries_per_second * credited_secs;
        if counters.retries as f64 >= rate_bound {
            return false;
        }

        if counters.requests > 0 && counters.retries >= self.config.min_retries {
            let projected = (counters.retries + 1) as f64 / counters.requests as f64;
            if projected >= self.config.max_retry_ratio {
                return false;
            }
        }
        true
    }

    /// Current window key and time elapsed inside that window
    fn position(&self) -> (u64, Duration) {
        let elapsed = Instant::now().saturating_duration_since(self.origin);
        let window = self.config.window.as_nanos();
        let key = elapsed.as_nanos() / window;
        let into = elapsed.as_nanos() - key * window;
        (
            u64::try_from(key).unwrap_or(u64::MAX),
            Duration::from_nanos(u64::try_from(into).unwrap_or(u64::MAX)),
        )
    }

    fn prune(windows: &mut BTreeMap<u64, WindowCounters>, current: u64) {
        windows.retain(|key, _| key.saturating_add(1) >= current);
    }

    fn with_current<R>(&self, f: impl FnOnce(&mut WindowCounters, Duration) -> R) -> R {
        let (key, elapsed) = self.position();
        let mut windows = self.windows.lock();
        Self::prune(&mut windows, key);
        f(windows.entry(key).or_default(), elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn budget(per_second: f64, ratio: f64, min_retries: u64) -> RetryBudget {
        RetryBudget::new(RetryBudgetConfig {
            max_retries_per_second: per_second,
            max_retry_ratio: ratio,
            min_retries,
            window: Duration::from_secs(10),
        })
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ratio_denies_tenth_retry() {
        let budget = budget(1000.0, 0.1, 0);
        for _ in 0..100 {
            budget.record_request();
        }
        for _ in 0..9 {
            budget.record_retry();
        }

        assert!(!budget.can_retry());
        let stats = budget.stats();
        assert_eq!(stats.requests, 100);
        assert_eq!(stats.retries, 9);
        assert!((stats.ratio - 0.09).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_retries_exempt_from_ratio() {
        let budget = budget(1000.0, 0.1, 2);
        budget.record_request();

        assert!(budget.try_acquire_retry());
        assert!(budget.try_acquire_retry());
        assert!(!budget.try_acquire_retry());
        assert_eq!(budget.stats().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_bound_grows_with_elapsed_time() {
        let budget = budget(2.0, 1.0, u64::MAX);
        budget.record_request();

        // One second is credited up front: two retries
        assert!(budget.try_acquire_retry());
        assert!(budget.try_acquire_retry());
        assert!(!budget.can_retry());

        tokio::time::advance(Duration::from_secs(3)).await;
        // 3s into the window: bound is 6
        for _ in 0..4 {
            assert!(budget.try_acquire_retry());
        }
        assert!(!budget.can_retry());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_window_starts_fresh_and_prunes() {
        let budget = budget(1.0, 1.0, u64::MAX);
        budget.record_request();
        assert!(budget.try_acquire_retry());
        assert!(!budget.can_retry());

        tokio::time::advance(Duration::from_secs(10)).await;
        let stats = budget.stats();
        assert_eq!(stats.window, 1);
        assert_eq!(stats.retries, 0);
        assert!(budget.can_retry());

        tokio::time::advance(Duration::from_secs(25)).await;
        budget.record_request();
        assert_eq!(budget.windows.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_requests_skips_ratio() {
        let budget = budget(10.0, 0.0, 0);
        assert!(budget.can_retry());
        budget.record_request();
        assert!(!budget.can_retry());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let budget = budget(10.0, 0.5, 0);
        budget.record_request();
        budget.record_retry();
        budget.reset();
        assert_eq!(budget.stats().requests, 0);
        assert_eq!(budget.stats().retries, 0);
    }

    #[test]
    fn test_invalid_config() {
        let bad_ratio = RetryBudgetConfig {
            max_retry_ratio: 1.2,
            ..Default::default()
        };
        assert!(matches!(
            RetryBudget::new(bad_ratio),
            Err(ConfigError::OutOfRange { field: "max_retry_ratio", .. })
        ));

        let zero_window = RetryBudgetConfig {
            window: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(
            RetryBudget::new(zero_window).unwrap_err(),
            ConfigError::Zero { field: "window" }
        );

        let negative_rate = RetryBudgetConfig {
            max_retries_per_second: -1.0,
            ..Default::default()
        };
        assert!(RetryBudget::new(negative_rate).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_never_overshoots() {
        let budget = Arc::new(budget(50.0, 1.0, u64::MAX));
        budget.record_request();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let budget = Arc::clone(&budget);
            handles.push(tokio::spawn(async move {
                let mut granted = 0u64;
                for _ in 0..100 {
                    if budget.try_acquire_retry() {
                        granted += 1;
                    }
                }
                granted
            }));
        }

        let mut granted = 0;
        for handle in handles {
            granted += handle.await.unwrap();
        }
        // The test runs well inside the first second of the window
        assert_eq!(granted, 50);
        assert_eq!(budget.stats().retries, 50);
    }
}
