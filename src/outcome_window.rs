//! Fixed-size ring of recent call outcomes
//!
//! Used by breakers configured with a [`SlidingWindowConfig`]: instead of
//! lifetime counters the breaker looks at the last `size` calls and opens when
//! the window is full and either the failure rate or the slow-call rate reaches
//! its threshold.

use crate::config::serde_secs;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Outcome of one admitted call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    Failure,
    /// Succeeded, but took longer than the slow-call threshold
    Slow,
}

impl CallOutcome {
    /// Classify a finished call. A failure stays a failure however long it took.
    pub fn classify(succeeded: bool, elapsed: Duration, slow_call_duration: Duration) -> Self {
        if !succeeded {
            CallOutcome::Failure
        } else if elapsed > slow_call_duration {
            CallOutcome::Slow
        } else {
            CallOutcome::Success
        }
    }
}

/// Sliding-window settings for latency-sensitive resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlidingWindowConfig {
    /// Number of most recent calls considered
    pub size: usize,

    /// Calls slower than this count as slow
    #[serde(with = "serde_secs")]
    pub slow_call_duration: Duration,

    /// Share of slow calls that opens the breaker (0.0-1.0)
    pub slow_call_rate_threshold: f64,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            size: 20,
            slow_call_duration: Duration::from_secs(5),
            slow_call_rate_threshold: 0.8,
        }
    }
}

impl SlidingWindowConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check_nonzero("sliding_window.size", self.size as u64)?;
        ConfigError::check_ratio(
            "sliding_window.slow_call_rate_threshold",
            self.slow_call_rate_threshold,
        )
    }
}

/// Counts over the current window contents
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowStats {
    pub calls: usize,
    pub failures: usize,
    pub slow: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct OutcomeWindow {
    capacity: usize,
    outcomes: VecDeque<CallOutcome>,
    failures: usize,
    slow: usize,
}

impl OutcomeWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            outcomes: VecDeque::with_capacity(capacity),
            failures: 0,
            slow: 0,
        }
    }

    pub(crate) fn push(&mut self, outcome: CallOutcome) {
        if self.outcomes.len() == self.capacity {
            if let Some(evicted) = self.outcomes.pop_front() {
                self.adjust(evicted, false);
            }
        }
        self.outcomes.push_back(outcome);
        self.adjust(outcome, true);
    }

    pub(crate) fn is_full(&self) -> bool {
        self.outcomes.len() == self.capacity
    }

    pub(crate) fn failure_rate(&self) -> f64 {
        self.rate(self.failures)
    }

    pub(crate) fn slow_rate(&self) -> f64 {
        self.rate(self.slow)
    }

    /// Whether a full window breaches either threshold
    pub(crate) fn should_open(&self, failure_rate_threshold: f64, slow_rate_threshold: f64) -> bool {
        self.is_full()
            && (self.failure_rate() >= failure_rate_threshold
                || self.slow_rate() >= slow_rate_threshold)
    }

    pub(crate) fn clear(&mut self) {
        self.outcomes.clear();
        self.failures = 0;
        self.slow = 0;
    }

    pub(crate) fn stats(&self) -> WindowStats {
        WindowStats {
            calls: self.outcomes.len(),
            failures: self.failures,
            slow: self.slow,
            capacity: self.capacity,
        }
    }

    fn rate(&self, count: usize) -> f64 {
        if self.outcomes.is_empty() {
            0.0
        } else {
            count as f64 / self.outcomes.len() as f64
        }
    }

    fn adjust(&mut self, outcome: CallOutcome, added: bool) {
        let counter = match outcome {
            CallOutcome::Success => return,
            CallOutcome::Failure => &mut self.failures,
            CallOutcome::Slow => &mut self.slow,
        };
        if added {
            *counter += 1;
        } else {
            *counter -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let threshold = Duration::from_millis(100);
        assert_eq!(
            CallOutcome::classify(true, Duration::from_millis(10), threshold),
            CallOutcome::Success
        );
        assert_eq!(
            CallOutcome::classify(true, Duration::from_millis(101), threshold),
            CallOutcome::Slow
        );
        assert_eq!(
            CallOutcome::classify(false, Duration::from_secs(9), threshold),
            CallOutcome::Failure
        );
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut window = OutcomeWindow::new(3);
        window.push(CallOutcome::Failure);
        window.push(CallOutcome::Slow);
        window.push(CallOutcome::Success);
        assert!(window.is_full());
        assert_eq!(window.stats().failures, 1);

        window.push(CallOutcome::Success);
        let stats = window.stats();
        assert_eq!(stats.calls, 3);
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.slow, 1);
    }

    #[test]
    fn test_opens_only_when_full() {
        let mut window = OutcomeWindow::new(4);
        for _ in 0..3 {
            window.push(CallOutcome::Failure);
        }
        assert!(!window.should_open(0.5, 1.0));

        window.push(CallOutcome::Success);
        assert!((window.failure_rate() - 0.75).abs() < f64::EPSILON);
        assert!(window.should_open(0.5, 1.0));
    }

    #[test]
    fn test_slow_rate_opens() {
        let mut window = OutcomeWindow::new(4);
        window.push(CallOutcome::Slow);
        window.push(CallOutcome::Slow);
        window.push(CallOutcome::Slow);
        window.push(CallOutcome::Success);
        assert!(!window.should_open(0.5, 0.8));
        assert!(window.should_open(0.5, 0.75));

        window.clear();
        assert_eq!(window.stats().calls, 0);
        assert_eq!(window.slow_rate(), 0.0);
    }

    #[test]
    fn test_config_validation() {
        assert!(SlidingWindowConfig::default().validate().is_ok());
        let empty = SlidingWindowConfig {
            size: 0,
            ..Default::default()
        };
        assert!(empty.validate().is_err());
    }
}
