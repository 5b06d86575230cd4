//! Backoff strategies: how long to wait between attempts
//!
//! Every strategy implements [`Backoff`]. A strategy is pure apart from the
//! randomness used for jitter, and every delay it returns lies in
//! `[0, max_delay]`: intermediate overflow or non-finite arithmetic saturates
//! at the cap instead of panicking.
//!
//! # Example
//!
//! ```
//! use tool_resilience::backoff::{Backoff, Exponential};
//! use std::time::Duration;
//!
//! let backoff = Exponential::new(Duration::from_millis(100), 2.0, Duration::from_secs(1));
//!
//! assert_eq!(backoff.delay(0, None), Duration::from_millis(100));
//! assert_eq!(backoff.delay(1, None), Duration::from_millis(200));
//! assert_eq!(backoff.delay(10, None), Duration::from_secs(1));
//! ```

use crate::classify::FailureKind;
use crate::config::serde_secs;
use crate::error::ConfigError;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

/// Computes the delay before the next attempt
pub trait Backoff: Send + Sync + Debug {
    /// Delay to sleep after the failed attempt `attempt` (zero based).
    /// `previous` is the delay returned for the prior attempt, if any.
    fn delay(&self, attempt: u32, previous: Option<Duration>) -> Duration;

    /// Upper bound of every delay this strategy returns
    fn max_delay(&self) -> Duration;

    /// Tag the kind of failure the next delay is computed for.
    /// Only [`Adaptive`] cares; everything else ignores it.
    fn observe(&self, _kind: FailureKind) {}
}

/// Convert seconds to a duration inside `[0, max]`
fn clamp_secs(secs: f64, max: Duration) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        Duration::ZERO
    } else if secs >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(secs)
    }
}

/// Same delay every time
#[derive(Debug, Clone)]
pub struct Constant {
    value: Duration,
    max: Duration,
}

impl Constant {
    pub fn new(value: Duration, max: Duration) -> Self {
        Self { value, max }
    }
}

impl Backoff for Constant {
    fn delay(&self, _attempt: u32, _previous: Option<Duration>) -> Duration {
        self.value.min(self.max)
    }

    fn max_delay(&self) -> Duration {
        self.max
    }
}

/// `increment * (attempt + 1)`, capped
#[derive(Debug, Clone)]
pub struct Linear {
    increment: Duration,
    max: Duration,
}

impl Linear {
    pub fn new(increment: Duration, max: Duration) -> Self {
        Self { increment, max }
    }
}

impl Backoff for Linear {
    fn delay(&self, attempt: u32, _previous: Option<Duration>) -> Duration {
        self.increment
            .checked_mul(attempt.saturating_add(1))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    fn max_delay(&self) -> Duration {
        self.max
    }
}

/// `initial * base^attempt`, capped, with optional symmetric jitter
#[derive(Debug, Clone)]
pub struct Exponential {
    initial: Duration,
    base: f64,
    max: Duration,
    /// Fraction of the delay used as jitter amplitude; 0 disables jitter
    jitter_factor: f64,
}

impl Exponential {
    pub fn new(initial: Duration, base: f64, max: Duration) -> Self {
        Self {
            initial,
            base,
            max,
            jitter_factor: 0.0,
        }
    }

    /// Perturb every delay uniformly within `±factor * delay`
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    fn nominal(&self, attempt: u32) -> Duration {
        clamp_secs(
            self.initial.as_secs_f64() * self.base.powf(f64::from(attempt)),
            self.max,
        )
    }
}

impl Backoff for Exponential {
    fn delay(&self, attempt: u32, _previous: Option<Duration>) -> Duration {
        let nominal = self.nominal(attempt);
        if self.jitter_factor <= 0.0 || nominal.is_zero() {
            return nominal;
        }

        let spread = nominal.as_secs_f64() * self.jitter_factor;
        let offset = rand::rng().random_range(-spread..=spread);
        clamp_secs(nominal.as_secs_f64() + offset, self.max)
    }

    fn max_delay(&self) -> Duration {
        self.max
    }
}

/// "Decorrelated jitter": `uniform(base, previous * 3)`, capped.
///
/// The first call (no previous delay) is seeded with `base`.
#[derive(Debug, Clone)]
pub struct DecorrelatedJitter {
    base: Duration,
    max: Duration,
}

impl DecorrelatedJitter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl Backoff for DecorrelatedJitter {
    fn delay(&self, _attempt: u32, previous: Option<Duration>) -> Duration {
        let low = self.base.as_secs_f64();
        let previous = previous.unwrap_or(self.base).as_secs_f64();
        let high = (previous * 3.0).min(self.max.as_secs_f64()).max(low);

        let secs = if high > low {
            rand::rng().random_range(low..=high)
        } else {
            low
        };
        clamp_secs(secs, self.max)
    }

    fn max_delay(&self) -> Duration {
        self.max
    }
}

/// `unit * fib(attempt)` with `fib(0) = fib(1) = 1`, capped.
///
/// The sequence is memoized per instance.
#[derive(Debug)]
pub struct Fibonacci {
    unit: Duration,
    max: Duration,
    memo: Mutex<Vec<u64>>,
}

impl Fibonacci {
    pub fn new(unit: Duration, max: Duration) -> Self {
        Self {
            unit,
            max,
            memo: Mutex::new(vec![1, 1]),
        }
    }

    fn fib(&self, n: u32) -> u64 {
        let n = n as usize;
        let mut memo = self.memo.lock();
        if n >= memo.len() && memo.last() == Some(&u64::MAX) {
            return u64::MAX;
        }
        while memo.len() <= n {
            let len = memo.len();
            let next = memo[len - 1].saturating_add(memo[len - 2]);
            memo.push(next);
            if next == u64::MAX {
                return u64::MAX;
            }
        }
        memo[n]
    }
}

impl Backoff for Fibonacci {
    fn delay(&self, attempt: u32, _previous: Option<Duration>) -> Duration {
        u32::try_from(self.fib(attempt))
            .ok()
            .and_then(|n| self.unit.checked_mul(n))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    fn max_delay(&self) -> Duration {
        self.max
    }
}

/// Dispatches to a per-failure-kind strategy.
///
/// The caller tags each failure with [`Backoff::observe`] before asking for the
/// delay. Untagged failures and kinds without an entry use the fallback, which
/// defaults to exponential.
#[derive(Debug)]
pub struct Adaptive {
    fallback: Box<dyn Backoff>,
    strategies: HashMap<FailureKind, Box<dyn Backoff>>,
    current: Mutex<Option<FailureKind>>,
    max: Duration,
}

impl Adaptive {
    /// Adaptive strategy with no per-kind entries yet
    pub fn new(fallback: Box<dyn Backoff>) -> Self {
        let max = fallback.max_delay();
        Self {
            fallback,
            strategies: HashMap::new(),
            current: Mutex::new(None),
            max,
        }
    }

    /// Standard table derived from a [`BackoffConfig`]:
    /// rate limits back off with decorrelated jitter from twice the initial
    /// delay, timeouts grow linearly, everything else is exponential.
    pub fn from_config(config: &BackoffConfig) -> Self {
        let jitter = if config.jitter {
            config.jitter_factor
        } else {
            0.0
        };
        let exponential = || {
            Box::new(
                Exponential::new(config.initial_delay, config.multiplier, config.max_delay)
                    .with_jitter(jitter),
            ) as Box<dyn Backoff>
        };

        Self::new(exponential())
            .with_strategy(
                FailureKind::RateLimit,
                Box::new(DecorrelatedJitter::new(
                    config.initial_delay.saturating_mul(2),
                    config.max_delay,
                )),
            )
            .with_strategy(
                FailureKind::Timeout,
                Box::new(Linear::new(config.initial_delay, config.max_delay)),
            )
            .with_strategy(FailureKind::ServerError, exponential())
    }

    /// Use `strategy` for failures tagged `kind`
    pub fn with_strategy(mut self, kind: FailureKind, strategy: Box<dyn Backoff>) -> Self {
        self.strategies.insert(kind, strategy);
        self
    }

    /// The kind the next delay will be computed for
    pub fn current_kind(&self) -> Option<FailureKind> {
        *self.current.lock()
    }
}

impl Backoff for Adaptive {
    fn delay(&self, attempt: u32, previous: Option<Duration>) -> Duration {
        let kind = *self.current.lock();
        let strategy = kind
            .and_then(|kind| self.strategies.get(&kind))
            .unwrap_or(&self.fallback);
        strategy.delay(attempt, previous).min(self.max)
    }

    fn max_delay(&self) -> Duration {
        self.max
    }

    fn observe(&self, kind: FailureKind) {
        *self.current.lock() = Some(kind);
    }
}

/// Which backoff algorithm a resource uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffAlgorithm {
    Constant,
    Linear,
    #[default]
    Exponential,
    DecorrelatedJitter,
    Fibonacci,
    Adaptive,
}

/// Serializable backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub algorithm: BackoffAlgorithm,

    /// First delay; also the increment (linear), base (decorrelated jitter)
    /// and unit (fibonacci)
    #[serde(with = "serde_secs")]
    pub initial_delay: Duration,

    /// Cap applied to every delay
    #[serde(with = "serde_secs")]
    pub max_delay: Duration,

    /// Growth base for exponential backoff
    pub multiplier: f64,

    /// Randomize exponential delays
    pub jitter: bool,

    /// Jitter amplitude as a fraction of the delay (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            algorithm: BackoffAlgorithm::Exponential,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::Inconsistent(format!(
                "initial_delay {:?} exceeds max_delay {:?}",
                self.initial_delay, self.max_delay
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::OutOfRange {
                field: "multiplier",
                value: self.multiplier,
                expected: ">= 1.0",
            });
        }
        ConfigError::check_ratio("jitter_factor", self.jitter_factor)
    }

    /// Build a fresh strategy instance
    pub fn build(&self) -> Box<dyn Backoff> {
        let jitter = if self.jitter { self.jitter_factor } else { 0.0 };
        match self.algorithm {
            BackoffAlgorithm::Constant => Box::new(Constant::new(self.initial_delay, self.max_delay)),
            BackoffAlgorithm::Linear => Box::new(Linear::new(self.initial_delay, self.max_delay)),
            BackoffAlgorithm::Exponential => Box::new(
                Exponential::new(self.initial_delay, self.multiplier, self.max_delay)
                    .with_jitter(jitter),
            ),
            BackoffAlgorithm::DecorrelatedJitter => {
                Box::new(DecorrelatedJitter::new(self.initial_delay, self.max_delay))
            }
            BackoffAlgorithm::Fibonacci => {
                Box::new(Fibonacci::new(self.initial_delay, self.max_delay))
            }
            BackoffAlgorithm::Adaptive => Box::new(Adaptive::from_config(self)),
        }
    }
}
