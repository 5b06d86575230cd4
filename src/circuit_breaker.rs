//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a
//! resource is experiencing issues. It has three states:
//! - Closed: calls pass through, outcomes are counted
//! - Open: calls fail immediately without reaching the resource
//! - HalfOpen: a bounded number of probe calls test whether it recovered
//!
//! # Transitions
//!
//! ```text
//! Closed ──(threshold or rate tripped)──▶ Open
//! Open ──(next call after recovery_timeout)──▶ HalfOpen
//! HalfOpen ──(half_open_max_requests successes)──▶ Closed
//! HalfOpen ──(any failure)──▶ Open
//! ```
//!
//! While Closed the breaker opens on whichever rule applies to the volume seen
//! so far: below `minimum_requests` total calls it opens once
//! `failure_threshold` failures accumulate; from `minimum_requests` on it opens
//! when `failures / total >= failure_rate_threshold`. With a
//! [`SlidingWindowConfig`] the lifetime counters are replaced by the outcomes
//! of the last N calls, and slow calls count against the breaker too.
//!
//! There is no background timer. Open→HalfOpen happens lazily, on the first
//! call that arrives after the recovery timeout, and that call becomes a probe.
//!
//! All state sits behind one mutex per breaker. The lock is never held across
//! an `.await` or while listeners run, and a breaker never touches another
//! breaker's lock.

use crate::config::serde_secs;
use crate::error::{ConfigError, ResilienceError};
use crate::listener::{ListenerSet, StateChangeListener};
use crate::outcome_window::{CallOutcome, OutcomeWindow, SlidingWindowConfig, WindowStats};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, calls pass through normally
    Closed,
    /// Circuit is open, calls fail immediately
    Open,
    /// Circuit is half-open, probing whether the resource recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures that open the circuit while fewer than `minimum_requests` calls were seen
    pub failure_threshold: u32,

    /// Time an open circuit waits before admitting a probe
    #[serde(with = "serde_secs")]
    pub recovery_timeout: Duration,

    /// Concurrent probes allowed while half-open; this many successes close the circuit
    pub half_open_max_requests: u32,

    /// Failure rate (0.0-1.0) that opens the circuit once enough calls were seen
    pub failure_rate_threshold: f64,

    /// Calls needed before the failure rate is trusted
    pub minimum_requests: u32,

    /// Judge the last N outcomes instead of lifetime counters
    pub sliding_window: Option<SlidingWindowConfig>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_requests: 3,
            failure_rate_threshold: 0.5,
            minimum_requests: 10,
            sliding_window: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check_nonzero("failure_threshold", u64::from(self.failure_threshold))?;
        ConfigError::check_nonzero(
            "half_open_max_requests",
            u64::from(self.half_open_max_requests),
        )?;
        ConfigError::check_ratio("failure_rate_threshold", self.failure_rate_threshold)?;
        if let Some(window) = &self.sliding_window {
            window.validate()?;
        }
        Ok(())
    }
}

/// Read-only view of one breaker, for dashboards and tests
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u64,
    pub success_count: u64,
    pub half_open_successes: u32,
    pub half_open_in_flight: u32,
    /// Seconds since the failure that last opened (or reopened) the circuit
    pub last_failure_secs_ago: Option<f64>,
    /// Present for sliding-window breakers
    pub window: Option<WindowStats>,
}

/// A breaker refused the call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenCircuit {
    pub name: String,
    /// Time left until a probe will be admitted; `None` when the circuit is
    /// half-open and every probe slot is taken
    pub retry_in: Option<Duration>,
}

impl<E> From<OpenCircuit> for ResilienceError<E> {
    fn from(open: OpenCircuit) -> Self {
        ResilienceError::CircuitOpen {
            name: open.name,
            retry_in: open.retry_in,
        }
    }
}

type Transition = Option<(CircuitState, CircuitState)>;

/// Internal state of the circuit breaker
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u64,
    success_count: u64,
    half_open_successes: u32,
    half_open_in_flight: u32,
    last_failure: Option<Instant>,
    /// Bumped on every transition; permits from an older generation are stale
    generation: u64,
    window: Option<OutcomeWindow>,
}

impl BreakerState {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_successes: 0,
            half_open_in_flight: 0,
            last_failure: None,
            generation: 0,
            window: config
                .sliding_window
                .as_ref()
                .map(|window| OutcomeWindow::new(window.size)),
        }
    }

    fn move_to(&mut self, to: CircuitState, now: Instant) -> Transition {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        self.generation += 1;
        self.half_open_successes = 0;
        self.half_open_in_flight = 0;
        match to {
            CircuitState::Open => {
                self.last_failure = Some(now);
                if let Some(window) = &mut self.window {
                    window.clear();
                }
            }
            CircuitState::Closed => self.zero_counters(),
            CircuitState::HalfOpen => {}
        }
        Some((from, to))
    }

    fn zero_counters(&mut self) {
        self.failure_count = 0;
        self.success_count = 0;
        self.half_open_successes = 0;
        self.half_open_in_flight = 0;
        if let Some(window) = &mut self.window {
            window.clear();
        }
    }

    fn should_trip(&self, config: &CircuitBreakerConfig) -> bool {
        if let (Some(window), Some(window_config)) = (&self.window, &config.sliding_window) {
            return window.should_open(
                config.failure_rate_threshold,
                window_config.slow_call_rate_threshold,
            );
        }

        let total = self.failure_count + self.success_count;
        if total < u64::from(config.minimum_requests) {
            self.failure_count >= u64::from(config.failure_threshold)
        } else {
            self.failure_count > 0
                && self.failure_count as f64 / total as f64 >= config.failure_rate_threshold
        }
    }
}

struct Shared {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    listeners: ListenerSet,
}

/// Circuit breaker for protecting against cascading failures
///
/// Cloning is cheap and clones share state.
///
/// # Example
/// ```
/// use tool_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let breaker = CircuitBreaker::new("db", CircuitBreakerConfig {
///     failure_threshold: 2,
///     ..Default::default()
/// })
/// .unwrap();
///
/// for _ in 0..2 {
///     let _ = breaker.call(|| async { Err::<(), _>("refused") }).await;
/// }
/// assert_eq!(breaker.get_state(), CircuitState::Open);
///
/// // Rejected without running the operation
/// let result = breaker.call(|| async { Ok::<_, &str>(1) }).await;
/// assert!(result.unwrap_err().is_fail_fast());
/// # }
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Shared>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker; fails on invalid thresholds
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let state = BreakerState::new(&config);
        Ok(Self {
            inner: Arc::new(Shared {
                name: name.into(),
                config,
                state: Mutex::new(state),
                listeners: ListenerSet::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    /// Whether two handles refer to the same breaker
    pub fn ptr_eq(&self, other: &CircuitBreaker) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register a listener for this breaker's transitions
    pub fn add_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.inner.listeners.add(listener);
    }

    /// Get the current state of the circuit breaker
    pub fn get_state(&self) -> CircuitState {
        self.inner.state.lock().state
    }

    /// Get current failure count
    pub fn get_failure_count(&self) -> u64 {
        self.inner.state.lock().failure_count
    }

    /// Get current success count
    pub fn get_success_count(&self) -> u64 {
        self.inner.state.lock().success_count
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.inner.state.lock();
        CircuitSnapshot {
            name: self.inner.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            half_open_successes: state.half_open_successes,
            half_open_in_flight: state.half_open_in_flight,
            last_failure_secs_ago: state
                .last_failure
                .map(|at| Instant::now().saturating_duration_since(at).as_secs_f64()),
            window: state.window.as_ref().map(OutcomeWindow::stats),
        }
    }

    /// Force the breaker closed and zero every counter
    pub fn reset(&self) {
        let transition = {
            let mut state = self.inner.state.lock();
            let transition = state.move_to(CircuitState::Closed, Instant::now());
            state.zero_counters();
            state.last_failure = None;
            transition
        };
        tracing::debug!(circuit = %self.inner.name, "circuit reset");
        self.notify(transition);
    }

    /// Force the breaker open, as if it had just tripped
    pub fn force_open(&self) {
        let transition = {
            let mut state = self.inner.state.lock();
            let now = Instant::now();
            let transition = state.move_to(CircuitState::Open, now);
            state.last_failure = Some(now);
            transition
        };
        self.notify(transition);
    }

    /// Time left before an open breaker admits a probe; `None` unless open
    pub fn remaining_open(&self) -> Option<Duration> {
        let state = self.inner.state.lock();
        match state.state {
            CircuitState::Open => Some(self.remaining(&state, Instant::now())),
            _ => None,
        }
    }

    /// Ask to run one call.
    ///
    /// An open breaker whose recovery timeout has passed moves to half-open and
    /// admits this call as a probe. The returned permit must be resolved with
    /// [`CallPermit::success`] or [`CallPermit::failure`]; dropping it unresolved
    /// gives a probe slot back without recording anything.
    pub fn try_acquire(&self) -> Result<CallPermit, OpenCircuit> {
        let now = Instant::now();
        let (admitted, transition) = {
            let mut state = self.inner.state.lock();
            let mut transition = None;

            if state.state == CircuitState::Open {
                let waited = state
                    .last_failure
                    .map_or(Duration::MAX, |at| now.saturating_duration_since(at));
                if waited > self.inner.config.recovery_timeout {
                    transition = state.move_to(CircuitState::HalfOpen, now);
                }
            }

            let admitted = match state.state {
                CircuitState::Closed => Ok((state.generation, false)),
                CircuitState::HalfOpen => {
                    if state.half_open_in_flight < self.inner.config.half_open_max_requests {
                        state.half_open_in_flight += 1;
                        Ok((state.generation, true))
                    } else {
                        Err(None)
                    }
                }
                CircuitState::Open => Err(Some(self.remaining(&state, now))),
            };
            (admitted, transition)
        };

        self.notify(transition);

        match admitted {
            Ok((generation, probe)) => Ok(CallPermit {
                breaker: self.clone(),
                generation,
                probe,
                started: now,
                resolved: false,
            }),
            Err(retry_in) => {
                tracing::trace!(circuit = %self.inner.name, "call rejected by open circuit");
                Err(OpenCircuit {
                    name: self.inner.name.clone(),
                    retry_in,
                })
            }
        }
    }

    /// Execute an operation with circuit breaker protection, without retries
    ///
    /// Every `Err` from the operation counts as a failure and is returned as
    /// [`ResilienceError::Operation`].
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire()?;
        match op().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(source) => {
                permit.failure();
                Err(ResilienceError::Operation {
                    name: self.inner.name.clone(),
                    attempts: 1,
                    source,
                })
            }
        }
    }

    fn remaining(&self, state: &BreakerState, now: Instant) -> Duration {
        state.last_failure.map_or(Duration::ZERO, |at| {
            self.inner
                .config
                .recovery_timeout
                .saturating_sub(now.saturating_duration_since(at))
        })
    }

    fn record(&self, generation: u64, probe: bool, succeeded: bool, elapsed: Duration) {
        let now = Instant::now();
        let config = &self.inner.config;
        let transition = {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                tracing::trace!(
                    circuit = %self.inner.name,
                    "ignoring outcome from before last transition"
                );
                return;
            }

            if probe {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            }

            if succeeded {
                state.success_count += 1;
            } else {
                state.failure_count += 1;
            }
            if let (Some(window), Some(window_config)) = (&mut state.window, &config.sliding_window)
            {
                window.push(CallOutcome::classify(
                    succeeded,
                    elapsed,
                    window_config.slow_call_duration,
                ));
            }

            match state.state {
                CircuitState::Closed => {
                    if state.should_trip(config) {
                        state.move_to(CircuitState::Open, now)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen if succeeded => {
                    state.half_open_successes += 1;
                    if state.half_open_successes >= config.half_open_max_requests {
                        state.move_to(CircuitState::Closed, now)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => state.move_to(CircuitState::Open, now),
                _ => None,
            }
        };

        if let Some((from, to)) = transition {
            tracing::debug!(circuit = %self.inner.name, %from, %to, "circuit transition");
        }
        self.notify(transition);
    }

    fn release_probe(&self, generation: u64) {
        let mut state = self.inner.state.lock();
        if state.generation == generation {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }

    fn notify(&self, transition: Transition) {
        if let Some((from, to)) = transition {
            self.inner.listeners.notify(&self.inner.name, from, to);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.get_state())
            .finish()
    }
}

/// Admission to run one call through a breaker
#[derive(Debug)]
#[must_use = "resolve the permit with success() or failure()"]
pub struct CallPermit {
    breaker: CircuitBreaker,
    generation: u64,
    probe: bool,
    started: Instant,
    resolved: bool,
}

impl CallPermit {
    /// Whether this call is a half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record a successful call; its duration decides whether it was slow
    pub fn success(mut self) {
        self.resolve(true);
    }

    /// Record a failed call
    pub fn failure(mut self) {
        self.resolve(false);
    }

    fn resolve(&mut self, succeeded: bool) {
        self.resolved = true;
        let elapsed = Instant::now().saturating_duration_since(self.started);
        self.breaker
            .record(self.generation, self.probe, succeeded, elapsed);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.resolved && self.probe {
            self.breaker.release_probe(self.generation);
        }
    }
}
