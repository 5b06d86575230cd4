//! The protected-call orchestrator
//!
//! [`ResilientInvoker::protect`] wraps one logical call to a named resource:
//!
//! ```text
//! record request ─▶ bulkhead slot ─▶ ┌─▶ breaker admits? ──no──▶ CircuitOpen
//!        (budget)    (or BulkheadFull) │        │ yes
//!                                      │        ▼
//!                                      │   run operation ──ok──▶ return value
//!                                      │        │ err
//!                                      │        ▼
//!                                      │   classify ─ not retryable ─▶ Operation
//!                                      │        │    last attempt    ─▶ RetriesExhausted
//!                                      │        │    budget says no  ─▶ RetryBudgetExhausted
//!                                      └── sleep(backoff)
//! ```
//!
//! Attempts run strictly one after another inside the caller's task. The
//! bulkhead slot and the breaker permit are RAII guards, so every exit path,
//! including dropping the returned future, releases them exactly once.
//!
//! The breaker, retry budget and bulkhead for a name are created on first
//! reference and shared by every caller naming that resource; the first config
//! seen for a name decides their settings.

use crate::bulkhead::{Bulkhead, BulkheadPermit};
use crate::circuit_breaker::CircuitBreaker;
use crate::classify::{Classify, FailureKind};
use crate::config::ResilienceConfig;
use crate::error::{ConfigError, ResilienceError};
use crate::registry::CircuitRegistry;
use crate::retry_budget::RetryBudget;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

static GLOBAL: OnceLock<ResilientInvoker> = OnceLock::new();

/// Runs operations under breaker, budget, bulkhead and backoff control
///
/// Cloning is cheap; clones share every per-resource component.
///
/// # Example
///
/// ```
/// use tool_resilience::{Classify, FailureKind, ResilienceConfig, ResilientInvoker};
///
/// #[derive(Debug)]
/// struct Flaky;
///
/// impl Classify for Flaky {
///     fn failure_kind(&self) -> FailureKind {
///         FailureKind::ServerError
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread", start_paused = true)]
/// # async fn main() {
/// let invoker = ResilientInvoker::default();
/// let config = ResilienceConfig::default();
///
/// let mut calls = 0;
/// let result = invoker
///     .protect(
///         "inventory",
///         || {
///             calls += 1;
///             let n = calls;
///             async move { if n < 2 { Err(Flaky) } else { Ok(n) } }
///         },
///         &config,
///     )
///     .await;
///
/// assert_eq!(result.unwrap(), 2);
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ResilientInvoker {
    registry: CircuitRegistry,
    budgets: Arc<DashMap<String, Arc<RetryBudget>>>,
    /// `None` records that the first call for the name ran without a bulkhead
    bulkheads: Arc<DashMap<String, Option<Bulkhead>>>,
}

impl ResilientInvoker {
    /// An invoker whose breakers live in `registry`
    pub fn new(registry: CircuitRegistry) -> Self {
        Self {
            registry,
            budgets: Arc::new(DashMap::new()),
            bulkheads: Arc::new(DashMap::new()),
        }
    }

    /// Process-wide invoker backed by [`CircuitRegistry::global`]
    pub fn global() -> &'static ResilientInvoker {
        GLOBAL.get_or_init(|| ResilientInvoker::new(CircuitRegistry::global().clone()))
    }

    pub fn registry(&self) -> &CircuitRegistry {
        &self.registry
    }

    /// The retry budget for `name`, if a call has created it
    pub fn budget(&self, name: &str) -> Option<Arc<RetryBudget>> {
        self.budgets.get(name).map(|entry| Arc::clone(&entry))
    }

    /// The bulkhead for `name`, if a call has created it
    pub fn bulkhead(&self, name: &str) -> Option<Bulkhead> {
        self.bulkheads.get(name).and_then(|entry| entry.clone())
    }

    /// Bind a name and config for repeated calls
    pub fn resource(&self, name: impl Into<String>, config: ResilienceConfig) -> ProtectedResource {
        ProtectedResource {
            invoker: self.clone(),
            name: name.into(),
            config: Arc::new(config),
        }
    }

    /// Run `op` under the resource's protection, classifying failures with
    /// [`Classify`]. `op` is called once per attempt.
    pub async fn protect<F, Fut, T, E>(
        &self,
        name: &str,
        op: F,
        config: &ResilienceConfig,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        self.run(name, op, config, |err: &E| err.failure_kind(), None)
            .await
    }

    /// Like [`protect`](Self::protect), with a caller-supplied classifier
    pub async fn protect_with<F, Fut, T, E, C>(
        &self,
        name: &str,
        op: F,
        config: &ResilienceConfig,
        classify: C,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> FailureKind,
    {
        self.run(name, op, config, classify, None).await
    }

    /// Like [`protect`](Self::protect), but the bulkhead wait and backoff
    /// sleeps end early with [`ResilienceError::Cancelled`] once `cancel`
    /// fires. An attempt already running is left to finish.
    pub async fn protect_cancellable<F, Fut, T, E>(
        &self,
        name: &str,
        op: F,
        config: &ResilienceConfig,
        cancel: &CancellationToken,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        self.run(name, op, config, |err: &E| err.failure_kind(), Some(cancel))
            .await
    }

    async fn run<F, Fut, T, E, C>(
        &self,
        name: &str,
        op: F,
        config: &ResilienceConfig,
        classify: C,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> FailureKind,
    {
        let span = tracing::debug_span!("protect", resource = name);
        self.attempt_loop(name, op, config, classify, cancel)
            .instrument(span)
            .await
    }

    async fn attempt_loop<F, Fut, T, E, C>(
        &self,
        name: &str,
        mut op: F,
        config: &ResilienceConfig,
        classify: C,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> FailureKind,
    {
        config.validate()?;
        let breaker = self.registry.get_or_create(name, &config.breaker)?;
        let budget = self.budget_for(name, config)?;
        let bulkhead = self.bulkhead_for(name, config)?;

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(ResilienceError::Cancelled {
                name: name.to_string(),
                attempts: 0,
            });
        }

        budget.record_request();
        let _slot = match &bulkhead {
            Some(bulkhead) => Some(Self::enter::<E>(name, bulkhead, cancel).await?),
            None => None,
        };

        let backoff = config.backoff.build();
        let mut last_delay = None;
        let mut last_error = None;
        let mut attempts = 0u32;

        loop {
            let permit = match breaker.try_acquire() {
                Ok(permit) => permit,
                Err(open) => {
                    tracing::warn!(attempts, retry_in = ?open.retry_in, "circuit open, call rejected");
                    // Once the operation has run, the caller must see its failure
                    return Err(match last_error.take() {
                        Some(source) => ResilienceError::RetriesExhausted {
                            name: name.to_string(),
                            attempts,
                            source,
                        },
                        None => open.into(),
                    });
                }
            };

            attempts += 1;
            let error = match op().await {
                Ok(value) => {
                    permit.success();
                    if attempts > 1 {
                        tracing::debug!(attempts, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let kind = classify(&error);
            permit.failure();

            if !config.is_retryable(kind) {
                tracing::warn!(attempts, %kind, "non-retryable failure");
                return Err(ResilienceError::Operation {
                    name: name.to_string(),
                    attempts,
                    source: error,
                });
            }
            if attempts >= config.max_attempts {
                tracing::warn!(attempts, %kind, "retries exhausted");
                return Err(ResilienceError::RetriesExhausted {
                    name: name.to_string(),
                    attempts,
                    source: error,
                });
            }
            if !budget.try_acquire_retry() {
                let stats = budget.stats();
                tracing::warn!(
                    attempts,
                    %kind,
                    retries = stats.retries,
                    requests = stats.requests,
                    "retry budget exhausted"
                );
                return Err(ResilienceError::RetryBudgetExhausted {
                    name: name.to_string(),
                    attempts,
                    source: error,
                });
            }

            backoff.observe(kind);
            let delay = backoff.delay(attempts - 1, last_delay);
            last_delay = Some(delay);
            tracing::debug!(attempt = attempts, ?delay, %kind, "retrying after backoff");

            last_error = Some(error);
            if until_cancelled(tokio::time::sleep(delay), cancel)
                .await
                .is_none()
            {
                tracing::debug!(attempts, "cancelled during backoff");
                return Err(ResilienceError::Cancelled {
                    name: name.to_string(),
                    attempts,
                });
            }
        }
    }

    async fn enter<E>(
        name: &str,
        bulkhead: &Bulkhead,
        cancel: Option<&CancellationToken>,
    ) -> Result<BulkheadPermit, ResilienceError<E>> {
        let started = Instant::now();
        match until_cancelled(bulkhead.acquire_default(), cancel).await {
            Some(Some(permit)) => Ok(permit),
            Some(None) => {
                let waited = started.elapsed();
                tracing::warn!(?waited, "bulkhead full");
                Err(ResilienceError::BulkheadFull {
                    name: name.to_string(),
                    max_concurrent: bulkhead.config().max_concurrent,
                    waited,
                })
            }
            None => Err(ResilienceError::Cancelled {
                name: name.to_string(),
                attempts: 0,
            }),
        }
    }

    fn budget_for(
        &self,
        name: &str,
        config: &ResilienceConfig,
    ) -> Result<Arc<RetryBudget>, ConfigError> {
        if let Some(budget) = self.budget(name) {
            return Ok(budget);
        }
        match self.budgets.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let budget = Arc::new(RetryBudget::new(config.budget.clone())?);
                entry.insert(Arc::clone(&budget));
                Ok(budget)
            }
        }
    }

    fn bulkhead_for(
        &self,
        name: &str,
        config: &ResilienceConfig,
    ) -> Result<Option<Bulkhead>, ConfigError> {
        if let Some(decided) = self.bulkheads.get(name) {
            return Ok(decided.clone());
        }
        match self.bulkheads.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let bulkhead = config
                    .bulkhead
                    .as_ref()
                    .map(|bulkhead_config| Bulkhead::new(name, bulkhead_config.clone()))
                    .transpose()?;
                entry.insert(bulkhead.clone());
                Ok(bulkhead)
            }
        }
    }
}

/// Await `fut` unless `cancel` fires first
async fn until_cancelled<F: Future>(
    fut: F,
    cancel: Option<&CancellationToken>,
) -> Option<F::Output> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => None,
            output = fut => Some(output),
        },
        None => Some(fut.await),
    }
}

/// A resource name bound to its config
///
/// ```
/// use tool_resilience::{ResilienceConfig, ResilientInvoker};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let users = ResilientInvoker::default().resource("users", ResilienceConfig::fast());
/// let id = users.call(|| async { Ok::<_, std::io::Error>(7) }).await.unwrap();
/// assert_eq!(id, 7);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ProtectedResource {
    invoker: ResilientInvoker,
    name: String,
    config: Arc<ResilienceConfig>,
}

impl ProtectedResource {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        self.invoker.protect(&self.name, op, &self.config).await
    }

    pub async fn call_cancellable<F, Fut, T, E>(
        &self,
        op: F,
        cancel: &CancellationToken,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        self.invoker
            .protect_cancellable(&self.name, op, &self.config, cancel)
            .await
    }

    /// The breaker guarding this resource, created if needed
    pub fn breaker(&self) -> Result<CircuitBreaker, ConfigError> {
        self.invoker
            .registry
            .get_or_create(&self.name, &self.config.breaker)
    }
}
