//! Bulkhead: bounded concurrency per protected resource
//!
//! A bulkhead is a counting semaphore with a bounded wait. A caller that cannot
//! get a slot within `max_wait` is turned away; that is resource contention,
//! reported as [`ResilienceError::BulkheadFull`], and is deliberately distinct
//! from a breaker refusing calls because the resource is failing.
//!
//! Slots are held by an RAII [`BulkheadPermit`]. Dropping the permit (including
//! dropping a cancelled future that owns it) releases the slot, so every exit
//! path releases exactly once.
//!
//! # Example
//!
//! ```
//! use tool_resilience::bulkhead::{Bulkhead, BulkheadConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bulkhead = Bulkhead::new("search", BulkheadConfig {
//!     max_concurrent: 1,
//!     max_wait: Duration::ZERO,
//! })
//! .unwrap();
//!
//! let permit = bulkhead.acquire(Duration::ZERO).await.expect("free slot");
//! assert!(bulkhead.try_acquire().is_none());
//!
//! permit.release();
//! assert!(bulkhead.try_acquire().is_some());
//! # }
//! ```
//!
//! [`ResilienceError::BulkheadFull`]: crate::ResilienceError::BulkheadFull

use crate::config::serde_secs;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Configuration for a bulkhead
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Maximum calls in flight at once
    pub max_concurrent: usize,

    /// How long a caller may wait for a slot
    #[serde(with = "serde_secs")]
    pub max_wait: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_wait: Duration::from_secs(1),
        }
    }
}

impl BulkheadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check_nonzero("max_concurrent", self.max_concurrent as u64)?;
        if self.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ConfigError::OutOfRange {
                field: "max_concurrent",
                value: self.max_concurrent as f64,
                expected: "<= Semaphore::MAX_PERMITS",
            });
        }
        Ok(())
    }
}

/// Point-in-time bulkhead counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BulkheadStats {
    pub in_flight: usize,
    pub max_concurrent: usize,
    /// Callers turned away since creation
    pub rejected: u64,
}

#[derive(Debug)]
struct Inner {
    name: String,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    in_flight: AtomicUsize,
    rejected: AtomicU64,
}

/// Bounded concurrency gate; cheap to clone, clones share the slots
#[derive(Debug, Clone)]
pub struct Bulkhead {
    inner: Arc<Inner>,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.into(),
                config,
                semaphore,
                in_flight: AtomicUsize::new(0),
                rejected: AtomicU64::new(0),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.inner.config
    }

    /// Wait up to `timeout` for a slot. `None` means the bulkhead stayed full.
    pub async fn acquire(&self, timeout: Duration) -> Option<BulkheadPermit> {
        if timeout.is_zero() {
            return self.try_acquire();
        }

        let semaphore = Arc::clone(&self.inner.semaphore);
        match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Some(self.admit(permit)),
            // Timed out, or the semaphore was closed
            _ => {
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Wait up to the configured `max_wait`
    pub async fn acquire_default(&self) -> Option<BulkheadPermit> {
        self.acquire(self.inner.config.max_wait).await
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<BulkheadPermit> {
        match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            Ok(permit) => Some(self.admit(permit)),
            Err(_) => {
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Calls currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Free slots
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            in_flight: self.in_flight(),
            max_concurrent: self.inner.config.max_concurrent,
            rejected: self.inner.rejected.load(Ordering::Relaxed),
        }
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> BulkheadPermit {
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        BulkheadPermit {
            inner: Arc::clone(&self.inner),
            _permit: permit,
        }
    }
}

/// A held bulkhead slot, released on drop
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct BulkheadPermit {
    inner: Arc<Inner>,
    _permit: OwnedSemaphorePermit,
}

impl BulkheadPermit {
    /// Release the slot now
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        // Runs before the semaphore permit field is dropped, so in_flight never
        // undercounts the semaphore.
        self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
