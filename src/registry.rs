//! Process-wide lookup of named circuit breakers
//!
//! Every caller that names the same resource shares one breaker. The first
//! `get_or_create` for a name decides its configuration; later calls with a
//! different config get the existing breaker back unchanged (the mismatch is
//! logged at debug level).
//!
//! Listeners registered with [`CircuitRegistry::on_state_change`] see the
//! transitions of every breaker in the registry, including breakers created
//! after the listener was added.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
use crate::error::ConfigError;
use crate::listener::{ListenerSet, StateChangeListener};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

static GLOBAL: OnceLock<CircuitRegistry> = OnceLock::new();

/// Concurrent map of breakers by name; clones share the same map
#[derive(Debug, Clone, Default)]
pub struct CircuitRegistry {
    breakers: Arc<DashMap<String, CircuitBreaker>>,
    listeners: ListenerSet,
}

impl CircuitRegistry {
    /// An empty registry, independent of the global one
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by the whole process
    pub fn global() -> &'static CircuitRegistry {
        GLOBAL.get_or_init(CircuitRegistry::new)
    }

    /// Return the breaker for `name`, creating it with `config` on first use.
    ///
    /// Concurrent first calls for the same name create exactly one breaker.
    /// The config is only validated when it is actually used.
    pub fn get_or_create(
        &self,
        name: &str,
        config: &CircuitBreakerConfig,
    ) -> Result<CircuitBreaker, ConfigError> {
        if let Some(existing) = self.breakers.get(name) {
            if existing.config() != config {
                tracing::debug!(
                    circuit = name,
                    "breaker already registered with a different config; keeping the original"
                );
            }
            return Ok(existing.clone());
        }

        let breaker = match self.breakers.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let breaker = CircuitBreaker::new(name, config.clone())?;
                breaker.add_listener(Arc::new(self.listeners.clone()));
                tracing::debug!(circuit = name, "registered circuit breaker");
                entry.insert(breaker).clone()
            }
        };
        Ok(breaker)
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.get(name).map(|entry| entry.clone())
    }

    /// Current state of every breaker, keyed by name
    pub fn get_all_states(&self) -> BTreeMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().get_state()))
            .collect()
    }

    /// Read-only view of every breaker for dashboards
    pub fn snapshot(&self) -> BTreeMap<String, CircuitSnapshot> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    /// Force every breaker closed
    pub fn reset_all(&self) {
        // Collect first: resetting notifies listeners, which may read the registry
        let breakers: Vec<CircuitBreaker> =
            self.breakers.iter().map(|entry| entry.value().clone()).collect();
        for breaker in breakers {
            breaker.reset();
        }
        tracing::info!(count = self.len(), "reset all circuit breakers");
    }

    /// Force one breaker closed; false when no breaker has that name
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Drop a breaker from the registry. Handles already held keep working;
    /// the next `get_or_create` starts from a fresh breaker.
    pub fn remove(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.remove(name).map(|(_, breaker)| breaker)
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Subscribe to the transitions of every breaker, present and future
    pub fn on_state_change(&self, listener: Arc<dyn StateChangeListener>) {
        self.listeners.add(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[test]
    fn test_get_or_create_returns_same_instance() {
        let registry = CircuitRegistry::new();
        let config = CircuitBreakerConfig::default();

        let first = registry.get_or_create("x", &config).unwrap();
        let second = registry.get_or_create("x", &config).unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_first_config_wins() {
        let registry = CircuitRegistry::new();
        let original = CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        let other = CircuitBreakerConfig {
            failure_threshold: 9,
            ..Default::default()
        };

        registry.get_or_create("db", &original).unwrap();
        let breaker = registry.get_or_create("db", &other).unwrap();
        assert_eq!(breaker.config().failure_threshold, 2);
    }

    #[test]
    fn test_invalid_config_registers_nothing() {
        let registry = CircuitRegistry::new();
        let bad = CircuitBreakerConfig {
            failure_rate_threshold: -0.1,
            ..Default::default()
        };
        assert!(registry.get_or_create("db", &bad).is_err());
        assert!(registry.get("db").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_states_and_snapshot() {
        let registry = CircuitRegistry::new();
        let config = CircuitBreakerConfig::default();
        registry.get_or_create("b", &config).unwrap();
        registry.get_or_create("a", &config).unwrap().force_open();

        let states = registry.get_all_states();
        assert_eq!(states["a"], CircuitState::Open);
        assert_eq!(states["b"], CircuitState::Closed);
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot["a"].state, CircuitState::Open);
        assert_eq!(snapshot["b"].failure_count, 0);
    }

    #[test]
    fn test_reset_and_remove() {
        let registry = CircuitRegistry::new();
        let config = CircuitBreakerConfig::default();
        let a = registry.get_or_create("a", &config).unwrap();
        let b = registry.get_or_create("b", &config).unwrap();
        a.force_open();
        b.force_open();

        assert!(registry.reset("a"));
        assert!(!registry.reset("missing"));
        assert_eq!(a.get_state(), CircuitState::Closed);
        assert_eq!(b.get_state(), CircuitState::Open);

        registry.reset_all();
        assert_eq!(b.get_state(), CircuitState::Closed);

        let removed = registry.remove("a").unwrap();
        assert!(removed.ptr_eq(&a));
        let fresh = registry.get_or_create("a", &config).unwrap();
        assert!(!fresh.ptr_eq(&a));
    }

    #[test]
    fn test_listener_reaches_existing_and_future_breakers() {
        let registry = CircuitRegistry::new();
        let config = CircuitBreakerConfig {
            recovery_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let early = registry.get_or_create("early", &config).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            registry.on_state_change(Arc::new(
                move |name: &str, _: CircuitState, to: CircuitState| {
                    seen.lock().push((name.to_string(), to));
                },
            ));
        }

        let late = registry.get_or_create("late", &config).unwrap();
        early.force_open();
        late.force_open();

        assert_eq!(
            *seen.lock(),
            vec![
                ("early".to_string(), CircuitState::Open),
                ("late".to_string(), CircuitState::Open),
            ]
        );
    }

    #[test]
    fn test_concurrent_get_or_create() {
        let registry = CircuitRegistry::new();
        let config = CircuitBreakerConfig::default();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let config = config.clone();
                std::thread::spawn(move || registry.get_or_create("shared", &config).unwrap())
            })
            .collect();
        let breakers: Vec<CircuitBreaker> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(registry.len(), 1);
        assert!(breakers.iter().all(|b| b.ptr_eq(&breakers[0])));
    }
}
