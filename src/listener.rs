//! State-change notifications
//!
//! Breakers call their listeners synchronously, after releasing their own lock,
//! with `(name, from, to)` for every transition. Listeners are advisory: they
//! feed dashboards and alerting and must return quickly. A listener that
//! panics is logged and otherwise ignored.

use crate::circuit_breaker::CircuitState;
use parking_lot::RwLock;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Receives circuit breaker transitions
pub trait StateChangeListener: Send + Sync {
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState);
}

impl<F> StateChangeListener for F
where
    F: Fn(&str, CircuitState, CircuitState) + Send + Sync,
{
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState) {
        self(name, from, to)
    }
}

/// Logs every transition through `tracing`
///
/// Opening is logged at `warn`, everything else at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl StateChangeListener for TracingListener {
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState) {
        if to == CircuitState::Open {
            tracing::warn!(circuit = name, %from, %to, "circuit opened");
        } else {
            tracing::info!(circuit = name, %from, %to, "circuit state changed");
        }
    }
}

/// Shared, growable list of listeners
#[derive(Clone, Default)]
pub struct ListenerSet {
    listeners: Arc<RwLock<Vec<Arc<dyn StateChangeListener>>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn StateChangeListener>) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Call every listener. The list is copied first so a listener may
    /// register further listeners without deadlocking.
    pub fn notify(&self, name: &str, from: CircuitState, to: CircuitState) {
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| {
                listener.on_state_change(name, from, to)
            }));
            if result.is_err() {
                tracing::error!(circuit = name, %from, %to, "state change listener panicked");
            }
        }
    }
}

impl StateChangeListener for ListenerSet {
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState) {
        self.notify(name, from, to)
    }
}

impl fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_closure_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let set = ListenerSet::new();
        {
            let seen = Arc::clone(&seen);
            set.add(Arc::new(move |name: &str, from: CircuitState, to: CircuitState| {
                seen.lock().push((name.to_string(), from, to));
            }));
        }

        set.notify("db", CircuitState::Closed, CircuitState::Open);
        assert_eq!(
            *seen.lock(),
            vec![("db".to_string(), CircuitState::Closed, CircuitState::Open)]
        );
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let calls = Arc::new(Mutex::new(0));
        let set = ListenerSet::new();
        set.add(Arc::new(|_: &str, _: CircuitState, _: CircuitState| {
            panic!("listener bug")
        }));
        {
            let calls = Arc::clone(&calls);
            set.add(Arc::new(move |_: &str, _: CircuitState, _: CircuitState| {
                *calls.lock() += 1
            }));
        }

        set.notify("db", CircuitState::Open, CircuitState::HalfOpen);
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn test_listener_may_register_listener() {
        let set = ListenerSet::new();
        {
            let inner = set.clone();
            set.add(Arc::new(move |_: &str, _: CircuitState, _: CircuitState| {
                inner.add(Arc::new(TracingListener))
            }));
        }
        set.notify("db", CircuitState::HalfOpen, CircuitState::Closed);
        assert_eq!(set.len(), 2);
    }
}
