//! End-to-end breaker lifecycle through the invoker
//!
//! Test Strategy:
//! 1. Trip breaker "db" with three consecutive failures
//! 2. Verify the next call is rejected without running the operation
//! 3. Advance the paused clock past the recovery timeout
//! 4. Verify a successful probe closes the breaker again
//! 5. Check listeners and the registry snapshot saw every step

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tool_resilience::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct DbError;

impl Classify for DbError {
    fn failure_kind(&self) -> FailureKind {
        FailureKind::Connection
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn db_config() -> ResilienceConfig {
    ResilienceConfig {
        max_attempts: 1,
        breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_db_breaker_lifecycle() {
    init_tracing();
    let registry = CircuitRegistry::new();
    let invoker = ResilientInvoker::new(registry.clone());
    let config = db_config();

    let transitions = Arc::new(Mutex::new(Vec::new()));
    {
        let transitions = Arc::clone(&transitions);
        registry.on_state_change(Arc::new(
            move |name: &str, from: CircuitState, to: CircuitState| {
                transitions.lock().push((name.to_string(), from, to));
            },
        ));
    }
    registry.on_state_change(Arc::new(TracingListener));

    // Three consecutive failures open the breaker
    for _ in 0..3 {
        let result: Result<(), _> = invoker
            .protect("db", || async { Err(DbError) }, &config)
            .await;
        assert!(matches!(
            result,
            Err(ResilienceError::RetriesExhausted { attempts: 1, .. })
        ));
    }
    assert_eq!(
        registry.get("db").unwrap().get_state(),
        CircuitState::Open
    );

    // The 4th call is refused without executing the operation
    let executed = AtomicBool::new(false);
    let rejected = invoker
        .protect(
            "db",
            || {
                executed.store(true, Ordering::SeqCst);
                async { Ok::<_, DbError>(()) }
            },
            &config,
        )
        .await;
    match rejected {
        Err(ResilienceError::CircuitOpen { name, retry_in }) => {
            assert_eq!(name, "db");
            assert_eq!(retry_in, Some(Duration::from_secs(30)));
        }
        other => panic!("expected CircuitOpen, got {other:?}"),
    }
    assert!(!executed.load(Ordering::SeqCst));

    tokio::time::advance(Duration::from_secs(31)).await;

    // The 5th call is admitted as a probe, succeeds, and closes the breaker
    let value = invoker
        .protect("db", || async { Ok::<_, DbError>("row") }, &config)
        .await
        .unwrap();
    assert_eq!(value, "row");

    let breaker = registry.get("db").unwrap();
    assert_eq!(breaker.get_state(), CircuitState::Closed);
    assert_eq!(breaker.get_failure_count(), 0);

    assert_eq!(
        *transitions.lock(),
        vec![
            ("db".to_string(), CircuitState::Closed, CircuitState::Open),
            ("db".to_string(), CircuitState::Open, CircuitState::HalfOpen),
            ("db".to_string(), CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_probe_reopens_for_full_timeout() {
    let invoker = ResilientInvoker::new(CircuitRegistry::new());
    let config = db_config();

    for _ in 0..3 {
        let _: Result<(), _> = invoker
            .protect("db", || async { Err(DbError) }, &config)
            .await;
    }
    tokio::time::advance(Duration::from_secs(31)).await;

    let probe: Result<(), _> = invoker
        .protect("db", || async { Err(DbError) }, &config)
        .await;
    assert!(probe.unwrap_err().operation_ran());

    let breaker = invoker.registry().get("db").unwrap();
    assert_eq!(breaker.get_state(), CircuitState::Open);
    assert_eq!(breaker.remaining_open(), Some(Duration::from_secs(30)));

    tokio::time::advance(Duration::from_secs(29)).await;
    let still_open = invoker
        .protect("db", || async { Ok::<_, DbError>(()) }, &config)
        .await;
    assert!(still_open.unwrap_err().is_fail_fast());
}

#[tokio::test(start_paused = true)]
async fn test_registry_snapshot_for_dashboards() {
    let invoker = ResilientInvoker::new(CircuitRegistry::new());
    let config = db_config();

    invoker
        .protect("cache", || async { Ok::<_, DbError>(()) }, &config)
        .await
        .unwrap();
    for _ in 0..3 {
        let _: Result<(), _> = invoker
            .protect("db", || async { Err(DbError) }, &config)
            .await;
    }

    let snapshot = invoker.registry().snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot["cache"].success_count, 1);
    assert_eq!(snapshot["db"].state, CircuitState::Open);
    assert_eq!(snapshot["db"].failure_count, 3);

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["db"]["state"], "open");
    assert_eq!(json["cache"]["state"], "closed");

    invoker.registry().reset_all();
    assert!(invoker
        .registry()
        .get_all_states()
        .values()
        .all(|state| *state == CircuitState::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_global_instances_share_breakers() {
    let config = db_config();
    ResilientInvoker::global()
        .protect("global-e2e", || async { Ok::<_, DbError>(()) }, &config)
        .await
        .unwrap();

    let from_registry = CircuitRegistry::global().get("global-e2e").unwrap();
    let again = CircuitRegistry::global()
        .get_or_create("global-e2e", &config.breaker)
        .unwrap();
    assert!(from_registry.ptr_eq(&again));
    assert_eq!(from_registry.get_success_count(), 1);
}
