//! Integration tests for the connection pool and circuit breaker
//!
//! These tests drive the pool through the in-memory backend in the
//! scenarios operators care about: a failing backend, slow operations
//! competing with fast ones, and many more callers than connections.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sqlpool::backend::MemoryBackend;
use sqlpool::pool::{CircuitBreakerConfig, CircuitState, ConnectionPool, PoolConfig, PoolError, ReleaseOutcome, SlotClass};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn pool(config: PoolConfig) -> (Arc<ConnectionPool>, MemoryBackend) {
    let backend = MemoryBackend::new();
    let pool = Arc::new(ConnectionPool::new(config, Arc::new(backend.clone())));
    pool.register_backend("db1".to_string(), None);
    (pool, backend)
}

#[tokio::test(start_paused = true)]
async fn test_circuit_trips_fails_fast_and_probes_after_cooldown() {
    let (pool, backend) = pool(PoolConfig {
        max_connections: 10,
        circuit: CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_millis(60_000),
        },
        ..PoolConfig::default()
    });
    backend.set_healthy("db1", false);
    let deadline = Some(Duration::from_secs(1));

    for _ in 0..3 {
        let err = pool.acquire("db1", SlotClass::Fast, deadline).await.unwrap_err();
        assert!(matches!(err, PoolError::ValidationFailure { .. }), "unexpected {:?}", err);
    }
    let circuit_state = pool.backend("db1").unwrap().circuit().state();
    assert!(matches!(circuit_state, CircuitState::Open { .. }));

    let started = std::time::Instant::now();
    let err = pool.acquire("db1", SlotClass::Fast, deadline).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(5));
    assert!(matches!(err, PoolError::CircuitOpen { .. }));
    assert_eq!(backend.stats("db1").opened, 3);

    tokio::time::advance(Duration::from_millis(60_001)).await;
    backend.set_healthy("db1", true);

    let lease = pool.acquire("db1", SlotClass::Fast, deadline).await.unwrap();
    assert!(pool.backend("db1").unwrap().circuit().is_closed());
    pool.release(lease, ReleaseOutcome::Reusable).await;

    let stats = pool.get_stats("db1").unwrap();
    assert_eq!(stats.circuit_rejections, 1);
    assert_eq!(stats.circuit.open_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_probe_reopens_circuit() {
    let (pool, backend) = pool(PoolConfig {
        circuit: CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(10),
        },
        ..PoolConfig::default()
    });
    backend.set_healthy("db1", false);

    assert!(pool.acquire("db1", SlotClass::Fast, None).await.is_err());
    tokio::time::advance(Duration::from_secs(11)).await;

    let err = pool.acquire("db1", SlotClass::Fast, None).await.unwrap_err();
    assert!(matches!(err, PoolError::ValidationFailure { .. }));
    let err = pool.acquire("db1", SlotClass::Fast, None).await.unwrap_err();
    assert!(matches!(err, PoolError::CircuitOpen { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_slow_request_borrows_long_idle_fast_connection() {
    let (pool, _backend) = pool(PoolConfig {
        max_connections: 10,
        fast_timeout: Duration::from_millis(60_000),
        slow_timeout: Duration::from_millis(120_000),
        idle_borrow_threshold: Duration::from_millis(10_000),
        ..PoolConfig::default()
    });
    assert_eq!(pool.backend("db1").unwrap().capacities(), (8, 2));

    let slow_a = pool.acquire("db1", SlotClass::Slow, None).await.unwrap();
    let slow_b = pool.acquire("db1", SlotClass::Slow, None).await.unwrap();
    let fast = pool.acquire("db1", SlotClass::Fast, None).await.unwrap();
    let fast_id = fast.connection_id();
    pool.release(fast, ReleaseOutcome::Reusable).await;

    tokio::time::advance(Duration::from_millis(10_001)).await;

    let started = tokio::time::Instant::now();
    let borrowed = pool.acquire("db1", SlotClass::Slow, None).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert!(borrowed.is_borrowed());
    assert_eq!(borrowed.connection_id(), fast_id);
    assert_eq!(borrowed.class(), SlotClass::Slow);

    let stats = pool.get_stats("db1").unwrap();
    assert_eq!(stats.total_borrowed, 1);
    assert_eq!(stats.fast.leased, 1);
    assert_eq!(stats.slow.leased, 2);

    pool.release(borrowed, ReleaseOutcome::Reusable).await;
    assert_eq!(pool.get_stats("db1").unwrap().fast.idle, 1);
    pool.release(slow_a, ReleaseOutcome::Reusable).await;
    pool.release(slow_b, ReleaseOutcome::Reusable).await;
}

#[tokio::test(start_paused = true)]
async fn test_recently_used_fast_connection_is_not_borrowed() {
    let (pool, _backend) = pool(PoolConfig {
        max_connections: 10,
        slow_timeout: Duration::from_millis(2_000),
        ..PoolConfig::default()
    });

    let slow_a = pool.acquire("db1", SlotClass::Slow, None).await.unwrap();
    let slow_b = pool.acquire("db1", SlotClass::Slow, None).await.unwrap();
    let fast = pool.acquire("db1", SlotClass::Fast, None).await.unwrap();
    pool.release(fast, ReleaseOutcome::Reusable).await;

    let err = pool.acquire("db1", SlotClass::Slow, None).await.unwrap_err();
    assert!(matches!(err, PoolError::AcquisitionTimeout { class: SlotClass::Slow, .. }));

    pool.release(slow_a, ReleaseOutcome::Reusable).await;
    pool.release(slow_b, ReleaseOutcome::Reusable).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deadline_holds_with_many_more_callers_than_connections() {
    let (pool, _backend) = pool(PoolConfig {
        max_connections: 4,
        segregation_enabled: false,
        ..PoolConfig::default()
    });
    let deadline = Duration::from_millis(100);

    let callers = (0..64).map(|_| {
        let pool = pool.clone();
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            let result = pool.acquire("db1", SlotClass::Fast, Some(deadline)).await;
            let waited = started.elapsed();
            match result {
                Ok(lease) => {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    pool.release(lease, ReleaseOutcome::Reusable).await;
                    (waited, true)
                }
                Err(e) => {
                    assert!(matches!(e, PoolError::AcquisitionTimeout { .. }), "unexpected {:?}", e);
                    (waited, false)
                }
            }
        })
    });

    let results = futures::future::join_all(callers).await;
    let mut acquired = 0;
    let mut timed_out = 0;
    for result in results {
        let (waited, ok) = result.unwrap();
        assert!(waited < deadline + Duration::from_millis(50), "waited {:?}", waited);
        if ok {
            acquired += 1;
        } else {
            timed_out += 1;
        }
    }
    assert!(acquired >= 4);
    assert!(timed_out > 0);

    // Workers that lost their caller hand connections back
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = pool.get_stats("db1").unwrap();
    assert_eq!(stats.leased, 0);
    assert!(stats.total <= 4);
    assert!(stats.timeouts >= timed_out);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_never_exceeds_target_under_random_load() {
    let (pool, _backend) = pool(PoolConfig {
        max_connections: 5,
        ..PoolConfig::default()
    });
    let target = pool.backend("db1").unwrap().target();
    let done = Arc::new(AtomicBool::new(false));

    let checker = {
        let pool = pool.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let mut samples = 0u64;
            while !done.load(Ordering::Acquire) {
                let stats = pool.get_stats("db1").unwrap();
                assert!(stats.total <= target, "total {} over target {}", stats.total, target);
                assert!(stats.leased + stats.idle <= target);
                samples += 1;
                tokio::task::yield_now().await;
            }
            samples
        })
    };

    let workers = (0..32u64).map(|seed| {
        let pool = pool.clone();
        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..25 {
                let class = if rng.gen_bool(0.3) { SlotClass::Slow } else { SlotClass::Fast };
                let hold = Duration::from_millis(rng.gen_range(0..3));
                let broken = rng.gen_bool(0.1);
                let deadline = Some(Duration::from_millis(500));
                if let Ok(lease) = pool.acquire("db1", class, deadline).await {
                    tokio::time::sleep(hold).await;
                    let outcome = if broken { ReleaseOutcome::Broken } else { ReleaseOutcome::Reusable };
                    pool.release(lease, outcome).await;
                }
            }
        })
    });

    for worker in futures::future::join_all(workers).await {
        worker.unwrap();
    }
    done.store(true, Ordering::Release);
    assert!(checker.await.unwrap() > 0);

    let stats = pool.get_stats("db1").unwrap();
    assert_eq!(stats.leased, 0);
    assert!(stats.total <= target);
}
