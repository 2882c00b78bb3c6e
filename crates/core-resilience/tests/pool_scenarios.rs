//! End-to-end pool behavior
//!
//! Each test drives a real `Pool` against an in-memory downstream whose calls
//! are counted, so the assertions can tell apart calls that reached the
//! downstream from calls the pool refused on its own.

use breakwater_core_resilience::clock::ManualClock;
use breakwater_core_resilience::prelude::*;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct FakeClient;

fn factory() -> Arc<dyn ClientFactory<FakeClient, String>> {
    factory_fn(|| async { Ok(FakeClient) })
}

fn fail<'a>() -> BoxFuture<'a, Result<(), String>> {
    async { Err("500".to_string()) }.boxed()
}

/// Wait until `cond` holds, letting spawned tasks run in between
async fn settle(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}

#[tokio::test(start_paused = true)]
async fn test_sixth_caller_waits_for_a_release() {
    let config = PoolConfig::default()
        .with_connections(2, 5)
        .with_acquire_timeout(Duration::from_secs(1));
    let pool = Arc::new(
        Pool::new("slow-api", config, factory(), classify_all_retryable())
            .await
            .unwrap(),
    );

    let slow: Vec<_> = (0..5)
        .map(|i| {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.execute(Duration::from_secs(5), move |_client| {
                    async move {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(i)
                    }
                    .boxed()
                })
                .await
            })
        })
        .collect();

    settle(|| pool.get_metrics().active_connections == 5).await;
    assert_eq!(pool.get_metrics().pool_size, 5);

    let started = tokio::time::Instant::now();
    let sixth = pool
        .execute(Duration::from_secs(5), |_client| async { Ok(6) }.boxed())
        .await;
    assert_eq!(sixth.unwrap(), 6);
    assert!(started.elapsed() >= Duration::from_millis(200));

    for result in join_all(slow).await {
        assert!(result.unwrap().is_ok());
    }

    let metrics = pool.get_metrics();
    assert_eq!(metrics.total_requests, 6);
    assert_eq!(metrics.total_timeouts, 0);
    assert_eq!(metrics.pool_size, 5);
    assert_eq!(metrics.active_connections, 0);
}

#[tokio::test]
async fn test_open_circuit_stops_downstream_calls() {
    let config = PoolConfig::default()
        .with_max_retries(0)
        .with_circuit_breaker(3, Duration::from_secs(60));
    let pool = Pool::new("flaky-api", config, factory(), classify_all_retryable())
        .await
        .unwrap();
    let spy = AtomicU32::new(0);

    for _ in 0..3 {
        let result: Result<(), _> = pool
            .execute(Duration::from_secs(1), |_client| {
                spy.fetch_add(1, Ordering::SeqCst);
                async { Err("503 service unavailable".to_string()) }.boxed()
            })
            .await;
        assert!(matches!(result, Err(PoolError::Downstream { .. })));
    }
    assert_eq!(pool.circuit_state(), CircuitState::Open);

    let fourth: Result<(), _> = pool
        .execute(Duration::from_secs(1), |_client| {
            spy.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }.boxed()
        })
        .await;

    assert!(matches!(fourth, Err(PoolError::CircuitOpen)));
    assert!(fourth.unwrap_err().is_fast_fail());
    assert_eq!(spy.load(Ordering::SeqCst), 3);

    let metrics = pool.get_metrics();
    assert_eq!(metrics.total_rejections, 1);
    assert_eq!(metrics.total_errors, 3);
    assert_eq!(metrics.active_connections, 0);
    assert!(!pool.get_health().healthy);
}

#[tokio::test]
async fn test_probe_success_closes_circuit() {
    let clock = Arc::new(ManualClock::new());
    let config = PoolConfig::default()
        .with_max_retries(0)
        .with_circuit_breaker(1, Duration::from_millis(100));
    let pool = Pool::with_clock("llm", config, factory(), classify_all_retryable(), clock.clone())
        .await
        .unwrap();

    let failed: Result<(), _> = pool
        .execute(Duration::from_secs(1), |_client| async { Err("timeout".to_string()) }.boxed())
        .await;
    assert!(failed.is_err());
    assert_eq!(pool.circuit_state(), CircuitState::Open);

    clock.advance(Duration::from_millis(100));
    assert_eq!(pool.circuit_state(), CircuitState::HalfOpen);

    let probe = pool
        .execute(Duration::from_secs(1), |_client| async { Ok("pong") }.boxed())
        .await;
    assert_eq!(probe.unwrap(), "pong");
    assert_eq!(pool.circuit_state(), CircuitState::Closed);
    assert_eq!(pool.breaker().consecutive_failures(), 0);
}

#[tokio::test]
async fn test_failed_probe_reopens_with_fresh_cooldown() {
    let clock = Arc::new(ManualClock::new());
    let config = PoolConfig::default()
        .with_max_retries(0)
        .with_circuit_breaker(1, Duration::from_millis(100));
    let pool = Pool::with_clock("llm", config, factory(), classify_all_retryable(), clock.clone())
        .await
        .unwrap();

    let _ = pool.execute(Duration::from_secs(1), |_client| fail()).await;
    clock.advance(Duration::from_millis(250));

    let probe = pool.execute(Duration::from_secs(1), |_client| fail()).await;
    assert!(matches!(probe, Err(PoolError::Downstream { .. })));
    assert_eq!(pool.circuit_state(), CircuitState::Open);

    // Cooldown counts from the failed probe, not from the first opening
    clock.advance(Duration::from_millis(99));
    let early = pool.execute(Duration::from_secs(1), |_client| fail()).await;
    assert!(matches!(early, Err(PoolError::CircuitOpen)));

    clock.advance(Duration::from_millis(1));
    assert_eq!(pool.circuit_state(), CircuitState::HalfOpen);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_lets_exactly_one_probe_through() {
    let clock = Arc::new(ManualClock::new());
    let config = PoolConfig::default()
        .with_max_retries(0)
        .with_circuit_breaker(1, Duration::from_millis(100));
    let pool = Arc::new(
        Pool::with_clock("search", config, factory(), classify_all_retryable(), clock.clone())
            .await
            .unwrap(),
    );
    let spy = Arc::new(AtomicU32::new(0));

    let _ = pool
        .execute(Duration::from_secs(1), |_client| async { Err::<(), _>("down".to_string()) }.boxed())
        .await;
    clock.advance(Duration::from_millis(100));

    let probe = {
        let pool = pool.clone();
        let spy = spy.clone();
        tokio::spawn(async move {
            pool.execute(Duration::from_secs(5), move |_client| {
                spy.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(())
                }
                .boxed()
            })
            .await
        })
    };
    settle(|| pool.breaker().probe_in_flight()).await;

    let concurrent = pool
        .execute(Duration::from_secs(5), |_client| {
            spy.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }.boxed()
        })
        .await;
    assert!(matches!(concurrent, Err(PoolError::CircuitOpen)));

    assert!(probe.await.unwrap().is_ok());
    assert_eq!(spy.load(Ordering::SeqCst), 1);
    assert_eq!(pool.circuit_state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_timeout_is_prompt_and_not_a_failure() {
    let config = PoolConfig::default()
        .with_connections(1, 1)
        .with_circuit_breaker(1, Duration::from_secs(30));
    let pool = Pool::new("single", config, factory(), classify_all_retryable())
        .await
        .unwrap();

    let held = pool.acquire().await.unwrap();

    let started = tokio::time::Instant::now();
    let result = pool.acquire_timeout(Duration::from_millis(50)).await;
    let waited = started.elapsed();

    assert!(matches!(result, Err(PoolError::AcquireTimeout(_))));
    assert!(waited >= Duration::from_millis(50));
    assert!(waited < Duration::from_millis(70));

    let metrics = pool.get_metrics();
    assert_eq!(metrics.total_timeouts, 1);
    assert_eq!(metrics.total_errors, 0);
    assert_eq!(pool.breaker().consecutive_failures(), 0);
    assert_eq!(pool.circuit_state(), CircuitState::Closed);

    held.release().unwrap();
    assert_eq!(pool.get_metrics().available_connections, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_caller_still_returns_its_slot() {
    let config = PoolConfig::default().with_connections(1, 1);
    let pool = Pool::new("cancel", config, factory(), classify_all_retryable())
        .await
        .unwrap();

    let call = pool.execute(Duration::from_secs(10), |_client| {
        async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
        .boxed()
    });
    let abandoned = tokio::time::timeout(Duration::from_millis(100), call).await;
    assert!(abandoned.is_err());

    let metrics = pool.get_metrics();
    assert_eq!(metrics.active_connections, 0);
    assert_eq!(metrics.available_connections, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_operations_leave_no_leak() {
    const CALLERS: usize = 50;
    const OPS_PER_CALLER: usize = 20;
    const MAX: usize = 8;

    let config = PoolConfig::default()
        .with_connections(2, MAX)
        .with_acquire_timeout(Duration::from_secs(10))
        .with_max_retries(1)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(2))
        .without_circuit_breaker();
    let pool = Arc::new(
        Pool::new("busy", config, factory(), classify_all_retryable())
            .await
            .unwrap(),
    );
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let callers: Vec<_> = (0..CALLERS)
        .map(|caller| {
            let pool = pool.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                for op in 0..OPS_PER_CALLER {
                    let seed = caller * 31 + op * 17;

                    if seed % 5 == 0 {
                        // Raw lease, sometimes dropped instead of released
                        let lease = pool.acquire().await.unwrap();
                        tokio::task::yield_now().await;
                        if seed % 2 == 0 {
                            lease.release().unwrap();
                        } else {
                            drop(lease);
                        }
                        continue;
                    }

                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    let _ = pool
                        .execute(Duration::from_secs(1), move |_client| {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            let in_flight = in_flight.clone();
                            async move {
                                tokio::time::sleep(Duration::from_micros((seed % 3) as u64 * 200)).await;
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                                if seed % 3 == 0 {
                                    Err(format!("transient failure {seed}"))
                                } else {
                                    Ok(seed)
                                }
                            }
                            .boxed()
                        })
                        .await;

                    let metrics = pool.get_metrics();
                    assert!(metrics.active_connections <= MAX);
                    assert_eq!(
                        metrics.available_connections + metrics.active_connections,
                        metrics.pool_size
                    );
                }
            })
        })
        .collect();

    for caller in join_all(callers).await {
        caller.unwrap();
    }

    let metrics = pool.get_metrics();
    assert_eq!(metrics.active_connections, 0);
    assert_eq!(metrics.available_connections, metrics.pool_size);
    assert!(metrics.pool_size <= MAX);
    assert!(peak.load(Ordering::SeqCst) <= MAX);
    assert_eq!(metrics.total_timeouts, 0);
}

#[tokio::test]
async fn test_shared_registry_pool_survives_until_shutdown() {
    let registry: Arc<PoolRegistry<FakeClient, String>> = Arc::new(PoolRegistry::new());

    let first = registry
        .get_or_create("llm", PoolConfig::default(), factory(), classify_all_retryable())
        .await
        .unwrap();
    let second = registry
        .get_or_create("llm", PoolConfig::batch_profile(), factory(), classify_all_retryable())
        .await
        .unwrap();

    // The first registration wins; later configs are ignored
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.config(), &PoolConfig::default());

    let answer = second
        .execute(Duration::from_secs(1), |_client| async { Ok(42) }.boxed())
        .await
        .unwrap();
    assert_eq!(answer, 42);

    assert!(registry.shutdown_all(Duration::from_millis(100)).await);
    let after: Result<i32, _> = first
        .execute(Duration::from_secs(1), |_client| async { Ok(0) }.boxed())
        .await;
    assert!(matches!(after, Err(PoolError::PoolClosed)));
}
