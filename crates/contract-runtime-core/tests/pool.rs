//! Integration tests for the instance pool.
//!
//! These tests exercise the pool's control loop against real instances:
//! - Warm-up, acquire and release
//! - Growth on demand and shrinking on refresh
//! - Discard-and-replace of unhealthy instances
//! - Reset and close
//! - Unpooled instances for nested calls

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::{contract_pool, engine, linker, quiet_pool, runtime_config, wait_for};
use contract_runtime_common::{ContractId, PoolConfig, RuntimeError};
use contract_runtime_core::InstancePool;
use parking_lot::Mutex;
use tokio_test::{assert_err, assert_ok};

// ============================================================================
// Test: Warm-up and acquire/release
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_warms_up_to_min_size() {
    let (pool, _) = contract_pool(PoolConfig::default()).await;

    let stats = wait_for(&pool, |s| s.current_size == 5 && s.idle == 5).await;
    assert_eq!(stats.discarded, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_acquire_release_closed_loop() {
    let (pool, _) = contract_pool(quiet_pool(3, 3)).await;
    wait_for(&pool, |s| s.idle == 3).await;

    let a = assert_ok!(pool.acquire().await);
    let b = assert_ok!(pool.acquire().await);
    let stats = pool.stats();
    assert_eq!(stats.current_size, 3);
    assert_eq!(stats.idle, 1);
    assert!(stats.idle <= stats.current_size);

    drop(a);
    drop(b);
    let stats = pool.stats();
    assert_eq!(stats.idle, 3);
    assert_eq!(stats.use_count, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_instance_handed_out_twice() {
    let (pool, _) = contract_pool(quiet_pool(5, 5)).await;
    wait_for(&pool, |s| s.idle == 5).await;

    let guards = futures::future::join_all((0..5).map(|_| pool.acquire())).await;
    let ids: HashSet<_> = guards
        .iter()
        .map(|g| g.as_ref().unwrap().id())
        .collect();

    assert_eq!(ids.len(), 5);
    assert_eq!(pool.stats().idle, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exclusive_checkout_under_churn_and_reset() {
    const MAX_SIZE: usize = 4;
    let (pool, deallocated) = contract_pool(quiet_pool(2, MAX_SIZE)).await;
    let pool = Arc::new(pool);
    wait_for(&pool, |s| s.idle == 2).await;

    let in_use = Arc::new(Mutex::new(HashSet::new()));
    let stop = Arc::new(AtomicBool::new(false));

    let workers: Vec<_> = (0..16)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let in_use = Arc::clone(&in_use);
            let stop = Arc::clone(&stop);
            tokio::spawn(async move {
                let mut rounds = 0_u32;
                while rounds < 50 || !stop.load(Ordering::SeqCst) {
                    let guard = pool.acquire().await.unwrap();
                    let id = guard.id();
                    assert!(in_use.lock().insert(id), "instance {id} checked out twice");

                    let stats = pool.stats();
                    assert!(stats.current_size <= MAX_SIZE, "{stats:?}");
                    assert!(stats.idle <= stats.current_size, "{stats:?}");

                    tokio::task::yield_now().await;
                    assert!(in_use.lock().remove(&id));
                    drop(guard);
                    rounds += 1;
                }
                rounds
            })
        })
        .collect();

    // Resets finish while the workers keep every instance busy
    let resets = futures::future::join_all((0..3).map(|_| pool.reset()));
    let results = tokio::time::timeout(Duration::from_secs(10), resets)
        .await
        .expect("reset stalled under load");
    for result in results {
        assert_ok!(result);
    }
    stop.store(true, Ordering::SeqCst);

    for worker in workers {
        assert!(worker.await.unwrap() >= 50);
    }

    let stats = wait_for(&pool, |s| s.idle == s.current_size).await;
    assert!(stats.current_size >= 2 && stats.current_size <= MAX_SIZE);
    assert!(deallocated.load(Ordering::SeqCst) >= 6);
    assert!(in_use.lock().is_empty());
}

// ============================================================================
// Test: Autoscaling
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_grow_on_demand_capped_at_max() {
    let config = PoolConfig {
        acquire_timeout_ms: Some(500),
        ..quiet_pool(2, 4)
    };
    let (pool, _) = contract_pool(config).await;
    wait_for(&pool, |s| s.idle == 2).await;

    let _a = assert_ok!(pool.acquire().await);
    let _b = assert_ok!(pool.acquire().await);

    // Empty queue: demand triggers one grow step
    let _c = assert_ok!(pool.acquire().await);
    wait_for(&pool, |s| s.current_size == 4).await;
    let _d = assert_ok!(pool.acquire().await);

    // At max_size: demand cannot grow the pool any further
    let err = assert_err!(pool.acquire().await);
    assert!(matches!(err, RuntimeError::AcquireTimeout { .. }));
    assert_eq!(pool.stats().current_size, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shrink_on_refresh_floored_at_min() {
    let config = PoolConfig {
        refresh_interval_secs: 1,
        ..quiet_pool(2, 6)
    };
    let (pool, deallocated) = contract_pool(config).await;
    wait_for(&pool, |s| s.idle == 2).await;

    let guards = vec![
        assert_ok!(pool.acquire().await),
        assert_ok!(pool.acquire().await),
        assert_ok!(pool.acquire().await),
    ];
    wait_for(&pool, |s| s.current_size == 4).await;
    drop(guards);

    wait_for(&pool, |s| s.current_size == 2).await;
    assert_eq!(deallocated.load(Ordering::SeqCst), 2);

    // Later ticks leave the pool at min_size
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let stats = pool.stats();
    assert_eq!(stats.current_size, 2);
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.use_count, 0);
}

// ============================================================================
// Test: Discard and replace
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unhealthy_instance_is_replaced() {
    let config = PoolConfig {
        discard_threshold: 1,
        ..quiet_pool(2, 2)
    };
    let (pool, deallocated) = contract_pool(config).await;
    wait_for(&pool, |s| s.idle == 2).await;

    let mut guard = assert_ok!(pool.acquire().await);
    let unhealthy = guard.id();
    guard.record_error();
    guard.record_error();
    drop(guard);

    let stats = wait_for(&pool, |s| s.discarded == 1 && s.idle == 2).await;
    assert_eq!(stats.current_size, 2);
    assert_eq!(deallocated.load(Ordering::SeqCst), 1);

    let a = assert_ok!(pool.acquire().await);
    let b = assert_ok!(pool.acquire().await);
    assert_ne!(a.id(), unhealthy);
    assert_ne!(b.id(), unhealthy);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_errors_at_threshold_keep_instance() {
    let config = PoolConfig {
        discard_threshold: 1,
        ..quiet_pool(1, 1)
    };
    let (pool, _) = contract_pool(config).await;
    wait_for(&pool, |s| s.idle == 1).await;

    let mut guard = assert_ok!(pool.acquire().await);
    let id = guard.id();
    guard.record_error();
    drop(guard);

    let guard = assert_ok!(pool.acquire().await);
    assert_eq!(guard.id(), id);
    assert_eq!(guard.error_count(), 1);
    assert_eq!(pool.stats().discarded, 0);
}

// ============================================================================
// Test: Reset and close
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reset_recycles_every_instance() {
    let (pool, deallocated) = contract_pool(quiet_pool(2, 2)).await;
    wait_for(&pool, |s| s.idle == 2).await;

    let before: HashSet<_> = {
        let a = assert_ok!(pool.acquire().await);
        let b = assert_ok!(pool.acquire().await);
        [a.id(), b.id()].into_iter().collect()
    };

    assert_ok!(pool.reset().await);
    assert_eq!(deallocated.load(Ordering::SeqCst), 2);

    let a = assert_ok!(pool.acquire().await);
    let b = assert_ok!(pool.acquire().await);
    assert!(!before.contains(&a.id()));
    assert!(!before.contains(&b.id()));
    assert_eq!(pool.stats().current_size, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_waits_for_checked_out_instances() {
    let (pool, deallocated) = contract_pool(PoolConfig::default()).await;
    let pool = Arc::new(pool);
    wait_for(&pool, |s| s.idle == 5).await;

    let guard = assert_ok!(pool.acquire().await);

    let closing = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.close().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!closing.is_finished());

    let err = assert_err!(pool.acquire().await);
    assert!(matches!(err, RuntimeError::PoolClosed { .. }));

    drop(guard);
    closing.await.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.current_size, 0);
    assert_eq!(stats.idle, 0);
    assert!(pool.is_closed());
    assert_eq!(deallocated.load(Ordering::SeqCst), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reset_after_close_fails() {
    let (pool, _) = contract_pool(quiet_pool(1, 1)).await;
    pool.close().await;

    let err = assert_err!(pool.reset().await);
    assert!(matches!(err, RuntimeError::PoolClosed { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropping_pool_closes_instances() {
    let (pool, deallocated) = contract_pool(quiet_pool(3, 3)).await;
    wait_for(&pool, |s| s.idle == 3).await;

    drop(pool);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while deallocated.load(Ordering::SeqCst) < 3 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Test: Creation failures
// ============================================================================

#[tokio::test]
async fn test_create_rejects_invalid_byte_code() {
    let engine = engine();
    let (linker, _) = linker(&engine);

    let result = InstancePool::create(
        ContractId::new("broken", "1"),
        b"definitely not wasm",
        &engine,
        linker,
        &runtime_config(PoolConfig::default()),
    )
    .await;

    let err = assert_err!(result);
    assert!(matches!(err, RuntimeError::CompilationFailed { .. }));
}

#[tokio::test]
async fn test_create_rejects_unlinkable_module() {
    let engine = engine();
    let (linker, _) = linker(&engine);
    let byte_code = wat::parse_str(r#"(module (import "env" "missing" (func)))"#).unwrap();

    let result = InstancePool::create(
        ContractId::new("unlinkable", "1"),
        &byte_code,
        &engine,
        linker,
        &runtime_config(PoolConfig::default()),
    )
    .await;

    let err = assert_err!(result);
    assert!(matches!(err, RuntimeError::InstantiationFailed { .. }));
}

#[tokio::test]
async fn test_create_rejects_invalid_pool_config() {
    let engine = engine();
    let (linker, _) = linker(&engine);
    let byte_code = wat::parse_str(common::CONTRACT_WAT).unwrap();

    let result = InstancePool::create(
        ContractId::new("counter", "1"),
        &byte_code,
        &engine,
        linker,
        &runtime_config(quiet_pool(4, 2)),
    )
    .await;

    let err = assert_err!(result);
    assert!(matches!(err, RuntimeError::InvalidConfig { .. }));
}

// ============================================================================
// Test: Unpooled instances
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unpooled_instance_is_not_counted() {
    let (pool, deallocated) = contract_pool(quiet_pool(2, 2)).await;
    wait_for(&pool, |s| s.idle == 2).await;

    let instance = assert_ok!(pool.new_instance().await);
    let stats = pool.stats();
    assert_eq!(stats.current_size, 2);
    assert_eq!(stats.idle, 2);

    pool.close_instance(instance).await;
    assert_eq!(deallocated.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().current_size, 2);
    assert_eq!(pool.stats().idle, 2);

    pool.close().await;
    let err = assert_err!(pool.new_instance().await);
    assert!(matches!(err, RuntimeError::PoolClosed { .. }));
}
