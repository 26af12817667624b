//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use contract_runtime_common::{EngineConfig, PoolConfig, RuntimeConfig, RuntimeError};
use contract_runtime_core::{InstancePool, InstanceState, PoolStats, WasmEngine};
use contract_runtime_host::register_all;
use wasmtime::Linker;

/// Guest following the calling convention.
///
/// `allocate` always hands out offset 1024 and remembers the length so
/// `echo` can publish the encoded parameters back. `deallocate` reports to
/// the `test.on_deallocate` hook.
pub const CONTRACT_WAT: &str = r#"
    (module
        (import "env" "set_output" (func $set_output (param i32 i32)))
        (import "env" "log" (func $log (param i32 i32 i32)))
        (import "test" "on_deallocate" (func $on_deallocate))
        (memory (export "memory") 1)
        (global $last_len (mut i32) (i32.const 0))
        (data (i32.const 16) "ok")
        (data (i32.const 32) "greeting")
        (func (export "runtime_type") (result i32) (i32.const 2))
        (func (export "allocate") (param $len i32) (result i32)
            (global.set $last_len (local.get $len))
            (i32.const 1024))
        (func (export "deallocate") (param i32)
            (call $on_deallocate))
        (func (export "noop"))
        (func (export "greet")
            (call $log (i32.const 1) (i32.const 32) (i32.const 8))
            (call $set_output (i32.const 16) (i32.const 2)))
        (func (export "echo")
            (call $set_output (i32.const 1024) (global.get $last_len)))
        (func (export "with_result") (result i32)
            (i32.const 7))
        (func (export "fail")
            unreachable)
        (func (export "spin")
            (loop $again (br $again)))
        (func (export "init_contract")
            unreachable))
"#;

/// Same guest without the dispatch export.
pub const NO_DISPATCH_WAT: &str = r#"
    (module
        (memory (export "memory") 1)
        (func (export "allocate") (param i32) (result i32) (i32.const 1024))
        (func (export "deallocate") (param i32))
        (func (export "noop")))
"#;

pub fn engine() -> WasmEngine {
    WasmEngine::new(&EngineConfig {
        pooling_allocator: false,
        ..Default::default()
    })
    .unwrap()
}

/// Register the host functions plus the deallocation hook.
pub fn register(
    linker: &mut Linker<InstanceState>,
    deallocated: &Arc<AtomicUsize>,
) -> Result<(), RuntimeError> {
    register_all(linker)?;
    let deallocated = Arc::clone(deallocated);
    linker
        .func_wrap("test", "on_deallocate", move || {
            deallocated.fetch_add(1, Ordering::SeqCst);
        })
        .map_err(|e| RuntimeError::invalid_config(e.to_string()))?;
    Ok(())
}

pub fn linker(engine: &WasmEngine) -> (Arc<Linker<InstanceState>>, Arc<AtomicUsize>) {
    let deallocated = Arc::new(AtomicUsize::new(0));
    let mut linker = Linker::new(engine.inner());
    register(&mut linker, &deallocated).unwrap();
    (Arc::new(linker), deallocated)
}

/// Pool settings with autoscaling on delay disabled.
pub fn quiet_pool(min_size: usize, max_size: usize) -> PoolConfig {
    PoolConfig {
        min_size,
        max_size,
        grow_step: 2,
        delay_tolerance_ms: 60_000,
        grow_threshold: 0,
        ..Default::default()
    }
}

pub fn runtime_config(pool: PoolConfig) -> RuntimeConfig {
    RuntimeConfig {
        engine: EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        },
        pool,
        ..Default::default()
    }
}

/// Pool for [`CONTRACT_WAT`] plus its deallocation counter.
pub async fn contract_pool(pool: PoolConfig) -> (InstancePool, Arc<AtomicUsize>) {
    let engine = engine();
    let (linker, deallocated) = linker(&engine);
    let config = runtime_config(pool);
    let pool = InstancePool::create(
        contract_runtime_common::ContractId::new("counter", "1.0.0"),
        wat::parse_str(CONTRACT_WAT).unwrap().as_slice(),
        &engine,
        linker,
        &config,
    )
    .await
    .unwrap();
    (pool, deallocated)
}

/// Poll the pool until `pred` holds, panicking after five seconds.
pub async fn wait_for(pool: &InstancePool, pred: impl Fn(&PoolStats) -> bool) -> PoolStats {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = pool.stats();
        if pred(&stats) {
            return stats;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "pool never reached expected state: {stats:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
