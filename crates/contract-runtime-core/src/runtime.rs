//! Contract invocation façade and pool registry.
//!
//! - [`RuntimeInstance`]: runs one method call on a pooled instance of a
//!   single contract and turns every outcome into an [`InvocationResult`]
//! - [`ContractRuntime`]: owns the engine, the host-function linker and one
//!   [`RuntimeInstance`] per deployed contract

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{Level, debug, info, instrument, warn};
use wasmtime::Linker;

use crate::call::{CallContext, ContextCounter};
use crate::pool::{InstancePool, PoolStats};
use crate::store::InstanceState;
use crate::WasmEngine;
use contract_runtime_common::{
    AbiConfig, ContractId, ExecutionConfig, InvocationResult, Parameters, RuntimeConfig,
    RuntimeError, TxContext,
};

/// Runs method calls against one contract's instance pool.
pub struct RuntimeInstance {
    pool: InstancePool,
    counter: Arc<ContextCounter>,
    execution: ExecutionConfig,
    abi: AbiConfig,
}

impl RuntimeInstance {
    /// Wrap a pool. `counter` is shared by every contract of one runtime.
    pub fn new(
        pool: InstancePool,
        counter: Arc<ContextCounter>,
        execution: ExecutionConfig,
        abi: AbiConfig,
    ) -> Self {
        Self {
            pool,
            counter,
            execution,
            abi,
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &InstancePool {
        &self.pool
    }

    /// Invoke `method` with `parameters`.
    ///
    /// `gas_used` is the gas the transaction already consumed; the call runs
    /// with the rest of the configured limit. The returned `gas_used` is the
    /// transaction total after this call. Never fails: acquisition errors,
    /// traps, missing exports, exhausted gas and panics all become a result
    /// with status code `1`.
    #[instrument(skip(self, parameters, gas_used, tx), fields(contract = %self.pool.contract(), tx_id = %tx.tx_id))]
    pub async fn invoke(
        &self,
        method: &str,
        parameters: Parameters,
        gas_used: u64,
        tx: &TxContext,
    ) -> InvocationResult {
        let start = Instant::now();
        let gas_limit = self.execution.gas_limit;

        let mut instance = match self.pool.acquire().await {
            Ok(instance) => instance,
            Err(e) => {
                log_failure(&e, "Failed to acquire instance");
                return InvocationResult::failure(e.to_string(), gas_used);
            }
        };

        if let Err(e) = instance.set_gas_limit(gas_limit.saturating_sub(gas_used)) {
            return InvocationResult::failure(e.to_string(), gas_used);
        }

        let ctx = CallContext::new(
            self.pool.contract(),
            method,
            parameters,
            tx,
            &self.counter,
            &self.abi,
        );
        instance.state_mut().begin_call(ctx.context_ptr());

        let outcome = AssertUnwindSafe(ctx.call_method(&mut instance))
            .catch_unwind()
            .await;

        let remaining = instance.gas_remaining();
        let total_used = gas_limit.saturating_sub(remaining);
        let payload = instance.state_mut().finish_call();

        let error = match outcome {
            Ok(result) if remaining == 0 => {
                if let Err(e) = result {
                    debug!(error = %e, "Call failed with exhausted gas");
                }
                Some(RuntimeError::OutOfGas {
                    used: total_used,
                    limit: gas_limit,
                })
            }
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => {
                let message = format!("contract invoke panicked: {}", panic_message(&*panic));
                warn!(ctx_ptr = ctx.context_ptr(), %message, "Recovered from panic");
                instance.record_error();
                return InvocationResult::failure(message, total_used);
            }
        };

        let duration_ms = start.elapsed().as_millis();
        let Some(error) = error else {
            debug!(
                method,
                ctx_ptr = ctx.context_ptr(),
                gas_used = total_used,
                duration_ms,
                "Invocation succeeded"
            );
            return InvocationResult::success(payload, total_used);
        };

        if method != self.abi.init_method {
            instance.record_error();
        }
        let span = tracing::info_span!(
            "failure",
            method,
            ctx_ptr = ctx.context_ptr(),
            gas_used = total_used,
            duration_ms,
            errors = instance.error_count()
        );
        span.in_scope(|| log_failure(&error, "Invocation failed"));
        InvocationResult::failure(error.to_string(), total_used)
    }
}

/// Severity of a failed call in the node's log.
///
/// A missing method is the caller's mistake and a resource limit is the
/// contract running out of budget; neither points at the runtime.
fn failure_level(error: &RuntimeError) -> Level {
    if error.is_not_found() {
        Level::DEBUG
    } else if error.is_resource_limit() {
        Level::INFO
    } else {
        Level::WARN
    }
}

fn log_failure(error: &RuntimeError, message: &str) {
    match failure_level(error) {
        Level::DEBUG => debug!(%error, "{message}"),
        Level::INFO => info!(%error, "{message}"),
        _ => warn!(%error, "{message}"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Deployed {
    runtime: RuntimeInstance,
    last_used: Mutex<Instant>,
}

/// Registry of per-contract pools sharing one engine and linker.
///
/// Pools are created on first use and live until removed, evicted or
/// closed with [`ContractRuntime::close_all`].
pub struct ContractRuntime {
    engine: WasmEngine,
    linker: Arc<Linker<InstanceState>>,
    config: RuntimeConfig,
    counter: Arc<ContextCounter>,
    contracts: DashMap<ContractId, Arc<Deployed>>,
}

impl ContractRuntime {
    /// Create a runtime. `register` adds host functions to the linker every
    /// instance is created with.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the engine cannot
    /// be built or host function registration fails.
    pub fn new<F>(config: RuntimeConfig, register: F) -> Result<Self, RuntimeError>
    where
        F: FnOnce(&mut Linker<InstanceState>) -> Result<(), RuntimeError>,
    {
        config.validate()?;
        let engine = WasmEngine::new(&config.engine)?;
        let mut linker = Linker::new(engine.inner());
        register(&mut linker)?;

        Ok(Self {
            engine,
            linker: Arc::new(linker),
            config,
            counter: Arc::new(ContextCounter::new()),
            contracts: DashMap::new(),
        })
    }

    /// The shared engine.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    /// Runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Create the pool for `contract` unless it already exists.
    ///
    /// # Errors
    ///
    /// Returns the compile or instantiation error if the pool cannot be
    /// created.
    pub async fn deploy(&self, contract: &ContractId, byte_code: &[u8]) -> Result<(), RuntimeError> {
        self.get_or_create(contract, byte_code).await.map(|_| ())
    }

    /// Invoke `method` on `contract`, creating its pool from `byte_code` on
    /// first use.
    #[instrument(skip(self, contract, byte_code, parameters, gas_used, tx), fields(contract = %contract))]
    pub async fn invoke(
        &self,
        contract: &ContractId,
        method: &str,
        byte_code: &[u8],
        parameters: Parameters,
        gas_used: u64,
        tx: &TxContext,
    ) -> InvocationResult {
        let deployed = match self.get_or_create(contract, byte_code).await {
            Ok(deployed) => deployed,
            Err(e) => {
                warn!(error = %e, "Failed to create instance pool");
                return InvocationResult::failure(e.to_string(), gas_used);
            }
        };

        *deployed.last_used.lock() = Instant::now();
        deployed
            .runtime
            .invoke(method, parameters, gas_used, tx)
            .await
    }

    async fn get_or_create(
        &self,
        contract: &ContractId,
        byte_code: &[u8],
    ) -> Result<Arc<Deployed>, RuntimeError> {
        let existing = self.contracts.get(contract).map(|d| Arc::clone(d.value()));
        if let Some(deployed) = existing {
            return Ok(deployed);
        }

        let pool = InstancePool::create(
            contract.clone(),
            byte_code,
            &self.engine,
            Arc::clone(&self.linker),
            &self.config,
        )
        .await?;

        let created = Arc::new(Deployed {
            runtime: RuntimeInstance::new(
                pool,
                Arc::clone(&self.counter),
                self.config.execution.clone(),
                self.config.abi.clone(),
            ),
            last_used: Mutex::new(Instant::now()),
        });

        let winner = match self.contracts.entry(contract.clone()) {
            Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&created));
                None
            }
        };

        match winner {
            Some(winner) => {
                // Lost a creation race
                created.runtime.pool().close().await;
                Ok(winner)
            }
            None => Ok(created),
        }
    }

    /// Returns `true` if `contract` has a pool.
    pub fn contains(&self, contract: &ContractId) -> bool {
        self.contracts.contains_key(contract)
    }

    /// Ids of every deployed contract.
    pub fn contracts(&self) -> Vec<ContractId> {
        self.contracts.iter().map(|e| e.key().clone()).collect()
    }

    /// Counters of `contract`'s pool.
    pub fn pool_stats(&self, contract: &ContractId) -> Option<PoolStats> {
        self.contracts
            .get(contract)
            .map(|d| d.runtime.pool().stats())
    }

    /// Remove and close `contract`'s pool. Returns `false` if it had none.
    pub async fn remove(&self, contract: &ContractId) -> bool {
        let Some((_, deployed)) = self.contracts.remove(contract) else {
            return false;
        };
        deployed.runtime.pool().close().await;
        info!(contract = %contract, "Contract removed");
        true
    }

    /// Recycle every instance of `contract`. Returns `false` if it had no pool.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::PoolClosed`] if the pool closed during the reset.
    pub async fn reset(&self, contract: &ContractId) -> Result<bool, RuntimeError> {
        let deployed = self.contracts.get(contract).map(|d| Arc::clone(d.value()));
        match deployed {
            Some(deployed) => deployed.runtime.pool().reset().await.map(|()| true),
            None => Ok(false),
        }
    }

    /// Close pools not invoked within `max_idle`. Returns how many were closed.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let stale: Vec<ContractId> = self
            .contracts
            .iter()
            .filter(|e| e.value().last_used.lock().elapsed() > max_idle)
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for contract in stale {
            let removed = self
                .contracts
                .remove_if(&contract, |_, d| d.last_used.lock().elapsed() > max_idle);
            if let Some((_, deployed)) = removed {
                deployed.runtime.pool().close().await;
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(evicted, "Evicted idle contracts");
        }
        evicted
    }

    /// Close every pool.
    pub async fn close_all(&self) {
        let all = self.contracts();
        for contract in &all {
            if let Some((_, deployed)) = self.contracts.remove(contract) {
                deployed.runtime.pool().close().await;
            }
        }
        info!(closed = all.len(), "All contracts closed");
    }
}

impl std::fmt::Debug for ContractRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractRuntime")
            .field("engine", &self.engine)
            .field("contracts", &self.contracts.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(&*payload), "owned boom");

        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(&*payload), "unknown panic");
    }

    #[test]
    fn test_failure_level() {
        let missing = RuntimeError::MethodNotFound {
            method: "increase".into(),
        };
        assert_eq!(failure_level(&missing), Level::DEBUG);

        let out_of_gas = RuntimeError::OutOfGas {
            used: 10,
            limit: 10,
        };
        assert_eq!(failure_level(&out_of_gas), Level::INFO);

        assert_eq!(failure_level(&RuntimeError::trap("unreachable")), Level::WARN);
    }
}
