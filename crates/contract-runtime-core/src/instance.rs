//! Pool-owned contract instances.
//!
//! A [`WrappedInstance`] pairs one instantiated module (its [`Store`] and
//! [`Instance`]) with the bookkeeping the pool needs: identity, timestamps
//! and an error counter. It is owned either by the pool's idle queue or by
//! the caller that checked it out, never both.

use std::time::Instant;

use tracing::{debug, instrument, warn};
use uuid::Uuid;
use wasmtime::{Func, Instance, Linker, Memory, Store};

use crate::CompiledModule;
use crate::store::{InstanceState, create_store};
use contract_runtime_common::{AbiConfig, ContractId, ExecutionConfig, RuntimeError};

/// One instantiated contract module plus pool bookkeeping.
pub struct WrappedInstance {
    id: Uuid,
    store: Store<InstanceState>,
    instance: Instance,
    created_at: Instant,
    last_used_at: Instant,
    error_count: u32,
}

impl WrappedInstance {
    /// Instantiate `module` with the host functions registered on `linker`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InstantiationFailed`] if linking or the start
    /// function fails.
    #[instrument(skip_all, fields(contract = %contract))]
    pub async fn instantiate(
        linker: &Linker<InstanceState>,
        module: &CompiledModule,
        contract: ContractId,
        config: &ExecutionConfig,
    ) -> Result<Self, RuntimeError> {
        let mut store = create_store(module, contract, config)?;

        // Start functions run under a full budget
        store
            .set_fuel(config.gas_limit)
            .map_err(|e| RuntimeError::instantiation_failed(format!("Failed to set fuel: {e}")))?;

        let instance = linker
            .instantiate_async(&mut store, module.inner())
            .await
            .map_err(|e| RuntimeError::instantiation_failed(e.to_string()))?;

        let now = Instant::now();
        let wrapped = Self {
            id: Uuid::new_v4(),
            store,
            instance,
            created_at: now,
            last_used_at: now,
            error_count: 0,
        };

        debug!(instance_id = %wrapped.id, "Instance created");
        Ok(wrapped)
    }

    /// Unique id of this instance.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// When the instance was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the instance was last handed out.
    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    /// Call failures recorded against this instance.
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Record one call failure.
    pub fn record_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
    }

    pub(crate) fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    /// Set the gas budget for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine was built without fuel metering.
    pub fn set_gas_limit(&mut self, gas: u64) -> Result<(), RuntimeError> {
        self.store
            .set_fuel(gas)
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to set gas: {e}")))
    }

    /// Gas left in the current budget.
    pub fn gas_remaining(&self) -> u64 {
        self.store.get_fuel().unwrap_or(0)
    }

    /// Look up an exported function.
    pub fn exported_function(&mut self, name: &str) -> Option<Func> {
        self.instance.get_func(&mut self.store, name)
    }

    /// Look up an exported linear memory.
    pub fn exported_memory(&mut self, name: &str) -> Option<Memory> {
        self.instance.get_memory(&mut self.store, name)
    }

    /// Store data of this instance.
    pub fn state(&self) -> &InstanceState {
        self.store.data()
    }

    /// Mutable store data of this instance.
    pub fn state_mut(&mut self) -> &mut InstanceState {
        self.store.data_mut()
    }

    /// The instance's store, for calling exports obtained from it.
    pub fn store_mut(&mut self) -> &mut Store<InstanceState> {
        &mut self.store
    }

    /// Give the guest a chance to release memory before the instance closes.
    ///
    /// Resets the gas budget to `gas_limit` and calls the deallocate export
    /// with a zero argument.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::DeallocationFailed`] if the export is missing,
    /// has the wrong signature or traps.
    pub async fn call_deallocate(
        &mut self,
        abi: &AbiConfig,
        gas_limit: u64,
    ) -> Result<(), RuntimeError> {
        let dealloc_failed = |reason: String| RuntimeError::DeallocationFailed { reason };

        self.store
            .set_fuel(gas_limit)
            .map_err(|e| dealloc_failed(e.to_string()))?;

        let func = self
            .instance
            .get_typed_func::<i32, ()>(&mut self.store, &abi.deallocate_export)
            .map_err(|e| dealloc_failed(e.to_string()))?;

        func.call_async(&mut self.store, 0)
            .await
            .map_err(|e| dealloc_failed(e.to_string()))
    }

    /// Deallocate, then close the instance.
    ///
    /// Deallocation failures are logged; the instance is closed regardless.
    pub async fn destroy(mut self, abi: &AbiConfig, gas_limit: u64) {
        if let Err(e) = self.call_deallocate(abi, gas_limit).await {
            warn!(instance_id = %self.id, error = %e, "CallDeallocate failed");
        }
        debug!(
            instance_id = %self.id,
            age_ms = self.created_at.elapsed().as_millis(),
            errors = self.error_count,
            "Instance closed"
        );
        // Dropping the store releases the instance's memory and tables.
    }
}

impl std::fmt::Debug for WrappedInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedInstance")
            .field("id", &self.id)
            .field("error_count", &self.error_count)
            .finish_non_exhaustive()
    }
}
