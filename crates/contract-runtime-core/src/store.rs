//! Per-instance store data.
//!
//! [`InstanceState`] is the data attached to each pooled instance's
//! Wasmtime [`Store`]. Host functions reach it through
//! [`wasmtime::Caller::data_mut`]. The per-call part of it is reset at the
//! start of every call, so nothing written by one call is visible to the next.

use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};

use crate::CompiledModule;
use contract_runtime_common::{ContractId, ExecutionConfig, RuntimeError};

/// Store data of one pooled instance.
pub struct InstanceState {
    /// The contract this instance belongs to.
    pub contract: ContractId,

    /// Context handle of the call currently running, `0` when idle.
    pub context_ptr: i32,

    /// Payload published by the guest during the current call.
    output: Option<Vec<u8>>,

    limits: StoreLimits,
}

impl InstanceState {
    /// Create store data for an instance of `contract`.
    pub fn new(contract: ContractId, max_memory_bytes: usize) -> Self {
        Self {
            contract,
            context_ptr: 0,
            output: None,
            limits: StoreLimitsBuilder::new()
                .memory_size(max_memory_bytes)
                .build(),
        }
    }

    /// Reset per-call state before a new call starts.
    pub fn begin_call(&mut self, context_ptr: i32) {
        self.context_ptr = context_ptr;
        self.output = None;
    }

    /// Take the published payload and mark the instance idle.
    pub fn finish_call(&mut self) -> Vec<u8> {
        self.context_ptr = 0;
        self.output.take().unwrap_or_default()
    }

    /// Publish the call's result payload. A later call replaces it.
    pub fn set_output(&mut self, payload: Vec<u8>) {
        self.output = Some(payload);
    }

    /// The payload published so far, if any.
    pub fn output(&self) -> Option<&[u8]> {
        self.output.as_deref()
    }
}

/// Create a Wasmtime store for one pooled instance.
///
/// The store starts with no fuel; the façade sets the per-call budget.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    module: &CompiledModule,
    contract: ContractId,
    config: &ExecutionConfig,
) -> Result<Store<InstanceState>, RuntimeError> {
    let state = InstanceState::new(contract, config.max_memory_bytes());
    let mut store = Store::new(module.engine(), state);
    store.limiter(|state| &mut state.limits);

    store
        .set_fuel(0)
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;

    Ok(store)
}
