//! Host/guest calling convention for one contract method call.
//!
//! A call runs against one checked-out instance:
//!
//! 1. take a context handle from the [`ContextCounter`]
//! 2. encode caller and base parameters, including the handle
//! 3. reserve guest memory through the allocate export
//! 4. copy the encoded bytes into linear memory at the returned pointer
//! 5. call the method export with no arguments
//!
//! The guest reads its parameters back from the region it allocated.

use parking_lot::Mutex;
use tracing::{debug, instrument};
use wasmtime::Val;

use crate::codec;
use crate::instance::WrappedInstance;
use contract_runtime_common::{
    AbiConfig, ContractId, Parameters, RuntimeError, TxContext, param_keys,
};

/// Largest context handle before the counter wraps back to `1`.
pub const MAX_CONTEXT_PTR: i32 = 100_000_000;

/// Source of per-call context handles.
///
/// Handles increase monotonically and wrap to `1` after [`MAX_CONTEXT_PTR`].
/// `0` is never handed out; instance state uses it to mean idle.
/// Concurrent callers never receive the same handle between wraps.
#[derive(Debug, Default)]
pub struct ContextCounter {
    current: Mutex<i32>,
}

impl ContextCounter {
    /// Create a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next handle.
    pub fn next(&self) -> i32 {
        let mut current = self.current.lock();
        *current += 1;
        if *current > MAX_CONTEXT_PTR {
            *current = 1;
        }
        *current
    }
}

/// State of one contract method call.
#[derive(Debug)]
pub struct CallContext<'a> {
    contract: &'a ContractId,
    method: &'a str,
    parameters: Parameters,
    context_ptr: i32,
    block_version: u32,
    abi: &'a AbiConfig,
}

impl<'a> CallContext<'a> {
    /// Prepare a call: assign a handle and inject the base parameters.
    pub fn new(
        contract: &'a ContractId,
        method: &'a str,
        mut parameters: Parameters,
        tx: &TxContext,
        counter: &ContextCounter,
        abi: &'a AbiConfig,
    ) -> Self {
        let context_ptr = counter.next();
        tx.fill_base_params(&mut parameters);
        parameters.insert(
            param_keys::CONTEXT_PTR.to_string(),
            context_ptr.to_string().into_bytes(),
        );

        Self {
            contract,
            method,
            parameters,
            context_ptr,
            block_version: tx.block_version,
            abi,
        }
    }

    /// Handle assigned to this call.
    pub fn context_ptr(&self) -> i32 {
        self.context_ptr
    }

    /// Parameters as they will be sent to the guest.
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Run the method on `instance`.
    ///
    /// A normal return does not mean the contract succeeded: the caller
    /// still has to check the remaining gas.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::MissingExport`] if the dispatch export, allocator or
    ///   memory is absent
    /// - [`RuntimeError::AllocationFailed`] if the allocator call fails
    /// - [`RuntimeError::MemoryAccess`] if the payload does not fit
    /// - [`RuntimeError::MethodNotFound`] / [`RuntimeError::NotExported`] if
    ///   the method is absent
    /// - [`RuntimeError::Trap`] if the method traps
    #[instrument(skip_all, fields(contract = %self.contract, method = %self.method, ctx_ptr = self.context_ptr))]
    pub async fn call_method(&self, instance: &mut WrappedInstance) -> Result<(), RuntimeError> {
        if instance
            .exported_function(&self.abi.runtime_type_export)
            .is_none()
        {
            return Err(RuntimeError::missing_export(
                &self.abi.runtime_type_export,
                "dispatch entry not exported",
            ));
        }

        let payload = codec::encode(&self.parameters)?;
        debug!(payload_len = payload.len(), "Parameters encoded");

        let ptr = self.allocate(instance, payload.len()).await?;
        self.write_payload(instance, ptr, &payload)?;

        let Some(method) = instance.exported_function(self.method) else {
            return Err(self.missing_method());
        };

        let result_arity = method.ty(instance.store_mut()).results().len();
        let mut results = vec![Val::I32(0); result_arity];
        method
            .call_async(instance.store_mut(), &[], &mut results)
            .await
            .map_err(|e| RuntimeError::trap(e.to_string()))?;

        debug!("Method returned");
        Ok(())
    }

    async fn allocate(
        &self,
        instance: &mut WrappedInstance,
        len: usize,
    ) -> Result<i32, RuntimeError> {
        let export = &self.abi.allocate_export;
        let allocate = instance
            .exported_function(export)
            .ok_or_else(|| RuntimeError::missing_export(export, "allocator not exported"))?
            .typed::<i32, i32>(instance.store_mut())
            .map_err(|e| RuntimeError::missing_export(export, e.to_string()))?;

        let len = i32::try_from(len).map_err(|_| RuntimeError::MemoryAccess {
            reason: format!("payload of {len} bytes exceeds guest address space"),
        })?;

        allocate
            .call_async(instance.store_mut(), len)
            .await
            .map_err(|e| {
                debug!(error = %e, "Allocator call failed");
                RuntimeError::AllocationFailed {
                    export: export.clone(),
                }
            })
    }

    fn write_payload(
        &self,
        instance: &mut WrappedInstance,
        ptr: i32,
        payload: &[u8],
    ) -> Result<(), RuntimeError> {
        let export = &self.abi.memory_export;
        let memory = instance
            .exported_memory(export)
            .ok_or_else(|| RuntimeError::missing_export(export, "memory not exported"))?;

        let offset = usize::try_from(ptr).map_err(|_| RuntimeError::MemoryAccess {
            reason: format!("allocator returned negative pointer {ptr}"),
        })?;

        memory
            .write(instance.store_mut(), offset, payload)
            .map_err(|e| RuntimeError::MemoryAccess {
                reason: format!("{e} (ptr {ptr}, len {})", payload.len()),
            })
    }

    fn missing_method(&self) -> RuntimeError {
        let method = self.method.to_string();
        if self.block_version < self.abi.legacy_block_version {
            RuntimeError::NotExported { method }
        } else {
            RuntimeError::MethodNotFound { method }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_counter_is_monotonic() {
        let counter = ContextCounter::new();
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
        assert_eq!(counter.next(), 3);
    }

    #[test]
    fn test_counter_wraps() {
        let counter = ContextCounter {
            current: Mutex::new(MAX_CONTEXT_PTR - 1),
        };
        assert_eq!(counter.next(), MAX_CONTEXT_PTR);
        // Skips 0, the idle marker
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
    }

    #[test]
    fn test_counter_unique_across_threads() {
        let counter = Arc::new(ContextCounter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || (0..500).map(|_| counter.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for ptr in handle.join().unwrap() {
                assert!(seen.insert(ptr), "duplicate context handle {ptr}");
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn test_call_context_injects_params() {
        let contract = ContractId::new("counter", "1.0.0");
        let abi = AbiConfig::default();
        let counter = ContextCounter::new();
        let tx = TxContext {
            tx_id: "TX_ID".into(),
            block_height: 9,
            ..Default::default()
        };
        let mut params = Parameters::new();
        params.insert("key".into(), b"test_key".to_vec());

        let ctx = CallContext::new(&contract, "increase", params, &tx, &counter, &abi);

        assert_eq!(ctx.context_ptr(), 1);
        let params = ctx.parameters();
        assert_eq!(params[param_keys::CONTEXT_PTR], b"1");
        assert_eq!(params[param_keys::TX_ID], b"TX_ID");
        assert_eq!(params[param_keys::BLOCK_HEIGHT], b"9");
        assert_eq!(params["key"], b"test_key");
    }

    #[test]
    fn test_missing_method_compatibility() {
        let contract = ContractId::new("counter", "1.0.0");
        let abi = AbiConfig::default();
        let counter = ContextCounter::new();

        let legacy_tx = TxContext {
            block_version: 2100,
            ..Default::default()
        };
        let ctx = CallContext::new(&contract, "m", Parameters::new(), &legacy_tx, &counter, &abi);
        assert!(matches!(
            ctx.missing_method(),
            RuntimeError::NotExported { .. }
        ));

        let current_tx = TxContext {
            block_version: 2200,
            ..Default::default()
        };
        let ctx = CallContext::new(&contract, "m", Parameters::new(), &current_tx, &counter, &abi);
        assert!(matches!(
            ctx.missing_method(),
            RuntimeError::MethodNotFound { .. }
        ));
    }
}
