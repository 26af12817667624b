//! Host function registration for contract linkers.
//!
//! Every pooled instance is created from one [`Linker`] carrying these
//! imports under module `env`:
//!
//! | import                          | effect                              |
//! |---------------------------------|-------------------------------------|
//! | `log(level, ptr, len)`          | emit a guest log line               |
//! | `set_output(ptr, len)`          | publish the call's result payload   |
//!
//! Pointers refer to the guest's exported `memory`. Out-of-bounds ranges are
//! logged and the call is ignored; they never trap the guest.

use contract_runtime_common::RuntimeError;
use contract_runtime_core::{InstanceState, WasmEngine};
use tracing::{debug, warn};
use wasmtime::{Caller, Linker};

use crate::logging::{self, level_from_i32};

/// Guest memory export read by host functions.
const MEMORY_EXPORT: &str = "memory";

/// Create a linker with every host function registered.
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn create_linker(engine: &WasmEngine) -> Result<Linker<InstanceState>, RuntimeError> {
    let mut linker = Linker::new(engine.inner());
    register_all(&mut linker)?;
    Ok(linker)
}

/// Register all host functions on `linker`.
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_all(linker: &mut Linker<InstanceState>) -> Result<(), RuntimeError> {
    register_logging(linker)?;
    register_output(linker)?;
    Ok(())
}

/// Register `env::log(level: i32, ptr: i32, len: i32)`.
pub fn register_logging(linker: &mut Linker<InstanceState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "env",
            "log",
            |mut caller: Caller<'_, InstanceState>, level: i32, ptr: i32, len: i32| {
                let Some(bytes) = read_guest_bytes(&mut caller, ptr, len) else {
                    return;
                };
                let message = String::from_utf8_lossy(&bytes);
                logging::log(caller.data(), level_from_i32(level), &message);
            },
        )
        .map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to register log function: {e}"))
        })?;

    Ok(())
}

/// Register `env::set_output(ptr: i32, len: i32)`.
///
/// The bytes are copied out of guest memory immediately; a later call in
/// the same invocation replaces them.
pub fn register_output(linker: &mut Linker<InstanceState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "env",
            "set_output",
            |mut caller: Caller<'_, InstanceState>, ptr: i32, len: i32| {
                let Some(bytes) = read_guest_bytes(&mut caller, ptr, len) else {
                    return;
                };
                debug!(
                    contract = %caller.data().contract,
                    ctx_ptr = caller.data().context_ptr,
                    len = bytes.len(),
                    "Guest set output"
                );
                caller.data_mut().set_output(bytes);
            },
        )
        .map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to register set_output function: {e}"))
        })?;

    Ok(())
}

/// Copy `len` bytes at `ptr` out of the caller's memory.
fn read_guest_bytes(caller: &mut Caller<'_, InstanceState>, ptr: i32, len: i32) -> Option<Vec<u8>> {
    let (Ok(start), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
        warn!(ptr, len, "Invalid pointer or length (negative value)");
        return None;
    };

    let Some(memory) = caller
        .get_export(MEMORY_EXPORT)
        .and_then(wasmtime::Extern::into_memory)
    else {
        warn!("Memory export not found in guest module");
        return None;
    };

    let data = memory.data(&*caller);
    let Some(end) = start.checked_add(len) else {
        warn!(ptr, len, "Pointer + length overflow");
        return None;
    };
    if end > data.len() {
        warn!(
            start,
            end,
            memory_size = data.len(),
            "Memory access out of bounds"
        );
        return None;
    }

    Some(data[start..end].to_vec())
}
