//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is shared by every contract pool. It is configured with:
//! - fuel metering, used as the contract gas meter
//! - async support, so calls yield to the tokio scheduler
//! - deterministic floating point and SIMD semantics
//! - an optional pooling allocator for fast instantiation

use std::sync::Arc;

use tracing::info;
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use contract_runtime_common::{EngineConfig, RuntimeError};

/// Thread-safe WebAssembly engine wrapper.
///
/// The engine holds no per-contract state; compiled modules and instances
/// created from it can live on any thread.
///
/// # Example
///
/// ```ignore
/// use contract_runtime_common::EngineConfig;
/// use contract_runtime_core::WasmEngine;
///
/// let engine = WasmEngine::new(&EngineConfig::default())?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is invalid or the
    /// pooling allocator cannot reserve its slots.
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        let engine = Engine::new(&Self::build_config(config)).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!(
            pooling_allocator = config.pooling_allocator,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    /// Translate [`EngineConfig`] into Wasmtime settings.
    ///
    /// Every node must compute the same result and gas for the same call, so
    /// NaN bit patterns and relaxed SIMD results are pinned. Shared-memory
    /// threads stay off because the `threads` feature is not compiled in.
    fn build_config(config: &EngineConfig) -> Config {
        let mut wasmtime_config = Config::new();

        wasmtime_config
            .async_support(true)
            .consume_fuel(true)
            .cranelift_opt_level(wasmtime::OptLevel::Speed)
            .cranelift_nan_canonicalization(true)
            .relaxed_simd_deterministic(true);

        if config.pooling_allocator {
            wasmtime_config.allocation_strategy(InstanceAllocationStrategy::Pooling(
                Self::create_pooling_config(config),
            ));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        wasmtime_config
    }

    /// Size the pooling allocator for `max_instances` live contract instances.
    ///
    /// Pooled instances run async calls, so each slot also needs a fiber stack.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling
            .total_core_instances(config.max_instances)
            .total_memories(config.max_instances)
            .total_tables(config.max_instances)
            .total_stacks(config.max_instances)
            .max_memory_size(config.instance_memory_mb as usize * 1024 * 1024);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("max_instances", &self.config.max_instances)
            .finish_non_exhaustive()
    }
}
