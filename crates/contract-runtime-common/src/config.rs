//! Configuration structures for the contract-runtime.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling allocator)
//! - [`ExecutionConfig`]: Per-call limits (gas, memory)
//! - [`PoolConfig`]: Elastic instance pool sizing and autoscaling policy
//! - [`AbiConfig`]: Guest export names and compatibility switches

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RuntimeError;

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for the contract-runtime.
/// It can be loaded from TOML or JSON files.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-call execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Instance pool configuration, shared by every contract pool.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Guest ABI configuration.
    #[serde(default)]
    pub abi: AbiConfig,
}

impl RuntimeConfig {
    /// Check that every section is internally consistent.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        self.pool.validate()?;
        if self.execution.gas_limit == 0 {
            return Err(RuntimeError::invalid_config("gas_limit must be positive"));
        }
        Ok(())
    }
}

/// Wasmtime engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for high-performance instance creation.
    ///
    /// When enabled, memory is pre-allocated for a fixed number of instance
    /// slots shared by every contract pool of the engine.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances across all pools.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
        }
    }
}

/// Per-call execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Gas budget of a whole transaction.
    ///
    /// Each call runs with `gas_limit - gas_already_used`. Gas is metered as
    /// Wasmtime fuel.
    #[serde(default = "defaults::gas_limit")]
    pub gas_limit: u64,

    /// Maximum linear memory of one instance in megabytes.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            gas_limit: defaults::gas_limit(),
            max_memory_mb: defaults::max_memory_mb(),
        }
    }
}

impl ExecutionConfig {
    /// Memory limit in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb as usize) * 1024 * 1024
    }
}

/// Elastic instance pool configuration.
///
/// The control loop grows the pool by `grow_step` when callers have to wait
/// (see `delay_tolerance_ms` and `grow_threshold`) and shrinks it by the same
/// step on a quiet refresh tick.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Instances kept warm at all times.
    #[serde(default = "defaults::min_size")]
    pub min_size: usize,

    /// Hard cap on instances per contract.
    #[serde(default = "defaults::max_size")]
    pub max_size: usize,

    /// Instances added or removed by one grow/shrink step.
    #[serde(default = "defaults::grow_step")]
    pub grow_step: usize,

    /// Average acquire wait (ms) above which the pool grows.
    #[serde(default = "defaults::delay_tolerance_ms")]
    pub delay_tolerance_ms: u64,

    /// Demand signals tolerated before the pool grows.
    #[serde(default = "defaults::grow_threshold")]
    pub grow_threshold: usize,

    /// Call failures after which an instance is discarded.
    #[serde(default = "defaults::discard_threshold")]
    pub discard_threshold: u32,

    /// Seconds between refresh ticks of the control loop.
    #[serde(default = "defaults::refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Optional bound on how long `acquire` waits for an idle instance.
    ///
    /// `None` waits until an instance is released or the pool is closed.
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: defaults::min_size(),
            max_size: defaults::max_size(),
            grow_step: defaults::grow_step(),
            delay_tolerance_ms: defaults::delay_tolerance_ms(),
            grow_threshold: defaults::grow_threshold(),
            discard_threshold: defaults::discard_threshold(),
            refresh_interval_secs: defaults::refresh_interval_secs(),
            acquire_timeout_ms: None,
        }
    }
}

impl PoolConfig {
    /// Get the refresh interval as a `Duration`.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Get the acquire timeout as a `Duration`, if one is configured.
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }

    /// Check the sizing parameters.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.max_size == 0 {
            return Err(RuntimeError::invalid_config("pool max_size must be positive"));
        }
        if self.min_size > self.max_size {
            return Err(RuntimeError::invalid_config(format!(
                "pool min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.grow_step == 0 {
            return Err(RuntimeError::invalid_config("pool grow_step must be positive"));
        }
        if self.refresh_interval_secs == 0 {
            return Err(RuntimeError::invalid_config(
                "pool refresh_interval_secs must be positive",
            ));
        }
        Ok(())
    }
}

/// Guest ABI configuration.
///
/// Names of the exports the calling convention relies on.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AbiConfig {
    /// `allocate(len: i32) -> i32` export.
    #[serde(default = "defaults::allocate_export")]
    pub allocate_export: String,

    /// `deallocate(ptr: i32)` export, called before an instance is closed.
    #[serde(default = "defaults::deallocate_export")]
    pub deallocate_export: String,

    /// Dispatch export every contract must provide.
    #[serde(default = "defaults::runtime_type_export")]
    pub runtime_type_export: String,

    /// Exported linear memory.
    #[serde(default = "defaults::memory_export")]
    pub memory_export: String,

    /// Initializer method; its failures do not count toward discard.
    #[serde(default = "defaults::init_method")]
    pub init_method: String,

    /// Block versions below this report a missing method as "not exported".
    #[serde(default = "defaults::legacy_block_version")]
    pub legacy_block_version: u32,
}

impl Default for AbiConfig {
    fn default() -> Self {
        Self {
            allocate_export: defaults::allocate_export(),
            deallocate_export: defaults::deallocate_export(),
            runtime_type_export: defaults::runtime_type_export(),
            memory_export: defaults::memory_export(),
            init_method: defaults::init_method(),
            legacy_block_version: defaults::legacy_block_version(),
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        true
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn gas_limit() -> u64 {
        10_000_000_000
    }

    pub const fn max_memory_mb() -> u32 {
        64
    }

    pub const fn min_size() -> usize {
        5
    }

    pub const fn max_size() -> usize {
        50
    }

    pub const fn grow_step() -> usize {
        5
    }

    pub const fn delay_tolerance_ms() -> u64 {
        10
    }

    pub const fn grow_threshold() -> usize {
        100
    }

    pub const fn discard_threshold() -> u32 {
        10
    }

    pub const fn refresh_interval_secs() -> u64 {
        12 * 60 * 60
    }

    pub fn allocate_export() -> String {
        "allocate".to_string()
    }

    pub fn deallocate_export() -> String {
        "deallocate".to_string()
    }

    pub fn runtime_type_export() -> String {
        "runtime_type".to_string()
    }

    pub fn memory_export() -> String {
        "memory".to_string()
    }

    pub fn init_method() -> String {
        "init_contract".to_string()
    }

    pub const fn legacy_block_version() -> u32 {
        2200
    }
}
