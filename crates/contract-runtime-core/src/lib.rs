//! Pooled Wasmtime execution for contract-runtime.
//!
//! This crate runs smart-contract methods on pre-instantiated WebAssembly
//! instances:
//! - [`WasmEngine`]: Configured Wasmtime engine with fuel metering
//! - [`CompiledModule`]: Validated, compiled contract byte code
//! - [`WrappedInstance`]: One instance plus pool bookkeeping
//! - [`InstancePool`]: Elastic per-contract pool driven by a control loop
//! - [`CallContext`]: Parameter marshaling and method dispatch
//! - [`RuntimeInstance`] / [`ContractRuntime`]: Invocation façade and registry
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   ContractRuntime                       │
//! │  (Shared engine + linker, one pool per contract)        │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    InstancePool                         │
//! │  (Idle queue, autoscaling control loop)                 │
//! │  - Grow on demand / delay                               │
//! │  - Shrink on refresh                                    │
//! │  - Discard unhealthy instances                          │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │         Store<InstanceState> + Instance                 │
//! │  (Reused across calls, one call at a time)              │
//! │  - Fuel as gas                                          │
//! │  - Linear memory limit                                  │
//! │  - Per-call context handle and output                   │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod call;
pub mod codec;
pub mod engine;
pub mod instance;
pub mod module;
pub mod pool;
pub mod runtime;
pub mod store;

pub use call::{CallContext, ContextCounter};
pub use engine::WasmEngine;
pub use instance::WrappedInstance;
pub use module::CompiledModule;
pub use pool::{InstancePool, PoolStats, PooledInstance};
pub use runtime::{ContractRuntime, RuntimeInstance};
pub use store::InstanceState;
