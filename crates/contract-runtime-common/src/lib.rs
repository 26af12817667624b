//! Common types, errors, and configuration for contract-runtime.
//!
//! This crate provides shared functionality used across the contract-runtime workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for engine, execution and pool settings
//! - Contract identity, transaction context and invocation result types

pub mod config;
pub mod config_file;
pub mod error;
pub mod types;

pub use config::{AbiConfig, EngineConfig, ExecutionConfig, PoolConfig, RuntimeConfig};
pub use config_file::{ConfigFile, ConfigFileError, ContractEntry};
pub use error::{CodecError, RuntimeError};
pub use types::{ContractId, InvocationResult, Member, Parameters, TxContext, param_keys};
