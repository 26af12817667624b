//! Error types for the contract-runtime.
//!
//! This module defines the error hierarchy using `thiserror`:
//! - [`RuntimeError`]: failures across pool management and contract calls
//! - [`CodecError`]: parameter encoding/decoding failures

use std::io;

use thiserror::Error;

/// Top-level runtime errors.
///
/// Pool construction surfaces `CompilationFailed` and `InstantiationFailed` to
/// the caller. Every other variant raised during an invocation ends up as the
/// message of a failed [`InvocationResult`](crate::InvocationResult).
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Byte code failed validation or compilation.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// A compiled module could not be linked into a runnable instance.
    #[error("Instantiation failed: {reason}")]
    InstantiationFailed {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// The guest allocator call failed.
    #[error("{export} invoke failed. There may not be enough memory or CPU")]
    AllocationFailed {
        /// Name of the allocator export.
        export: String,
    },

    /// The requested contract method is not exported by the module.
    #[error("find method [{method}] failed: function not exported")]
    MethodNotFound {
        /// The method that was requested.
        method: String,
    },

    /// Legacy form of [`RuntimeError::MethodNotFound`] for old guest ABIs.
    #[error("method [{method}] not exported")]
    NotExported {
        /// The method that was requested.
        method: String,
    },

    /// A protocol export (allocator, memory, dispatch entry) is missing or
    /// has the wrong signature.
    #[error("method [{name}] not export: {reason}")]
    MissingExport {
        /// The export name.
        name: String,
        /// Why the lookup failed.
        reason: String,
    },

    /// Writing the call payload into guest memory failed.
    #[error("Memory access failed: {reason}")]
    MemoryAccess {
        /// Description of the memory failure.
        reason: String,
    },

    /// A WebAssembly trap or host panic occurred during execution.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// The call exhausted its gas budget.
    #[error("contract invoke failed, out of gas {used}/{limit}")]
    OutOfGas {
        /// Gas consumed, including gas already used before the call.
        used: u64,
        /// The configured gas limit.
        limit: u64,
    },

    /// The guest deallocator failed before an instance was closed.
    #[error("Deallocation failed: {reason}")]
    DeallocationFailed {
        /// Description of the failure.
        reason: String,
    },

    /// The pool was closed; no instance will ever become available.
    #[error("Instance pool closed: {contract}")]
    PoolClosed {
        /// The contract whose pool was closed.
        contract: String,
    },

    /// No idle instance became available within the acquire timeout.
    #[error("Timed out after {timeout_ms}ms waiting for an instance of {contract}")]
    AcquireTimeout {
        /// The contract whose pool was exhausted.
        contract: String,
        /// The configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Parameter encoding failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// Errors from the key/typed-value parameter codec.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended in the middle of an item.
    #[error("Unexpected end of input at offset {offset}")]
    Truncated {
        /// Byte offset where more input was expected.
        offset: usize,
    },

    /// A key or value type tag is not recognized.
    #[error("Unknown type tag {tag} at offset {offset}")]
    UnknownTag {
        /// The tag value read.
        tag: i32,
        /// Byte offset of the tag.
        offset: usize,
    },

    /// A length prefix was negative.
    #[error("Negative length {len} at offset {offset}")]
    NegativeLength {
        /// The length value read.
        len: i32,
        /// Byte offset of the length.
        offset: usize,
    },

    /// The same key appeared twice.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// A key or string value was not valid UTF-8.
    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    /// An item is too large for an `i32` length prefix.
    #[error("Item too large: {len} bytes")]
    TooLarge {
        /// The offending length.
        len: usize,
    },
}

impl RuntimeError {
    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InstantiationFailed` error.
    pub fn instantiation_failed(reason: impl Into<String>) -> Self {
        Self::InstantiationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `MissingExport` error.
    pub fn missing_export(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MissingExport {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the requested method does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::MethodNotFound { .. } | Self::NotExported { .. } | Self::MissingExport { .. }
        )
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            Self::OutOfGas { .. } | Self::AllocationFailed { .. } | Self::AcquireTimeout { .. }
        )
    }
}
