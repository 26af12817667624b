//! Contract byte code validation and compilation.
//!
//! [`CompiledModule`] wraps a Wasmtime [`Module`]. A pool compiles its
//! contract once and shares the result, read-only, with every instance.

use std::time::Instant;

use sha2::{Digest, Sha256};
use tracing::{info, instrument};
use wasmtime::{Engine, Module};

use contract_runtime_common::{AbiConfig, RuntimeError};

const WASM_MAGIC: &[u8] = b"\0asm";
const CORE_MODULE_VERSION: &[u8] = &[0x01, 0x00, 0x00, 0x00];

/// A compiled contract module.
///
/// Cloning is cheap: the underlying Wasmtime module is reference counted and
/// immutable after compilation.
#[derive(Clone)]
pub struct CompiledModule {
    module: Module,

    /// Hex SHA-256 of the byte code.
    content_hash: String,

    byte_len: usize,
}

impl CompiledModule {
    /// Validate and compile contract byte code.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::CompilationFailed`] if the bytes are not a
    /// valid module for this engine or compilation fails.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        Self::validate(engine, bytes)?;

        let module = Module::new(engine, bytes).map_err(|e| {
            RuntimeError::compilation_failed(format!("byte code compile failed: {e}"))
        })?;
        let compiled = Self::wrap(module, bytes);

        info!(
            content_hash = %compiled.content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Contract module compiled"
        );
        Ok(compiled)
    }

    /// Compile contract source in the WebAssembly text format.
    ///
    /// The header check is skipped; the hash covers the text, not the
    /// binary it encodes to.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::CompilationFailed`] if the text does not parse
    /// or compile.
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, RuntimeError> {
        Module::new(engine, wat)
            .map(|module| Self::wrap(module, wat.as_bytes()))
            .map_err(|e| RuntimeError::compilation_failed(format!("text compile failed: {e}")))
    }

    fn wrap(module: Module, source: &[u8]) -> Self {
        Self {
            module,
            content_hash: content_hash(source),
            byte_len: source.len(),
        }
    }

    /// Check byte code against the engine's validation rules without
    /// compiling it.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::CompilationFailed`] describing the first
    /// validation failure.
    pub fn validate(engine: &Engine, bytes: &[u8]) -> Result<(), RuntimeError> {
        Self::validate_wasm_header(bytes)?;

        Module::validate(engine, bytes).map_err(|e| {
            RuntimeError::compilation_failed(format!("byte code validation failed: {e}"))
        })
    }

    /// Get the inner Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.module
    }

    /// The engine this module was compiled for.
    pub fn engine(&self) -> &Engine {
        self.module.engine()
    }

    /// Hex SHA-256 of the byte code; identical code yields an identical hash.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Size of the byte code in bytes.
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// Returns `true` if the module exports a function with this name.
    pub fn exports_function(&self, name: &str) -> bool {
        self.module
            .get_export(name)
            .is_some_and(|ty| ty.func().is_some())
    }

    /// Names from the calling convention that this module does not export.
    ///
    /// Method exports are not checked; they are resolved per call.
    pub fn missing_abi_exports<'a>(&self, abi: &'a AbiConfig) -> Vec<&'a str> {
        let mut missing: Vec<&str> = [
            &abi.runtime_type_export,
            &abi.allocate_export,
            &abi.deallocate_export,
        ]
        .into_iter()
        .filter(|name| !self.exports_function(name))
        .map(String::as_str)
        .collect();

        let has_memory = self
            .module
            .get_export(&abi.memory_export)
            .is_some_and(|ty| ty.memory().is_some());
        if !has_memory {
            missing.push(&abi.memory_export);
        }
        missing
    }

    /// Check the preamble: `\0asm` magic followed by core module version 1.
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        let (Some(magic), Some(version)) = (bytes.get(0..4), bytes.get(4..8)) else {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        };

        if magic != WASM_MAGIC {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }
        if version != CORE_MODULE_VERSION {
            return Err(RuntimeError::compilation_failed(format!(
                "Invalid Wasm: unsupported binary version {version:02x?}, contracts must be core modules"
            )));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .field("byte_len", &self.byte_len)
            .finish_non_exhaustive()
    }
}

fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
