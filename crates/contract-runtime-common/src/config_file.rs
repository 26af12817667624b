//! Configuration file structures for the contract-runtime.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ContractEntry`]: Contract to deploy at startup

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ContractId, RuntimeConfig};

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.engine]
/// pooling_allocator = false
///
/// [runtime.execution]
/// gas_limit = 10_000_000_000
///
/// [runtime.pool]
/// min_size = 5
/// max_size = 50
/// acquire_timeout_ms = 2000
///
/// [[contracts]]
/// name = "counter"
/// version = "1.0.0"
/// path = "./contracts/counter.wasm"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine, execution, pool and ABI settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Contracts to deploy at startup.
    #[serde(default)]
    pub contracts: Vec<ContractEntry>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML or the
    /// resulting runtime configuration is inconsistent.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })?;

        config
            .runtime
            .validate()
            .map_err(|e| ConfigFileError::Invalid {
                message: e.to_string(),
            })?;

        Ok(config)
    }
}

/// A contract deployed at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContractEntry {
    /// Contract name.
    pub name: String,

    /// Contract version.
    pub version: String,

    /// Path to the WebAssembly module file.
    pub path: String,
}

impl ContractEntry {
    /// The pool key of this entry.
    pub fn contract_id(&self) -> ContractId {
        ContractId::new(&self.name, &self.version)
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },

    /// The configuration parsed but is not usable.
    #[error("Invalid config file: {message}")]
    Invalid { message: String },
}
