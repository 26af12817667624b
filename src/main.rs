//! Contract Runtime CLI entry point.
//!
//! Runs single contract invocations against the pooled runtime and checks
//! contract byte code.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use contract_runtime_common::{ConfigFile, ContractId, Parameters, TxContext};
use contract_runtime_core::{CompiledModule, ContractRuntime, WasmEngine};
use contract_runtime_host::register_all;

#[derive(Debug, Parser)]
#[command(name = "contract-runtime", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, short, env = "CONTRACT_RUNTIME_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "CONTRACT_RUNTIME_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Invoke one contract method and print the result as JSON.
    Invoke {
        /// Contract name.
        #[arg(long)]
        name: String,

        /// Contract version.
        #[arg(long)]
        version: String,

        /// Path to the contract's Wasm byte code.
        #[arg(long)]
        wasm: PathBuf,

        /// Method to call.
        #[arg(long)]
        method: String,

        /// Call parameter as `key=value`; repeatable.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Gas the transaction already consumed.
        #[arg(long, default_value_t = 0)]
        gas_used: u64,

        /// Transaction id.
        #[arg(long, default_value = "cli")]
        tx_id: String,

        /// Block height.
        #[arg(long, default_value_t = 0)]
        block_height: u64,

        /// Block format version.
        #[arg(long, default_value_t = 2200)]
        block_version: u32,
    },

    /// Validate and compile contract byte code.
    Check {
        /// Path to the contract's Wasm byte code.
        #[arg(long)]
        wasm: PathBuf,
    },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize tracing; stdout is reserved for command output
    let (plain, json) = if cli.log_json {
        (
            None,
            Some(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)),
        )
    } else {
        (
            Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
            None,
        )
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,contract_runtime=debug".into()),
        )
        .with(plain)
        .with(json)
        .init();

    let config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ConfigFile::default(),
    };

    match cli.command {
        Command::Check { wasm } => {
            let byte_code = std::fs::read(&wasm)
                .with_context(|| format!("Failed to read {}", wasm.display()))?;
            let engine = WasmEngine::new(&config.runtime.engine)?;
            let module = CompiledModule::from_bytes(engine.inner(), &byte_code)?;

            println!("{} ({} bytes)", module.content_hash(), module.byte_len());
            let missing = module.missing_abi_exports(&config.runtime.abi);
            for export in &missing {
                println!("missing export: {export}");
            }
            Ok(if missing.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Invoke {
            name,
            version,
            wasm,
            method,
            params,
            gas_used,
            tx_id,
            block_height,
            block_version,
        } => {
            let runtime = ContractRuntime::new(config.runtime.clone(), register_all)?;

            for entry in &config.contracts {
                let byte_code = std::fs::read(&entry.path)
                    .with_context(|| format!("Failed to read {}", entry.path))?;
                runtime
                    .deploy(&entry.contract_id(), &byte_code)
                    .await
                    .with_context(|| format!("Failed to deploy {}", entry.contract_id()))?;
                info!(contract = %entry.contract_id(), "Contract preloaded");
            }

            let byte_code = std::fs::read(&wasm)
                .with_context(|| format!("Failed to read {}", wasm.display()))?;
            let parameters: Parameters = params
                .into_iter()
                .map(|(k, v)| (k, v.into_bytes()))
                .collect();
            let tx = TxContext {
                tx_id,
                block_height,
                block_version,
                ..Default::default()
            };

            let result = runtime
                .invoke(
                    &ContractId::new(name, version),
                    &method,
                    &byte_code,
                    parameters,
                    gas_used,
                    &tx,
                )
                .await;
            runtime.close_all().await;

            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(if result.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
