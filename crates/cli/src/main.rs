//! Confman CLI - execute management operations against a configuration model.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use confman_core::{Address, Operation, OperationResult, Resource};
use confman_execution::{ControllerConfig, ExecutionError, ModelController};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "confman")]
#[command(about = "Staged execution of configuration management operations", long_about = None)]
struct Cli {
    /// Controller configuration (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Initial model (JSON resource tree)
    #[arg(long, global = true)]
    model: Option<PathBuf>,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute operation envelopes and print the result envelopes
    Exec {
        /// Files holding one operation or a list of operations
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Submit everything at once instead of one after another
        #[arg(long)]
        parallel: bool,
        /// Print the resulting model afterwards
        #[arg(long)]
        dump: bool,
    },
    /// Print a resource of the initial model
    Read {
        /// Address in /type=name form
        #[arg(default_value = "/")]
        address: String,
        /// Include children
        #[arg(long)]
        recursive: bool,
    },
    /// Print the effective controller configuration
    Config,
}

/// An envelope file holds one operation or a list of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum Envelopes {
    One(Operation),
    Many(Vec<Operation>),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => read_json::<ControllerConfig>(path)?,
        None => ControllerConfig::default(),
    };
    let root = match &cli.model {
        Some(path) => read_json::<Resource>(path)?,
        None => Resource::new(),
    };

    match cli.command {
        Commands::Exec { files, parallel, dump } => {
            let mut operations = Vec::new();
            for path in &files {
                match read_json::<Envelopes>(path)? {
                    Envelopes::One(operation) => operations.push(operation),
                    Envelopes::Many(many) => operations.extend(many),
                }
            }

            let controller = ModelController::builder().with_config(config).with_root(root).build();
            info!(operations = operations.len(), parallel, "Executing operations");

            let mut failures = 0;
            if parallel {
                let handles: Vec<_> = operations.into_iter().map(|op| controller.submit(op)).collect();
                for handle in handles {
                    failures += report(handle.result().await)?;
                }
            } else {
                for operation in operations {
                    failures += report(controller.execute(operation).await)?;
                }
            }

            if dump {
                let root = controller.read_resource(&Address::root())?;
                println!("{}", serde_json::to_string_pretty(&root.to_value(true))?);
            }
            if failures > 0 {
                warn!(failures, "Some operations did not succeed");
                std::process::exit(1);
            }
        }
        Commands::Read { address, recursive } => {
            let address = Address::parse(&address)?;
            let controller = ModelController::builder().with_root(root).build();
            let resource = controller.read_resource(&address)?;
            println!("{}", serde_json::to_string_pretty(&resource.to_value(recursive))?);
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Print one result envelope; returns 1 when it is not a success.
fn report(result: Result<OperationResult, ExecutionError>) -> Result<usize> {
    let response = match result {
        Ok(response) => response,
        Err(ExecutionError::Cancelled(response)) => response,
        Err(err) => return Err(err.into()),
    };
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(usize::from(!response.is_success()))
}
