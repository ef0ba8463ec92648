//! Storage Pool Agent
//!
//! One-shot provisioning of the node's storage pool. Reads an agent
//! configuration, builds the kernel LVM volume group or SPDK lvstore it
//! describes, and prints the resulting pool descriptor as JSON.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_pool_agent::{AgentConfig, PoolBuilder, PoolBuilderDeps, PoolMode, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Pool Agent - provision a kernel LVM or SPDK lvstore pool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Agent configuration file (YAML)
    #[arg(long, env = "POOL_AGENT_CONFIG", default_value = "/etc/storage-pool-agent/config.yaml")]
    config: PathBuf,

    /// Override the pool mode (KernelLVM or SpdkLVStore)
    #[arg(long, env = "POOL_MODE")]
    mode: Option<String>,

    /// Override the SPDK JSON-RPC socket path
    #[arg(long, env = "SPDK_SOCKET")]
    spdk_socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Remove files, loop devices and bdevs created by a failed attempt
    #[arg(long, env = "CLEANUP_ON_FAILURE")]
    cleanup_on_failure: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Storage Pool Agent");
    info!("  Version: {}", storage_pool_agent::VERSION);
    info!("  Config: {}", args.config.display());

    let config = load_config(&args).await?;
    info!("  Mode: {}", config.mode);
    info!("  Pool: {}", config.storage.pooling.name);
    info!("  SPDK socket: {}", config.spdk_socket.display());

    let builder = PoolBuilder::from_config(&config, PoolBuilderDeps::host(&config));
    let outcome = builder.build_tracked().await;

    match outcome.result {
        Ok(desc) => {
            info!("pool {} is ready", desc.name());
            println!("{}", serde_json::to_string_pretty(&desc)?);
            Ok(())
        }
        Err(e) => {
            error!("provisioning failed: {} (action: {:?})", e, e.action());
            if args.cleanup_on_failure && !outcome.artifacts.is_empty() {
                let report = builder.cleanup(&outcome.artifacts).await;
                info!("cleanup removed {} artifacts", report.removed.len());
                for (artifact, reason) in &report.failed {
                    warn!("left behind {}: {}", artifact, reason);
                }
            }
            Err(e)
        }
    }
}

async fn load_config(args: &Args) -> Result<AgentConfig> {
    let mut config = AgentConfig::from_file(&args.config).await?;

    if let Some(mode) = args.mode.as_deref() {
        config.mode = mode.parse::<PoolMode>()?;
    }
    if let Some(socket) = &args.spdk_socket {
        config.spdk_socket = socket.clone();
    }

    Ok(config)
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
