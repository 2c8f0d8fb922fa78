//! sandbox-relay server
//!
//! Runs the sandbox side of the relay: accepts one authorized host
//! connection on `/ws`, executes submitted code and routes its tool calls.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sandbox_relay::{config::RelayConfig, server::RelayServer};

#[derive(Parser, Debug)]
#[command(name = "sandbox-relay")]
#[command(about = "Relay server that runs generated code and calls back to host tools")]
struct Args {
    /// Interface to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Per tool call timeout in seconds
    #[arg(long)]
    call_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        RelayConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(timeout) = args.call_timeout {
        config.call_timeout_seconds = timeout;
    }
    config.debug |= args.debug;
    config.validate()?;

    let level = if config.debug { "debug" } else { &args.log_level };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        call_timeout_seconds = config.call_timeout_seconds,
        "Loaded configuration"
    );

    let server = RelayServer::bind(&config).await?;
    server
        .serve_with_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
}
