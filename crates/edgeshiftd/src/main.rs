//! edgeshiftd: the edgeshift daemon.
//!
//! Single binary that assembles every edgeshift subsystem:
//! - Instance registry + rollout history (redb)
//! - Health prober
//! - Routing table publisher
//! - Telemetry gatekeeper
//! - Rollout controller
//! - REST API + Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! edgeshiftd run --config /etc/edgeshift/edgeshift.toml
//! edgeshiftd check --config edgeshift.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use edgeshift_core::EdgeshiftConfig;
use edgeshiftd::{Daemon, open_history, summary};

const DEFAULT_FILTER: &str = "info,edgeshiftd=debug,edgeshift=debug";

#[derive(Parser)]
#[command(name = "edgeshiftd", about = "edgeshift rollout daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator and its API server.
    Run {
        /// Path to edgeshift.toml.
        #[arg(long, short, default_value = "edgeshift.toml")]
        config: PathBuf,

        /// Log output format.
        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
    /// Validate a config file and print what it describes.
    Check {
        /// Path to edgeshift.toml.
        #[arg(long, short, default_value = "edgeshift.toml")]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, log_format } => {
            init_tracing(log_format);
            run(config).await
        }
        Command::Check { config } => {
            let parsed = EdgeshiftConfig::from_file(&config)
                .with_context(|| format!("checking {}", config.display()))?;
            print!("{}", summary(&parsed));
            println!("config ok");
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = ?config_path, "edgeshift daemon starting");

    let config = EdgeshiftConfig::from_file(&config_path)?;
    let (history, _) = open_history(&config)?;
    let daemon = Daemon::assemble(&config, history);

    let addr: SocketAddr = config
        .server
        .listen
        .parse()
        .with_context(|| format!("invalid server.listen {}", config.server.listen))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server starting");

    axum::serve(listener, daemon.router())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    daemon.shutdown().await;
    info!("edgeshift daemon stopped");
    Ok(())
}
