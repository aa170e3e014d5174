//! `slmd`: run one device server from a configuration file.

use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use slm_daq::config::ServerConfig;
use slm_daq::servers;

#[derive(Parser, Debug)]
#[command(name = "slmd")]
#[command(about = "Device RPC server for SLM pattern, camera and feedback roles")]
struct Args {
    /// Configuration file (.toml or .yaml)
    #[arg(short, long, default_value = "config/pattern.yaml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(level: &str, json: bool) {
    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_thread_names(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = ServerConfig::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    init_tracing(&config.log_level, args.json_logs);
    info!(config = %args.config.display(), role = ?config.role, "Starting slmd");

    let mut server = servers::launch(&config)?;
    info!(server = %server.name(), endpoint = %server.endpoint(), "Serving");

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("installing the Ctrl-C handler")?;

    loop {
        match stop_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                info!("Shutdown signal received");
                break;
            }
            Err(mpsc::RecvTimeoutError::Timeout) if server.is_finished() => {
                error!(server = %server.name(), "Worker exited on its own");
                break;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }

    server.stop()?;
    info!("slmd stopped");
    Ok(())
}
