//! Mirzam daemon binary
//!
//! The main coordinating process: loads the runtime configuration,
//! optionally detaches from the terminal, and spawns the configured
//! worker roles.

use clap::Parser;
use daemon::Result;
use mirzam_core::config::{load_runtime_from_toml_path, RuntimeConfig};
use std::path::PathBuf;
use tracing::{info, warn};

/// Multi-process application server runtime
#[derive(Debug, Parser)]
#[command(name = "mirzamd", version, about)]
struct Args {
    /// Path to the runtime configuration (TOML)
    #[arg(short, long, env = "MIRZAM_CONFIG")]
    config: Option<PathBuf>,

    /// Stay in the foreground even when the configuration daemonizes
    #[arg(long)]
    no_daemon: bool,

    /// Log level filter (e.g. info, debug, mirzam_core=trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    mirzam_core::utils::init_tracing(&args.log_level)?;

    let mut config = match &args.config {
        Some(path) => load_runtime_from_toml_path(path)?,
        None => RuntimeConfig::default(),
    };
    if args.no_daemon {
        config.daemonize = false;
    }

    if config.roles.is_empty() {
        warn!("No roles configured; nothing to spawn");
    }

    info!("Starting Mirzam daemon");
    daemon::run(&config)?;
    info!("Daemon stopped");
    Ok(())
}
