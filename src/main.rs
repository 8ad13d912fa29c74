//! `zajel-headlessd`: the daemon binary. Parses flags, layers them over the
//! loaded `Config`, and runs the `Supervisor` until an interrupt or
//! terminate signal arrives.

use clap::Parser;
use std::path::PathBuf;
use zajel_headless::config::Config;
use zajel_headless::supervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "zajel-headlessd", about = "Headless end-to-end-encrypted P2P messaging daemon")]
struct Cli {
    /// Instance name; determines the state directory and IPC socket name.
    #[arg(long)]
    name: Option<String>,

    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the state directory.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Override the signaling coordinator URL.
    #[arg(long)]
    coordinator_url: Option<String>,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Stay attached to the terminal instead of the default background
    /// behavior (present for parity with process managers; this daemon
    /// never forks on its own either way).
    #[arg(long, default_value_t = false)]
    foreground: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(name) = cli.name {
        config.name = name;
    }
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = Some(state_dir);
    }
    if let Some(url) = cli.coordinator_url {
        config.coordinator_url = url;
    }
    if !cli.foreground {
        tracing::debug!("running without a controlling terminal assumption; no daemonization performed");
    }

    let mut supervisor = Supervisor::new(config)?;
    tracing::info!(public_key = %supervisor.public_key()?, "identity ready");
    supervisor.start().await?;

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received");
    supervisor.shutdown().await;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
