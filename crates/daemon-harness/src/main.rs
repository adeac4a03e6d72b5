use anyhow::Context;
use clap::Parser;
use daemon_harness::logging::{LogFormat, init_tracing};
use daemon_harness::{HarnessConfig, PlatformProcessManagerFactory, start_until_interrupted};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Start a set of regtest daemons, keep them up until Ctrl-C, then stop them in reverse order
#[derive(Debug, Parser)]
#[command(name = "daemon-harness", version)]
struct Cli {
    /// JSON file describing the daemons to supervise
    #[arg(short, long)]
    config: PathBuf,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    let config = HarnessConfig::from_file(&cli.config)?;
    let token = CancellationToken::new();
    let mut coordinator = config
        .into_coordinator(PlatformProcessManagerFactory::create_process_manager(), &token)
        .context("Failed to set up daemons")?;

    if let Err(e) = start_until_interrupted(&mut coordinator, &token, tokio::signal::ctrl_c()).await
    {
        error!("Startup failed: {e:#}");
        return Err(e.into());
    }

    info!("All daemons are ready - press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    coordinator.shutdown().await.context("Shutdown failed")?;
    info!("All daemons stopped");
    Ok(())
}
