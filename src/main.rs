use anyhow::{anyhow, Context};
use clap::Parser;
use page_capture::{setup_logging, Cli, CliRunner, Config};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose).map_err(|e| anyhow!(e))?;

    info!("Starting page-capture v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env().context("failed to load configuration")?;
    info!(
        "Capture mode {:?}, concurrency {}, segment height {}",
        config.capture.mode,
        config.max_concurrency,
        config
            .segment_height
            .map(|h| format!("{h}px"))
            .unwrap_or_else(|| "unbounded".to_string())
    );

    let runner = CliRunner::new(config);
    if let Err(e) = runner.run(args.command).await {
        error!("Application error: {}", e);
        return Err(anyhow!(e));
    }

    info!("page-capture stopped");
    Ok(())
}
