use anyhow::{anyhow, Result};
use beach_harbor::config::{Cli, Config};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let config = Config::from_env().with_overrides(cli);

    let harbor = beach_harbor::spawn(config).await?;
    tracing::info!(
        target = "harbor",
        http = %harbor.http_addr,
        api = %harbor.api_addr,
        "beach-harbor ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!(target = "harbor", "shutdown signal received");
    harbor.shutdown().await;
    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).try_init().map_err(|err| anyhow!(err))
}
