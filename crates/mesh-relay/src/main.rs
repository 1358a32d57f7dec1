// Numan Thabit 2025
use anyhow::Result;
use clap::Parser;
use mesh_relay::{config::CliArgs, config::MeshConfig, http, metrics::MeshMetrics, runtime::Runtime, signals};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let config = MeshConfig::from_cli(&cli)?;
    let rt = match Runtime::start(config, MeshMetrics::new()).await {
        Ok(rt) => rt,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "failed to start dispatcher");
            return Err(err);
        }
    };

    let signals = signals::spawn(rt.clone())?;
    let served = http::serve(rt.clone()).await;
    rt.close().await;
    signals.abort();
    served
}
