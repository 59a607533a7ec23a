//! # Meridian Gateway - Main Entry Point

use clap::Parser;
use meridian_gateway::GatewayCliOptions;
use meridian_shared::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli_opts = GatewayCliOptions::parse();

    cli_opts.logging.init_logging()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Meridian Gateway"
    );

    cli_opts.run().await
}
