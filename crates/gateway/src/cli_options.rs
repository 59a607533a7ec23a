//! CLI options for the Meridian gateway
//!
//! The gateway hosts the service registry, the health monitor and the
//! message bus, and serves the bus HTTP endpoints.

use crate::manifest::ServiceManifest;
use clap::Parser;
use meridian_shared::service_bus::{BusServer, HealthMonitor, MessageBus, ServiceRegistry};
use meridian_shared::{BusOptions, LoggingOptions, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Meridian Gateway - service registry and message bus
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct GatewayCliOptions {
    /// Address the bus HTTP endpoints listen on
    #[arg(
        short,
        long,
        default_value = "127.0.0.1:4000",
        env = "MERIDIAN_LISTEN_ADDR"
    )]
    pub listen_addr: SocketAddr,

    /// JSON manifest of remote services registered at startup
    #[arg(short, long, env = "MERIDIAN_SERVICE_MANIFEST")]
    pub manifest: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingOptions,

    #[command(flatten)]
    pub bus: BusOptions,
}

impl GatewayCliOptions {
    /// Runs the gateway until Ctrl-C
    ///
    /// Startup order: build the bus, register manifest services, recover
    /// durable messages and open the bus, start health monitoring, serve.
    pub async fn run(self) -> Result<()> {
        let config = self.bus.to_config()?;
        info!(
            listen_addr = %self.listen_addr,
            service_name = %config.service_name,
            durable_queue = ?config.durable_queue_dir,
            poll_interval_secs = config.health_poll_interval.as_secs(),
            eviction_window_secs = config.eviction_window.as_secs(),
            "Configuration loaded successfully"
        );

        let registry = ServiceRegistry::with_event_capacity(config.event_channel_capacity);
        let bus = Arc::new(MessageBus::from_config(registry.clone(), config.clone()).await?);

        if let Some(path) = &self.manifest {
            ServiceManifest::load(path)
                .await?
                .register_all(&registry)
                .await?;
        }

        let report = bus.start().await?;
        if report.rescheduled > 0 {
            warn!(
                rescheduled = report.rescheduled,
                "Some recovered messages are still undeliverable"
            );
        }

        let monitor = HealthMonitor::new(registry.clone(), &config);
        monitor.start().await;

        let result = BusServer::new(bus.clone(), self.listen_addr)
            .run_until(shutdown_signal())
            .await;

        monitor.stop().await;
        bus.stop().await;

        match result {
            Ok(()) => {
                info!("Gateway stopped normally");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Gateway encountered an error");
                Err(e)
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}
