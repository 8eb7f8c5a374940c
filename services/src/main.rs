//! Shopwire service process.
//!
//! Runs the catalog, customer or shopping service per `SERVICE_NAME` until ctrl-c.

use anyhow::Context;
use shopwire_runtime::metrics::MetricsServer;
use shopwire_services::{Resources, Service, ServiceConfig};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "shopwire=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::from_env().context("Invalid configuration")?;
    info!(
        service = %config.service,
        exchange = %config.broker.exchange,
        queue = %config.broker.queue,
        cloud_bus = ?config.cloud.event_bus,
        cloud_queue = ?config.cloud.queue_url,
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr {
        let mut server = MetricsServer::new(addr);
        server.start().context("Failed to start metrics server")?;
        info!(%addr, "Metrics available at /metrics");
    }

    let resources = Resources::from_config(&config).await?;
    Service::from_parts(&config, resources)?.run_until_ctrl_c().await
}
