//! Prometheus metrics for the event layer.
//!
//! Counters cover both ends of event distribution:
//! - Publishes per sink and outcome
//! - Consumed messages per transport and outcome
//! - Dead letters and skipped duplicates
//! - Broker connection attempts
//!
//! Recording is a no-op until a recorder is installed, so libraries record
//! unconditionally and only the binary decides whether to export.
//!
//! # Example
//!
//! ```rust,no_run
//! use shopwire_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Metrics available at http://localhost:9090/metrics
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use shopwire_core::dead_letter::Transport;
use std::net::SocketAddr;
use thiserror::Error;

pub use metrics::counter;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus scrape endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    started: bool,
}

impl MetricsServer {
    /// Create a server for `addr` (e.g., `0.0.0.0:9090`).
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            started: false,
        }
    }

    /// Address the endpoint listens on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether [`start`](Self::start) installed the exporter.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// Install the global recorder and start serving `/metrics`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if the listener cannot be started. An already
    /// installed recorder is logged and tolerated.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        match PrometheusBuilder::new().with_http_listener(self.addr).install() {
            Ok(()) => {
                register_metrics();
                self.started = true;
                tracing::info!(addr = %self.addr, "Metrics endpoint listening");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                if message.contains("already") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(message))
                }
            }
        }
    }
}

fn register_metrics() {
    describe_counter!(
        "events_published_total",
        "Publish attempts per sink (broker, cloud) and outcome (delivered, skipped, failed)"
    );
    describe_counter!(
        "events_consumed_total",
        "Messages consumed per transport and disposition"
    );
    describe_counter!(
        "events_dead_lettered_total",
        "Messages abandoned after exhausting their retry budget"
    );
    describe_counter!(
        "events_duplicates_skipped_total",
        "Deliveries skipped because their effect was already applied"
    );
    describe_counter!(
        "broker_connection_attempts_total",
        "Broker connection attempts"
    );
    describe_counter!(
        "broker_connection_failures_total",
        "Broker connections abandoned after the retry budget"
    );
}

/// Publisher metrics recorder.
pub struct PublishMetrics;

impl PublishMetrics {
    /// Record one sink outcome.
    pub fn record(sink: &'static str, outcome: &'static str) {
        counter!("events_published_total", "sink" => sink, "outcome" => outcome).increment(1);
    }
}

/// Consumer metrics recorder.
pub struct ConsumeMetrics;

impl ConsumeMetrics {
    /// Record a consumed message and what happened to it.
    pub fn record(transport: Transport, disposition: &'static str) {
        counter!(
            "events_consumed_total",
            "transport" => transport.as_str(),
            "disposition" => disposition
        )
        .increment(1);
    }

    /// Record a dead-lettered message.
    pub fn record_dead_letter(transport: Transport) {
        counter!("events_dead_lettered_total", "transport" => transport.as_str()).increment(1);
    }
}

/// Idempotency metrics recorder.
pub struct IdempotencyMetrics;

impl IdempotencyMetrics {
    /// Record a skipped duplicate.
    pub fn record_duplicate() {
        counter!("events_duplicates_skipped_total").increment(1);
    }
}

/// Broker connection metrics recorder.
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    /// Record one connection attempt.
    pub fn record_attempt() {
        counter!("broker_connection_attempts_total").increment(1);
    }

    /// Record an abandoned connection.
    pub fn record_exhausted() {
        counter!("broker_connection_failures_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn server_is_not_started_on_creation() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(!server.is_started());
    }

    #[test]
    fn recording_without_a_recorder_is_a_no_op() {
        PublishMetrics::record("broker", "delivered");
        ConsumeMetrics::record(Transport::CloudQueue, "acknowledge");
        ConsumeMetrics::record_dead_letter(Transport::Broker);
        IdempotencyMetrics::record_duplicate();
        ConnectionMetrics::record_attempt();
    }
}
