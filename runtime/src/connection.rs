//! Broker connection with bounded retry.
//!
//! A service opens exactly one broker channel at startup and shares it between its
//! publisher and its push consumer. If the broker cannot be reached within the retry
//! budget the service must not start, so [`ConnectionManager::connect`] returns an error
//! the binary treats as fatal.

use crate::metrics::ConnectionMetrics;
use crate::retry::{RetryPolicy, retry};
use shopwire_core::transport::{BrokerChannel, BrokerConnector, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

/// Default number of connection attempts.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;

/// Default pause between connection attempts.
pub const DEFAULT_CONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// The broker could not be reached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Every attempt failed.
    #[error("Could not connect to broker at {url} after {attempts} attempts: {source}")]
    Exhausted {
        /// Broker address with credentials removed
        url: String,
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        #[source]
        source: TransportError,
    },
}

/// Establishes the process-wide broker channel.
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    policy: RetryPolicy,
}

impl ConnectionManager {
    /// Create a manager making 5 attempts 5 seconds apart.
    #[must_use]
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            connector,
            policy: RetryPolicy::fixed(DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_INTERVAL),
        }
    }

    /// Replace the retry policy, e.g. with exponential backoff.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Current retry policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Connect and assert `exchange`, retrying per the policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Exhausted`] once the retry budget is spent.
    pub async fn connect(
        &self,
        url: &str,
        exchange: &str,
    ) -> Result<Arc<dyn BrokerChannel>, ConnectionError> {
        let redacted = redact_url(url);
        info!(url = %redacted, exchange, "Connecting to broker");

        let result = retry(&self.policy, |attempt| {
            ConnectionMetrics::record_attempt();
            tracing::debug!(attempt, url = %redacted, "Broker connection attempt");
            self.connector.connect(url, exchange)
        })
        .await;

        match result {
            Ok(channel) => {
                info!(url = %redacted, exchange, "Connected to broker");
                Ok(channel)
            }
            Err(exhausted) => {
                ConnectionMetrics::record_exhausted();
                error!(
                    url = %redacted,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "Giving up on broker connection"
                );
                Err(ConnectionError::Exhausted {
                    url: redacted,
                    attempts: exhausted.attempts,
                    source: exhausted.last_error,
                })
            }
        }
    }
}

/// Strip `user:password@` from a URL for logging.
#[must_use]
pub fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://***@{}", &url[..scheme_end], &rest[at + 1..]),
        None => url.to_string(),
    }
}
