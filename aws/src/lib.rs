//! AWS adapters for Shopwire's cloud transport.
//!
//! - [`EventBridgeBus`] implements [`CloudBus`](shopwire_core::CloudBus) with `PutEvents`
//! - [`SqsQueue`] implements [`CloudQueue`](shopwire_core::CloudQueue) with long-polling
//!   `ReceiveMessage` and `DeleteMessage`
//!
//! An EventBridge rule routes each service's events into that service's SQS queue, which
//! the pull consumer drains.
//!
//! # Example
//!
//! ```no_run
//! use shopwire_aws::{AwsSettings, EventBridgeBus, SqsQueue};
//!
//! # async fn example() {
//! let sdk = AwsSettings::new("ap-south-1").load().await;
//! let bus = EventBridgeBus::new(&sdk);
//! let queue = SqsQueue::new(&sdk, "https://sqs.ap-south-1.amazonaws.com/000/products");
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod eventbridge;
mod sqs;

pub use eventbridge::EventBridgeBus;
pub use sqs::SqsQueue;

use aws_config::{BehaviorVersion, Region, SdkConfig};

/// Region and optional overrides for the AWS clients.
///
/// Without explicit credentials the default provider chain is used (environment,
/// profile, instance role).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsSettings {
    region: String,
    credentials: Option<(String, String)>,
    endpoint_url: Option<String>,
}

impl AwsSettings {
    /// Settings for `region`.
    #[must_use]
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            credentials: None,
            endpoint_url: None,
        }
    }

    /// Use a static access key pair instead of the provider chain.
    #[must_use]
    pub fn with_credentials(mut self, access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        self.credentials = Some((access_key_id.into(), secret_access_key.into()));
        self
    }

    /// Send every request to `endpoint_url`, e.g. a LocalStack container.
    #[must_use]
    pub fn with_endpoint_url(mut self, endpoint_url: impl Into<String>) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }

    /// Configured region.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Resolve the shared SDK configuration.
    pub async fn load(&self) -> SdkConfig {
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(self.region.clone()));

        if let Some((access_key, secret_key)) = &self.credentials {
            loader = loader.credentials_provider(aws_sdk_sqs::config::Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "shopwire-static",
            ));
        }
        if let Some(endpoint) = &self.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        let config = loader.load().await;
        tracing::info!(
            region = %self.region,
            explicit_creds = self.credentials.is_some(),
            endpoint = ?self.endpoint_url,
            "AWS SDK configured"
        );
        config
    }
}
