//! Service configuration.
//!
//! Loaded from environment variables with defaults. A `.env` file in the working
//! directory is read first, without overriding variables already set.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    /// A variable is set to something unusable
    #[error("Invalid value '{value}' for {var}: {reason}")]
    Invalid {
        /// Variable name
        var: &'static str,
        /// Value as set
        value: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Which service this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Products and inventory
    Catalog,
    /// Profiles, wishlists and order history
    Customer,
    /// Carts and order placement
    Shopping,
}

impl ServiceKind {
    /// Service name, also the cloud envelope source prefix.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Catalog => "catalog",
            Self::Customer => "customer",
            Self::Shopping => "shopping",
        }
    }

    /// Queue consumed when `QUEUE_NAME` is not set.
    #[must_use]
    pub const fn default_queue(self) -> &'static str {
        match self {
            Self::Catalog => crate::catalog::QUEUE,
            Self::Customer => crate::customer::QUEUE,
            Self::Shopping => crate::shopping::QUEUE,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            // The catalog service was deployed as "products"
            "catalog" | "products" => Ok(Self::Catalog),
            "customer" => Ok(Self::Customer),
            "shopping" => Ok(Self::Shopping),
            other => Err(format!("unknown service '{other}', expected catalog, customer or shopping")),
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Broker URL (`MSG_QUEUE_URL`)
    pub url: String,
    /// Exchange all services publish to (`EXCHANGE_NAME`)
    pub exchange: String,
    /// Queue this service consumes (`QUEUE_NAME`)
    pub queue: String,
    /// Connection attempts before giving up (`BROKER_CONNECT_ATTEMPTS`, default 5)
    pub connect_attempts: u32,
    /// Wait between connection attempts (`BROKER_CONNECT_INTERVAL_SECS`, default 5)
    pub connect_interval: Duration,
}

/// Cloud bus and queue settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudConfig {
    /// Region (`AWS_REGION`, default `ap-south-1`)
    pub region: String,
    /// Bus to publish to; unset disables the cloud sink (`EVENT_BUS_NAME`)
    pub event_bus: Option<String>,
    /// Queue to long-poll; unset disables the pull consumer (`SQS_QUEUE_URL`)
    pub queue_url: Option<String>,
    /// Messages per receive (`POLL_BATCH_SIZE`, default 5)
    pub batch_size: usize,
    /// Long-poll wait (`POLL_WAIT_SECS`, default 20)
    pub poll_wait: Duration,
    /// Receives before a failing message is dead-lettered (`MAX_RECEIVE_COUNT`, default 5)
    pub max_receive_count: u32,
}

/// Handler execution settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Per-message timeout (`HANDLER_TIMEOUT_SECS`, default 30)
    pub timeout: Duration,
    /// Attempts per broker delivery (`HANDLER_MAX_ATTEMPTS`, default 3)
    pub max_attempts: u32,
}

/// Configuration of one service process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Service to run (`SERVICE_NAME`)
    pub service: ServiceKind,
    /// Broker settings
    pub broker: BrokerConfig,
    /// Cloud settings
    pub cloud: CloudConfig,
    /// Marker store URL (`REDIS_URL`, default `redis://localhost:6379`)
    pub redis_url: String,
    /// Handler settings
    pub handler: HandlerConfig,
    /// Prometheus listener; unset disables metrics export (`METRICS_ADDR`)
    pub metrics_addr: Option<SocketAddr>,
}

impl ServiceConfig {
    /// Load from the process environment, after reading `.env` if present.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is the normal case in deployments
        let _ = dotenvy::dotenv();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or a value is invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(&lookup);
        let service: ServiceKind = vars.parse_required("SERVICE_NAME")?;

        Ok(Self {
            service,
            broker: BrokerConfig {
                url: vars.required("MSG_QUEUE_URL")?,
                exchange: vars.required("EXCHANGE_NAME")?,
                queue: vars
                    .optional("QUEUE_NAME")
                    .unwrap_or_else(|| service.default_queue().to_string()),
                connect_attempts: vars.parse_or("BROKER_CONNECT_ATTEMPTS", 5)?,
                connect_interval: Duration::from_secs(vars.parse_or("BROKER_CONNECT_INTERVAL_SECS", 5)?),
            },
            cloud: CloudConfig {
                region: vars.optional("AWS_REGION").unwrap_or_else(|| "ap-south-1".to_string()),
                event_bus: vars.optional("EVENT_BUS_NAME"),
                queue_url: vars.optional("SQS_QUEUE_URL"),
                batch_size: vars.parse_or("POLL_BATCH_SIZE", 5)?,
                poll_wait: Duration::from_secs(vars.parse_or("POLL_WAIT_SECS", 20)?),
                max_receive_count: vars.parse_or("MAX_RECEIVE_COUNT", 5)?,
            },
            redis_url: vars
                .optional("REDIS_URL")
                .unwrap_or_else(|| "redis://localhost:6379".to_string()),
            handler: HandlerConfig {
                timeout: Duration::from_secs(vars.parse_or("HANDLER_TIMEOUT_SECS", 30)?),
                max_attempts: vars.parse_or("HANDLER_MAX_ATTEMPTS", 3)?,
            },
            metrics_addr: vars.parse_optional("METRICS_ADDR")?,
        })
    }
}

struct Vars<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    /// Set and non-blank.
    fn optional(&self, var: &str) -> Option<String> {
        (self.0)(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.optional(var).ok_or(ConfigError::Missing(var))
    }

    fn parse_optional<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.optional(var)
            .map(|value| {
                value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                    var,
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn parse_required<T>(&self, var: &'static str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.parse_optional(var)?.ok_or(ConfigError::Missing(var))
    }

    fn parse_or<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        Ok(self.parse_optional(var)?.unwrap_or(default))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        ServiceConfig::from_lookup(|var| vars.get(var).cloned())
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("SERVICE_NAME", "catalog"),
        ("MSG_QUEUE_URL", "kafka://localhost:9092"),
        ("EXCHANGE_NAME", "shopping"),
    ];

    #[test]
    fn defaults_apply() {
        let config = load(&REQUIRED).unwrap();

        assert_eq!(config.service, ServiceKind::Catalog);
        assert_eq!(config.broker.queue, "products_service");
        assert_eq!(config.broker.connect_attempts, 5);
        assert_eq!(config.broker.connect_interval, Duration::from_secs(5));
        assert_eq!(config.cloud.region, "ap-south-1");
        assert_eq!(config.cloud.event_bus, None);
        assert_eq!(config.cloud.batch_size, 5);
        assert_eq!(config.cloud.poll_wait, Duration::from_secs(20));
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert_eq!(config.handler.timeout, Duration::from_secs(30));
        assert_eq!(config.handler.max_attempts, 3);
        assert_eq!(config.metrics_addr, None);
    }

    #[test]
    fn overrides_are_read() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("SERVICE_NAME", "customer"),
            ("QUEUE_NAME", "customer_blue"),
            ("EVENT_BUS_NAME", "shopwire-bus"),
            ("SQS_QUEUE_URL", "http://localhost:4566/000000000000/customer"),
            ("HANDLER_TIMEOUT_SECS", "5"),
            ("METRICS_ADDR", "0.0.0.0:9100"),
        ]);
        let config = load(&pairs).unwrap();

        assert_eq!(config.service, ServiceKind::Customer);
        assert_eq!(config.broker.queue, "customer_blue");
        assert_eq!(config.cloud.event_bus.as_deref(), Some("shopwire-bus"));
        assert!(config.cloud.queue_url.is_some());
        assert_eq!(config.handler.timeout, Duration::from_secs(5));
        assert_eq!(config.metrics_addr, Some("0.0.0.0:9100".parse().unwrap()));
    }

    #[test]
    fn missing_exchange_is_reported() {
        let result = load(&REQUIRED[..2]);
        assert_eq!(result, Err(ConfigError::Missing("EXCHANGE_NAME")));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("EVENT_BUS_NAME", "  "));
        assert_eq!(load(&pairs).unwrap().cloud.event_bus, None);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("POLL_BATCH_SIZE", "many"));
        assert!(matches!(
            load(&pairs),
            Err(ConfigError::Invalid { var: "POLL_BATCH_SIZE", .. })
        ));
    }

    #[test]
    fn unknown_service_is_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("SERVICE_NAME", "billing"));
        assert!(matches!(load(&pairs), Err(ConfigError::Invalid { var: "SERVICE_NAME", .. })));
    }

    #[test]
    fn products_is_an_alias_for_catalog() {
        assert_eq!("products".parse::<ServiceKind>(), Ok(ServiceKind::Catalog));
    }
}
