//! Dead letters: messages that repeatedly failed processing.
//!
//! Consumers stop retrying a message once its retry budget is spent and hand it to a
//! [`DeadLetterSink`] before acknowledging it, so a poison message cannot loop forever
//! while its content is still kept for investigation and manual replay.

use crate::transport::TransportError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport a dead letter was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Broker push delivery
    Broker,
    /// Cloud queue pull delivery
    CloudQueue,
}

impl Transport {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Broker => "broker",
            Self::CloudQueue => "cloud_queue",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message that failed processing for good.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// Consuming queue
    pub queue: String,
    /// Transport the message arrived on
    pub transport: Transport,
    /// Raw message body, lossily decoded as UTF-8
    pub payload: String,
    /// Why processing was abandoned
    pub reason: String,
    /// Processing attempts made
    pub attempts: u32,
    /// When the message was abandoned
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Record a failure now.
    #[must_use]
    pub fn new(
        queue: impl Into<String>,
        transport: Transport,
        payload: &[u8],
        reason: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            queue: queue.into(),
            transport,
            payload: String::from_utf8_lossy(payload).into_owned(),
            reason: reason.into(),
            attempts,
            failed_at: Utc::now(),
        }
    }
}

/// Destination for dead letters.
pub trait DeadLetterSink: Send + Sync {
    /// Store a dead letter.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the letter could not be stored.
    fn dead_letter(&self, letter: &DeadLetter) -> BoxFuture<'_, Result<(), TransportError>>;
}
