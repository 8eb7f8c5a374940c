//! Broker push consumer with manual acknowledgement.
//!
//! Binds a durable queue to the router's routing keys and settles every delivery
//! explicitly:
//!
//! ```text
//! loop {
//!     bind queue ── fails ──▶ wait, bind again
//!     for delivery in stream {
//!         dispatch ── Acknowledge ──▶ ack
//!                  ── DeadLetter ───▶ dead-letter, ack
//!                  ── Redeliver ────▶ back off, dispatch again
//!                                     (after max attempts: dead-letter, ack)
//!     }
//!     stream ended ──▶ wait, bind again
//! }
//! ```
//!
//! Nothing is acknowledged before its handler finished, so a crash mid-handler leaves the
//! delivery on the broker for the next consumer.

use crate::metrics::ConsumeMetrics;
use crate::retry::RetryPolicy;
use crate::router::{Disposition, EventRouter};
use futures::StreamExt;
use futures::future::BoxFuture;
use shopwire_core::dead_letter::{DeadLetter, DeadLetterSink, Transport};
use shopwire_core::transport::{BrokerChannel, Delivery, DeliveryStream, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Default wait before re-binding after the delivery stream ends.
pub const DEFAULT_REBIND_DELAY: Duration = Duration::from_secs(5);

/// Default in-process handler attempts before a delivery is dead-lettered.
pub const DEFAULT_HANDLER_ATTEMPTS: u32 = 3;

/// Routing key dead letters from `queue` are published under.
#[must_use]
pub fn dead_letter_routing_key(queue: &str) -> String {
    format!("dead_letter.{queue}")
}

/// Dead-letter sink that publishes letters back to the broker.
///
/// Each letter is published as JSON under [`dead_letter_routing_key`] for its queue.
pub struct BrokerDeadLetters {
    channel: Arc<dyn BrokerChannel>,
}

impl BrokerDeadLetters {
    /// Publish dead letters on `channel`.
    #[must_use]
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self { channel }
    }
}

impl DeadLetterSink for BrokerDeadLetters {
    fn dead_letter(&self, letter: &DeadLetter) -> BoxFuture<'_, Result<(), TransportError>> {
        let routing_key = dead_letter_routing_key(&letter.queue);
        let body = serde_json::to_vec(letter);

        Box::pin(async move {
            let body = body.map_err(|e| TransportError::PublishFailed {
                destination: routing_key.clone(),
                reason: e.to_string(),
            })?;
            self.channel.publish(&routing_key, &body).await
        })
    }
}

enum Control {
    Continue,
    Stop,
}

/// Consumes one queue from the broker until shutdown.
pub struct PushConsumer {
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    routing_keys: Vec<String>,
    router: Arc<EventRouter>,
    shutdown: broadcast::Receiver<()>,
    retry: RetryPolicy,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    rebind_delay: Duration,
}

impl PushConsumer {
    /// Create a consumer binding `queue` to every routing key of `router`.
    ///
    /// Failed handlers are retried 3 times in total, starting at one second and
    /// doubling; the stream is re-bound 5 seconds after it ends.
    #[must_use]
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        queue: impl Into<String>,
        router: Arc<EventRouter>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let routing_keys = router.routing_keys();
        Self {
            channel,
            queue: queue.into(),
            routing_keys,
            router,
            shutdown,
            retry: RetryPolicy::builder()
                .max_attempts(DEFAULT_HANDLER_ATTEMPTS)
                .initial_delay(Duration::from_secs(1))
                .max_delay(Duration::from_secs(10))
                .build(),
            dead_letters: None,
            rebind_delay: DEFAULT_REBIND_DELAY,
        }
    }

    /// Bind these routing keys instead of the router's.
    #[must_use]
    pub fn with_routing_keys(mut self, routing_keys: Vec<String>) -> Self {
        self.routing_keys = routing_keys;
        self
    }

    /// Set how failed handlers are retried before dead-lettering.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Where deliveries go once retrying is pointless.
    #[must_use]
    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Set the wait before re-binding.
    #[must_use]
    pub const fn with_rebind_delay(mut self, delay: Duration) -> Self {
        self.rebind_delay = delay;
        self
    }

    /// Spawn the consumer as a background task.
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Consume until shutdown is signalled.
    pub async fn run(mut self) {
        info!(queue = %self.queue, routing_keys = ?self.routing_keys, "Push consumer started");

        loop {
            let bound = tokio::select! {
                _ = self.shutdown.recv() => break,
                bound = self.channel.bind(&self.queue, &self.routing_keys) => bound,
            };

            match bound {
                Ok(stream) => {
                    info!(queue = %self.queue, "Bound queue, consuming");
                    if matches!(self.process_stream(stream).await, Control::Stop) {
                        break;
                    }
                    warn!(queue = %self.queue, "Delivery stream ended, re-binding in {:?}", self.rebind_delay);
                }
                Err(e) => {
                    error!(
                        queue = %self.queue,
                        error = %e,
                        "Failed to bind queue, retrying in {:?}",
                        self.rebind_delay
                    );
                }
            }

            if matches!(self.pause(self.rebind_delay).await, Control::Stop) {
                break;
            }
        }

        info!(queue = %self.queue, "Push consumer stopped");
    }

    async fn process_stream(&mut self, mut stream: DeliveryStream) -> Control {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.recv() => return Control::Stop,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    if matches!(self.settle(delivery).await, Control::Stop) {
                        return Control::Stop;
                    }
                }
                Some(Err(e)) => {
                    error!(queue = %self.queue, error = %e, "Error receiving delivery");
                }
                None => return Control::Continue,
            }
        }
    }

    async fn settle(&mut self, delivery: Delivery) -> Control {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let outcome = self.router.dispatch(delivery.payload()).await;
            let disposition = outcome.disposition();

            match disposition {
                Disposition::Acknowledge => {
                    ConsumeMetrics::record(Transport::Broker, disposition.label());
                    self.ack(delivery).await;
                    return Control::Continue;
                }
                Disposition::Redeliver if attempt < max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(
                        queue = %self.queue,
                        routing_key = delivery.routing_key(),
                        attempt,
                        "Handler failed, retrying in {:?}",
                        delay
                    );
                    if matches!(self.pause(delay).await, Control::Stop) {
                        // Unacked: the broker hands it to the next consumer
                        return Control::Stop;
                    }
                    attempt += 1;
                }
                Disposition::Redeliver | Disposition::DeadLetter => {
                    let reason = outcome.failure_reason().unwrap_or_default();
                    ConsumeMetrics::record(Transport::Broker, Disposition::DeadLetter.label());
                    if self.dead_letter(&delivery, &reason, attempt).await {
                        self.ack(delivery).await;
                    }
                    return Control::Continue;
                }
            }
        }
    }

    /// Returns whether the delivery may be acknowledged.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str, attempts: u32) -> bool {
        let Some(sink) = &self.dead_letters else {
            error!(
                queue = %self.queue,
                routing_key = delivery.routing_key(),
                reason,
                "No dead-letter sink configured, dropping delivery"
            );
            return true;
        };

        let letter = DeadLetter::new(&self.queue, Transport::Broker, delivery.payload(), reason, attempts);
        match sink.dead_letter(&letter).await {
            Ok(()) => {
                ConsumeMetrics::record_dead_letter(Transport::Broker);
                warn!(queue = %self.queue, routing_key = delivery.routing_key(), attempts, reason, "Delivery dead-lettered");
                true
            }
            Err(e) => {
                error!(queue = %self.queue, error = %e, "Dead-lettering failed, leaving delivery unacknowledged");
                false
            }
        }
    }

    async fn ack(&self, delivery: Delivery) {
        let routing_key = delivery.routing_key().to_string();
        if let Err(e) = delivery.ack().await {
            error!(queue = %self.queue, routing_key, error = %e, "Failed to acknowledge delivery");
        }
    }

    async fn pause(&mut self, delay: Duration) -> Control {
        tokio::select! {
            _ = self.shutdown.recv() => Control::Stop,
            () = tokio::time::sleep(delay) => Control::Continue,
        }
    }
}
