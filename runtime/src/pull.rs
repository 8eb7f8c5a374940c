//! Cloud queue long-poll consumer.
//!
//! Polls a queue the cloud bus delivers to, unwraps the bus envelope and dispatches the
//! inner event. A message is deleted only once handling succeeded; otherwise it stays
//! invisible for the queue's visibility timeout and is then received again with a higher
//! receive count. Messages that keep failing past `max_receive_count` are dead-lettered
//! and deleted so they cannot cycle forever.

use crate::metrics::ConsumeMetrics;
use crate::router::{Disposition, EventRouter};
use shopwire_core::dead_letter::{DeadLetter, DeadLetterSink, Transport};
use shopwire_core::envelope::unwrap_detail;
use shopwire_core::transport::{CloudQueue, QueueMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Default messages per receive call.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Default long-poll wait.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(20);

/// Default receive count after which a failing message is dead-lettered.
pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 5;

/// Default pause after a failed receive call.
pub const DEFAULT_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Polls one cloud queue until shutdown.
pub struct PullConsumer {
    queue: Arc<dyn CloudQueue>,
    router: Arc<EventRouter>,
    shutdown: broadcast::Receiver<()>,
    batch_size: usize,
    wait: Duration,
    max_receive_count: u32,
    error_pause: Duration,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
}

impl PullConsumer {
    /// Create a consumer receiving 5 messages per 20 second long-poll.
    #[must_use]
    pub fn new(queue: Arc<dyn CloudQueue>, router: Arc<EventRouter>, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            queue,
            router,
            shutdown,
            batch_size: DEFAULT_BATCH_SIZE,
            wait: DEFAULT_WAIT,
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
            error_pause: DEFAULT_ERROR_PAUSE,
            dead_letters: None,
        }
    }

    /// Set messages per receive call.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the long-poll wait.
    #[must_use]
    pub const fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Set the receive count after which failing messages are dead-lettered.
    #[must_use]
    pub const fn with_max_receive_count(mut self, max_receive_count: u32) -> Self {
        self.max_receive_count = max_receive_count;
        self
    }

    /// Set the pause after a failed receive.
    #[must_use]
    pub const fn with_error_pause(mut self, pause: Duration) -> Self {
        self.error_pause = pause;
        self
    }

    /// Where poison messages go.
    #[must_use]
    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Spawn the consumer as a background task.
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Poll until shutdown is signalled.
    pub async fn run(mut self) {
        info!(queue_url = self.queue.queue_url(), "Pull consumer started");

        loop {
            let received = tokio::select! {
                _ = self.shutdown.recv() => break,
                received = self.queue.receive(self.batch_size, self.wait) => received,
            };

            match received {
                Ok(messages) => {
                    if !messages.is_empty() {
                        debug!(queue_url = self.queue.queue_url(), count = messages.len(), "Received messages");
                    }
                    for message in messages {
                        self.settle(message).await;
                    }
                }
                Err(e) => {
                    error!(queue_url = self.queue.queue_url(), error = %e, "Receive failed, polling again");
                    tokio::select! {
                        _ = self.shutdown.recv() => break,
                        () = tokio::time::sleep(self.error_pause) => {}
                    }
                }
            }
        }

        info!(queue_url = self.queue.queue_url(), "Pull consumer stopped");
    }

    async fn settle(&self, message: QueueMessage) {
        let payload = match unwrap_detail(&message.body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "Malformed envelope");
                ConsumeMetrics::record(Transport::CloudQueue, Disposition::DeadLetter.label());
                self.dead_letter_and_delete(&message, &e.to_string()).await;
                return;
            }
        };

        let outcome = self.router.dispatch(&payload).await;
        let disposition = outcome.disposition();
        ConsumeMetrics::record(Transport::CloudQueue, disposition.label());

        match disposition {
            Disposition::Acknowledge => self.delete(&message).await,
            Disposition::Redeliver if message.receive_count < self.max_receive_count => {
                debug!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    "Leaving message for redelivery"
                );
            }
            Disposition::Redeliver | Disposition::DeadLetter => {
                let reason = outcome.failure_reason().unwrap_or_default();
                self.dead_letter_and_delete(&message, &reason).await;
            }
        }
    }

    async fn dead_letter_and_delete(&self, message: &QueueMessage, reason: &str) {
        match &self.dead_letters {
            Some(sink) => {
                let letter = DeadLetter::new(
                    queue_name(self.queue.queue_url()),
                    Transport::CloudQueue,
                    message.body.as_bytes(),
                    reason,
                    message.receive_count,
                );
                if let Err(e) = sink.dead_letter(&letter).await {
                    error!(message_id = %message.message_id, error = %e, "Dead-lettering failed, leaving message");
                    return;
                }
                ConsumeMetrics::record_dead_letter(Transport::CloudQueue);
                warn!(message_id = %message.message_id, receive_count = message.receive_count, reason, "Message dead-lettered");
            }
            None => {
                error!(message_id = %message.message_id, reason, "No dead-letter sink configured, dropping message");
            }
        }
        self.delete(message).await;
    }

    async fn delete(&self, message: &QueueMessage) {
        if let Err(e) = self.queue.delete(&message.receipt_handle).await {
            error!(message_id = %message.message_id, error = %e, "Failed to delete message");
        }
    }
}

/// Last path segment of a queue URL, which is the queue's name.
fn queue_name(url: &str) -> &str {
    url.trim_end_matches('/').rsplit('/').next().unwrap_or(url)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::router::{FailurePolicy, HandlerError, handler_fn};
    use shopwire_core::event::{DomainEvent, EventKind, Product, ProductSelection};
    use shopwire_testing::{InMemoryCloudQueue, InMemoryDeadLetters};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cart_event() -> DomainEvent {
        DomainEvent::AddToCart(ProductSelection {
            user_id: "u1".to_string(),
            product: Product::new("p1"),
            qty: 1,
        })
    }

    fn router(calls: &Arc<AtomicUsize>, fail_first: usize) -> Arc<EventRouter> {
        let calls = Arc::clone(calls);
        Arc::new(EventRouter::new("shopping").route(
            EventKind::AddToCart,
            FailurePolicy::Redeliver,
            handler_fn(move |_event: DomainEvent| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < fail_first {
                        Err(HandlerError::new("database down"))
                    } else {
                        Ok(())
                    }
                }
            }),
        ))
    }

    #[test]
    fn queue_name_is_last_url_segment() {
        assert_eq!(queue_name("https://sqs.ap-south-1.amazonaws.com/123/shopping-events"), "shopping-events");
        assert_eq!(queue_name("local-queue"), "local-queue");
    }

    #[tokio::test(start_paused = true)]
    async fn success_deletes_and_message_never_returns() {
        let queue = InMemoryCloudQueue::new("q");
        queue.send_event("catalog.service", &cart_event());
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = broadcast::channel(1);
        let handle = PullConsumer::new(Arc::new(queue.clone()), router(&calls, 0), rx).spawn();

        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
        assert_eq!(queue.deleted_count(), 1);
        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_message_is_redelivered_after_visibility_timeout() {
        let queue = InMemoryCloudQueue::new("q").with_visibility_timeout(Duration::from_secs(30));
        queue.send_event("catalog.service", &cart_event());
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = broadcast::channel(1);
        let handle = PullConsumer::new(Arc::new(queue.clone()), router(&calls, 1), rx).spawn();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.in_flight(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());
        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn repeatedly_failing_message_is_dead_lettered_at_max_receive_count() {
        let queue = InMemoryCloudQueue::new("q").with_visibility_timeout(Duration::from_secs(1));
        queue.send_event("catalog.service", &cart_event());
        let dead_letters = InMemoryDeadLetters::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = broadcast::channel(1);
        let handle = PullConsumer::new(Arc::new(queue.clone()), router(&calls, usize::MAX), rx)
            .with_max_receive_count(3)
            .with_dead_letters(Arc::new(dead_letters.clone()))
            .spawn();

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(queue.is_empty());
        let letters = dead_letters.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(letters[0].transport, Transport::CloudQueue);
        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_envelope_is_dead_lettered_immediately() {
        let queue = InMemoryCloudQueue::new("q");
        queue.send("{not json");
        let dead_letters = InMemoryDeadLetters::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = broadcast::channel(1);
        let handle = PullConsumer::new(Arc::new(queue.clone()), router(&calls, 0), rx)
            .with_dead_letters(Arc::new(dead_letters.clone()))
            .spawn();

        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(queue.is_empty());
        assert_eq!(dead_letters.letters()[0].payload, "{not json");
        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn receive_errors_do_not_stop_polling() {
        let queue = InMemoryCloudQueue::new("q");
        queue.fail_next_receives(3);
        queue.send_event("catalog.service", &cart_event());
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = broadcast::channel(1);
        let handle = PullConsumer::new(Arc::new(queue.clone()), router(&calls, 0), rx).spawn();

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_events_are_deleted_without_dispatch() {
        let queue = InMemoryCloudQueue::new("q");
        queue.send(r#"{"detail-type":"Other","detail":{"event":"SomethingElse","data":{}}}"#);
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = broadcast::channel(1);
        let handle = PullConsumer::new(Arc::new(queue.clone()), router(&calls, 0), rx).spawn();

        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(queue.is_empty());
        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
