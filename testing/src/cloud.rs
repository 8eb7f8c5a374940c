//! In-memory cloud event bus and long-poll queue.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap on poisoned locks

use futures::future::BoxFuture;
use serde_json::{Value, json};
use shopwire_core::envelope::CloudEnvelope;
use shopwire_core::event::DomainEvent;
use shopwire_core::transport::{CloudBus, CloudQueue, QueueMessage, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct BusState {
    entries: Vec<CloudEnvelope>,
    failure: Option<String>,
    targets: Vec<InMemoryCloudQueue>,
}

/// In-memory cloud event bus.
///
/// Records every accepted entry. Queues registered with [`route_to`](Self::route_to)
/// receive a copy of each entry wrapped the way a bus rule target delivers it, with
/// `detail` as a JSON object.
#[derive(Clone, Default)]
pub struct InMemoryCloudBus {
    state: Arc<Mutex<BusState>>,
}

impl InMemoryCloudBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward every accepted entry to `queue`.
    pub fn route_to(&self, queue: &InMemoryCloudQueue) {
        self.state.lock().unwrap().targets.push(queue.clone());
    }

    /// Reject every entry with `reason` until [`recover`](Self::recover) is called.
    pub fn fail_puts(&self, reason: impl Into<String>) {
        self.state.lock().unwrap().failure = Some(reason.into());
    }

    /// Stop rejecting entries.
    pub fn recover(&self) {
        self.state.lock().unwrap().failure = None;
    }

    /// Every accepted entry, in order.
    #[must_use]
    pub fn entries(&self) -> Vec<CloudEnvelope> {
        self.state.lock().unwrap().entries.clone()
    }
}

/// Render an entry as the message body a rule target receives.
#[must_use]
pub fn rule_target_body(envelope: &CloudEnvelope) -> String {
    let detail = serde_json::from_str::<Value>(&envelope.detail)
        .unwrap_or_else(|_| Value::String(envelope.detail.clone()));
    json!({
        "version": "0",
        "detail-type": envelope.detail_type,
        "source": envelope.source,
        "detail": detail,
    })
    .to_string()
}

impl CloudBus for InMemoryCloudBus {
    fn put_event(&self, envelope: &CloudEnvelope) -> BoxFuture<'_, Result<(), TransportError>> {
        let envelope = envelope.clone();

        Box::pin(async move {
            let targets = {
                let mut state = self.state.lock().unwrap();
                if let Some(reason) = state.failure.clone() {
                    return Err(TransportError::PublishFailed {
                        destination: envelope.event_bus_name,
                        reason,
                    });
                }
                state.entries.push(envelope.clone());
                state.targets.clone()
            };

            let body = rule_target_body(&envelope);
            for target in targets {
                target.send(body.clone());
            }
            Ok(())
        })
    }
}

struct StoredMessage {
    id: String,
    body: String,
    receive_count: u32,
    visible_at: Instant,
    receipt: Option<String>,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
    next_id: u64,
    deleted: usize,
    receive_failures: usize,
    delete_failure: Option<String>,
}

/// In-memory long-poll queue with visibility timeouts.
///
/// A received message becomes invisible for the visibility timeout and reappears with an
/// incremented receive count unless deleted with its latest receipt handle. Time is read
/// from tokio's clock, so paused-time tests can step past the timeout.
#[derive(Clone)]
pub struct InMemoryCloudQueue {
    url: String,
    visibility_timeout: Duration,
    state: Arc<Mutex<QueueState>>,
    arrivals: Arc<Notify>,
}

impl InMemoryCloudQueue {
    /// Create a queue with a 30 second visibility timeout.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            visibility_timeout: Duration::from_secs(30),
            state: Arc::new(Mutex::new(QueueState::default())),
            arrivals: Arc::new(Notify::new()),
        }
    }

    /// Override the visibility timeout.
    #[must_use]
    pub const fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Enqueue a raw message body.
    pub fn send(&self, body: impl Into<String>) {
        {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let id = format!("msg-{}", state.next_id);
            state.messages.push_back(StoredMessage {
                id,
                body: body.into(),
                receive_count: 0,
                visible_at: Instant::now(),
                receipt: None,
            });
        }
        self.arrivals.notify_one();
    }

    /// Enqueue a domain event wrapped as a rule target body.
    ///
    /// # Panics
    ///
    /// Panics if the event cannot be serialized.
    pub fn send_event(&self, source: &str, event: &DomainEvent) {
        let envelope = CloudEnvelope::new(source, event.event_type(), event.to_json().unwrap(), "test-bus");
        self.send(rule_target_body(&envelope));
    }

    /// Fail the next `count` receive calls.
    pub fn fail_next_receives(&self, count: usize) {
        self.state.lock().unwrap().receive_failures = count;
    }

    /// Fail every delete with `reason`, or stop failing with `None`.
    pub fn fail_deletes(&self, reason: Option<&str>) {
        self.state.lock().unwrap().delete_failure = reason.map(str::to_string);
    }

    /// Messages not yet deleted, visible or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().messages.len()
    }

    /// Whether every message has been deleted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently received and invisible.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.visible_at > now)
            .count()
    }

    /// Number of successful deletes.
    #[must_use]
    pub fn deleted_count(&self) -> usize {
        self.state.lock().unwrap().deleted
    }

    /// Take up to `max` visible messages, or report when the next one becomes visible.
    fn take_visible(&self, max: usize) -> Result<Vec<QueueMessage>, Option<Instant>> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let mut taken = Vec::new();
        let mut next_visible: Option<Instant> = None;

        for message in &mut state.messages {
            if taken.len() == max {
                break;
            }
            if message.visible_at <= now {
                message.receive_count += 1;
                message.visible_at = now + self.visibility_timeout;
                let receipt = format!("{}-{}", message.id, message.receive_count);
                message.receipt = Some(receipt.clone());
                taken.push(QueueMessage {
                    message_id: message.id.clone(),
                    receipt_handle: receipt,
                    body: message.body.clone(),
                    receive_count: message.receive_count,
                });
            } else {
                next_visible = Some(next_visible.map_or(message.visible_at, |t| t.min(message.visible_at)));
            }
        }

        if taken.is_empty() { Err(next_visible) } else { Ok(taken) }
    }
}

impl CloudQueue for InMemoryCloudQueue {
    fn queue_url(&self) -> &str {
        &self.url
    }

    fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> BoxFuture<'_, Result<Vec<QueueMessage>, TransportError>> {
        Box::pin(async move {
            {
                let mut state = self.state.lock().unwrap();
                if state.receive_failures > 0 {
                    state.receive_failures -= 1;
                    return Err(TransportError::ReceiveFailed("service unavailable".to_string()));
                }
            }

            let deadline = Instant::now() + wait;
            loop {
                let wake_at = match self.take_visible(max_messages) {
                    Ok(messages) => return Ok(messages),
                    Err(next_visible) => next_visible.map_or(deadline, |t| t.min(deadline)),
                };
                if Instant::now() >= deadline {
                    return Ok(Vec::new());
                }

                tokio::select! {
                    () = self.arrivals.notified() => {}
                    () = tokio::time::sleep_until(wake_at) => {}
                }
            }
        })
    }

    fn delete(&self, receipt_handle: &str) -> BoxFuture<'_, Result<(), TransportError>> {
        let receipt_handle = receipt_handle.to_string();

        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if let Some(reason) = state.delete_failure.clone() {
                return Err(TransportError::DeleteFailed(reason));
            }

            let position = state
                .messages
                .iter()
                .position(|m| m.receipt.as_deref() == Some(receipt_handle.as_str()));
            match position {
                Some(index) => {
                    state.messages.remove(index);
                    state.deleted += 1;
                    Ok(())
                }
                None => Err(TransportError::DeleteFailed(format!(
                    "receipt handle {receipt_handle} is not current"
                ))),
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use shopwire_core::envelope::unwrap_detail;
    use shopwire_core::event::{CustomerCreated, Decoded, DomainEvent};

    fn event() -> DomainEvent {
        DomainEvent::CustomerCreated(CustomerCreated {
            user_id: "u1".to_string(),
            email: "a@b.c".to_string(),
            phone: String::new(),
        })
    }

    #[tokio::test]
    async fn bus_forwards_entries_to_routed_queues() {
        let bus = InMemoryCloudBus::new();
        let queue = InMemoryCloudQueue::new("q");
        bus.route_to(&queue);

        let event = event();
        let envelope = CloudEnvelope::new("customer.service", event.event_type(), event.to_json().unwrap(), "bus");
        bus.put_event(&envelope).await.unwrap();

        let messages = queue.receive(5, Duration::ZERO).await.unwrap();
        assert_eq!(messages.len(), 1);
        let detail = unwrap_detail(&messages[0].body).unwrap();
        let Decoded::Known(decoded) = DomainEvent::decode(&detail).unwrap() else {
            panic!("expected a known event");
        };
        assert_eq!(decoded.user_id(), "u1");
    }

    #[tokio::test(start_paused = true)]
    async fn undeleted_message_reappears_after_visibility_timeout() {
        let queue = InMemoryCloudQueue::new("q").with_visibility_timeout(Duration::from_secs(10));
        queue.send_event("customer.service", &event());

        let first = queue.receive(5, Duration::ZERO).await.unwrap();
        assert_eq!(first[0].receive_count, 1);
        assert!(queue.receive(5, Duration::ZERO).await.unwrap().is_empty());

        let second = queue.receive(5, Duration::from_secs(20)).await.unwrap();
        assert_eq!(second[0].receive_count, 2);

        assert!(queue.delete(&first[0].receipt_handle).await.is_err());
        queue.delete(&second[0].receipt_handle).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_wakes_on_arrival() {
        let queue = InMemoryCloudQueue::new("q");
        let sender = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            sender.send("{}");
        });

        let messages = queue.receive(5, Duration::from_secs(20)).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn injected_receive_failures_are_consumed() {
        let queue = InMemoryCloudQueue::new("q");
        queue.fail_next_receives(1);
        assert!(queue.receive(1, Duration::ZERO).await.is_err());
        assert!(queue.receive(1, Duration::ZERO).await.unwrap().is_empty());
    }
}
