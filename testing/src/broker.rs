//! In-memory broker with direct-exchange routing and manual acks.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap on poisoned locks

use futures::future::BoxFuture;
use shopwire_core::transport::{
    Acknowledger, BrokerChannel, BrokerConnector, Delivery, DeliveryStream, TransportError,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

type Message = (String, Vec<u8>);

struct QueueState {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
    unacked: BTreeMap<u64, Message>,
    acked: Vec<Message>,
}

#[derive(Default)]
struct BrokerState {
    bindings: HashMap<String, BTreeSet<String>>,
    queues: HashMap<String, QueueState>,
    published: Vec<Message>,
    publish_failure: Option<String>,
    next_tag: u64,
}

impl BrokerState {
    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            QueueState {
                tx,
                rx: Some(rx),
                unacked: BTreeMap::new(),
                acked: Vec::new(),
            }
        })
    }
}

/// In-memory broker channel.
///
/// Routes a published payload to every queue bound to its routing key, the way a durable
/// direct exchange does. Deliveries stay unacked until [`Delivery::ack`] is called; binding
/// the same queue again redelivers everything still unacked, which is how a consumer
/// restart looks on a real broker.
///
/// # Example
///
/// ```
/// use futures::StreamExt;
/// use shopwire_core::transport::BrokerChannel;
/// use shopwire_testing::InMemoryBroker;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new("shopping");
/// let mut deliveries = broker.bind("products_service", &["OrderCreated".to_string()]).await?;
///
/// broker.publish("OrderCreated", b"{}").await?;
/// let delivery = deliveries.next().await.unwrap()?;
/// delivery.ack().await?;
///
/// assert_eq!(broker.acked("products_service").len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    exchange: String,
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Create a broker with one exchange.
    #[must_use]
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    /// Make every publish fail with `reason` until [`recover`](Self::recover) is called.
    pub fn fail_publishes(&self, reason: impl Into<String>) {
        self.state.lock().unwrap().publish_failure = Some(reason.into());
    }

    /// Stop injecting publish failures.
    pub fn recover(&self) {
        self.state.lock().unwrap().publish_failure = None;
    }

    /// Every successfully published `(routing_key, payload)`, in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().unwrap().published.clone()
    }

    /// Payloads acknowledged on `queue`, in ack order.
    #[must_use]
    pub fn acked(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.acked.iter().map(|(_, payload)| payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of deliveries on `queue` not yet acknowledged.
    #[must_use]
    pub fn unacked(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Queues bound to `routing_key`.
    #[must_use]
    pub fn bound_queues(&self, routing_key: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .bindings
            .get(routing_key)
            .map(|queues| queues.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn enqueue(&self, state: &mut BrokerState, queue: &str, routing_key: &str, payload: &[u8]) {
        state.next_tag += 1;
        let tag = state.next_tag;
        let acker = MemoryAck {
            state: Arc::clone(&self.state),
            queue: queue.to_string(),
            tag,
        };
        let q = state.queue(queue);
        q.unacked
            .insert(tag, (routing_key.to_string(), payload.to_vec()));
        // A closed receiver means the consumer went away; the message stays unacked
        let _ = q.tx.send(Delivery::new(routing_key, payload.to_vec(), Box::new(acker)));
    }
}

impl BrokerChannel for InMemoryBroker {
    fn exchange(&self) -> &str {
        &self.exchange
    }

    fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        let routing_key = routing_key.to_string();
        let payload = payload.to_vec();

        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if let Some(reason) = state.publish_failure.clone() {
                return Err(TransportError::ConnectionFailed(reason));
            }

            state.published.push((routing_key.clone(), payload.clone()));
            let queues: Vec<String> = state
                .bindings
                .get(&routing_key)
                .map(|queues| queues.iter().cloned().collect())
                .unwrap_or_default();
            for queue in queues {
                self.enqueue(&mut state, &queue, &routing_key, &payload);
            }
            Ok(())
        })
    }

    fn bind(
        &self,
        queue: &str,
        routing_keys: &[String],
    ) -> BoxFuture<'_, Result<DeliveryStream, TransportError>> {
        let queue = queue.to_string();
        let routing_keys = routing_keys.to_vec();

        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            for key in &routing_keys {
                state
                    .bindings
                    .entry(key.clone())
                    .or_default()
                    .insert(queue.clone());
            }

            let rebinding = state.queue(&queue).rx.is_none();
            let mut rx = if rebinding {
                let (tx, rx) = mpsc::unbounded_channel();
                state.queue(&queue).tx = tx;
                rx
            } else {
                state
                    .queue(&queue)
                    .rx
                    .take()
                    .ok_or_else(|| TransportError::BindFailed {
                        queue: queue.clone(),
                        reason: "receiver missing".to_string(),
                    })?
            };

            if rebinding {
                let pending = std::mem::take(&mut state.queue(&queue).unacked);
                for (routing_key, payload) in pending.into_values() {
                    self.enqueue(&mut state, &queue, &routing_key, &payload);
                }
            }
            drop(state);

            let stream = async_stream::stream! {
                while let Some(delivery) = rx.recv().await {
                    yield Ok(delivery);
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

struct MemoryAck {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    tag: u64,
}

impl Acknowledger for MemoryAck {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            let queue = state.queue(&self.queue);
            match queue.unacked.remove(&self.tag) {
                Some(message) => {
                    queue.acked.push(message);
                    Ok(())
                }
                None => Err(TransportError::AckFailed(format!(
                    "unknown delivery tag {}",
                    self.tag
                ))),
            }
        })
    }
}

/// Connector for an [`InMemoryBroker`] that can simulate an unreachable broker.
///
/// Every call to [`connect`](BrokerConnector::connect) is counted and timestamped with
/// tokio's clock, so tests running with paused time can assert on retry intervals.
pub struct InMemoryConnector {
    broker: InMemoryBroker,
    failures_before_success: usize,
    attempts: AtomicUsize,
    attempt_times: Mutex<Vec<Instant>>,
}

impl InMemoryConnector {
    /// A connector that succeeds on the first attempt.
    #[must_use]
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            failures_before_success: 0,
            attempts: AtomicUsize::new(0),
            attempt_times: Mutex::new(Vec::new()),
        }
    }

    /// Fail the first `failures` attempts, then succeed.
    #[must_use]
    pub const fn failing_first(mut self, failures: usize) -> Self {
        self.failures_before_success = failures;
        self
    }

    /// Never succeed.
    #[must_use]
    pub const fn unreachable(self) -> Self {
        self.failing_first(usize::MAX)
    }

    /// Number of connection attempts made.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// When each attempt was made.
    #[must_use]
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempt_times.lock().unwrap().clone()
    }
}

impl BrokerConnector for InMemoryConnector {
    fn connect(
        &self,
        url: &str,
        _exchange: &str,
    ) -> BoxFuture<'_, Result<Arc<dyn BrokerChannel>, TransportError>> {
        let url = url.to_string();

        Box::pin(async move {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            self.attempt_times.lock().unwrap().push(Instant::now());

            if attempt < self.failures_before_success {
                return Err(TransportError::ConnectionFailed(format!(
                    "connection refused: {url}"
                )));
            }
            Ok(Arc::new(self.broker.clone()) as Arc<dyn BrokerChannel>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn routes_only_to_bound_queues() {
        let broker = InMemoryBroker::new("ex");
        let mut carts = broker.bind("carts", &["ADD_TO_CART".to_string()]).await.unwrap();
        let _orders = broker.bind("orders", &["OrderCreated".to_string()]).await.unwrap();

        broker.publish("ADD_TO_CART", b"cart").await.unwrap();

        let delivery = carts.next().await.unwrap().unwrap();
        assert_eq!(delivery.routing_key(), "ADD_TO_CART");
        assert_eq!(broker.unacked("carts"), 1);
        assert_eq!(broker.unacked("orders"), 0);
    }

    #[tokio::test]
    async fn rebinding_redelivers_unacked_messages() {
        let broker = InMemoryBroker::new("ex");
        let keys = ["OrderCreated".to_string()];
        let mut first = broker.bind("q", &keys).await.unwrap();
        broker.publish("OrderCreated", b"one").await.unwrap();
        let dropped = first.next().await.unwrap().unwrap();
        drop(dropped);
        drop(first);

        let mut second = broker.bind("q", &keys).await.unwrap();
        let redelivered = second.next().await.unwrap().unwrap();
        assert_eq!(redelivered.payload(), b"one");
        redelivered.ack().await.unwrap();
        assert_eq!(broker.acked("q"), vec![b"one".to_vec()]);
    }

    #[tokio::test]
    async fn injected_publish_failure_is_reported() {
        let broker = InMemoryBroker::new("ex");
        broker.fail_publishes("channel closed");
        assert!(broker.publish("OrderCreated", b"{}").await.is_err());
        broker.recover();
        assert!(broker.publish("OrderCreated", b"{}").await.is_ok());
        assert_eq!(broker.published().len(), 1);
    }
}
