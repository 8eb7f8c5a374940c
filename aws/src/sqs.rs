//! SQS cloud queue.

use aws_config::SdkConfig;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{Message, MessageSystemAttributeName};
use futures::future::BoxFuture;
use shopwire_core::transport::{CloudQueue, QueueMessage, TransportError};
use std::time::Duration;

/// Largest batch a single `ReceiveMessage` call returns.
const MAX_BATCH: usize = 10;

/// Longest long-poll wait SQS accepts.
const MAX_WAIT: Duration = Duration::from_secs(20);

/// Long-polls one SQS queue.
#[derive(Debug, Clone)]
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsQueue {
    /// Create a queue client from shared SDK configuration.
    #[must_use]
    pub fn new(config: &SdkConfig, queue_url: impl Into<String>) -> Self {
        Self {
            client: aws_sdk_sqs::Client::new(config),
            queue_url: queue_url.into(),
        }
    }
}

impl CloudQueue for SqsQueue {
    fn queue_url(&self) -> &str {
        &self.queue_url
    }

    fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> BoxFuture<'_, Result<Vec<QueueMessage>, TransportError>> {
        let (max_messages, wait_secs) = receive_limits(max_messages, wait);

        Box::pin(async move {
            let output = self
                .client
                .receive_message()
                .queue_url(&self.queue_url)
                .max_number_of_messages(max_messages)
                .wait_time_seconds(wait_secs)
                .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
                .send()
                .await
                .map_err(|e| TransportError::ReceiveFailed(DisplayErrorContext(e).to_string()))?;

            let messages: Vec<QueueMessage> = output.messages().iter().filter_map(queue_message).collect();
            if !messages.is_empty() {
                tracing::debug!(queue_url = %self.queue_url, count = messages.len(), "Received messages");
            }
            Ok(messages)
        })
    }

    fn delete(&self, receipt_handle: &str) -> BoxFuture<'_, Result<(), TransportError>> {
        let receipt_handle = receipt_handle.to_string();

        Box::pin(async move {
            self.client
                .delete_message()
                .queue_url(&self.queue_url)
                .receipt_handle(receipt_handle)
                .send()
                .await
                .map_err(|e| TransportError::DeleteFailed(DisplayErrorContext(e).to_string()))?;
            Ok(())
        })
    }
}

/// Clamp a batch request to what `ReceiveMessage` accepts.
fn receive_limits(max_messages: usize, wait: Duration) -> (i32, i32) {
    let batch = max_messages.clamp(1, MAX_BATCH);
    let wait = wait.min(MAX_WAIT).as_secs();
    (
        i32::try_from(batch).unwrap_or(1),
        i32::try_from(wait).unwrap_or(0),
    )
}

/// A message without a receipt handle cannot be deleted, so it is left to expire.
fn queue_message(message: &Message) -> Option<QueueMessage> {
    let Some(receipt_handle) = message.receipt_handle() else {
        tracing::warn!(message_id = ?message.message_id(), "Received message without receipt handle");
        return None;
    };
    let receive_count = message
        .attributes()
        .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
        .and_then(|count| count.parse().ok())
        .unwrap_or(1);

    Some(QueueMessage {
        message_id: message.message_id().unwrap_or_default().to_string(),
        receipt_handle: receipt_handle.to_string(),
        body: message.body().unwrap_or_default().to_string(),
        receive_count,
    })
}
