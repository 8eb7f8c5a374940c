//! EventBridge cloud bus.

use aws_config::SdkConfig;
use aws_sdk_eventbridge::error::DisplayErrorContext;
use aws_sdk_eventbridge::operation::put_events::PutEventsOutput;
use aws_sdk_eventbridge::types::PutEventsRequestEntry;
use futures::future::BoxFuture;
use shopwire_core::envelope::CloudEnvelope;
use shopwire_core::transport::{CloudBus, TransportError};

/// Publishes envelopes with `PutEvents`, one entry per call.
#[derive(Debug, Clone)]
pub struct EventBridgeBus {
    client: aws_sdk_eventbridge::Client,
}

impl EventBridgeBus {
    /// Create a bus client from shared SDK configuration.
    #[must_use]
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_eventbridge::Client::new(config),
        }
    }
}

impl CloudBus for EventBridgeBus {
    fn put_event(&self, envelope: &CloudEnvelope) -> BoxFuture<'_, Result<(), TransportError>> {
        let entry = request_entry(envelope);
        let bus = envelope.event_bus_name.clone();

        Box::pin(async move {
            let output = self
                .client
                .put_events()
                .entries(entry)
                .send()
                .await
                .map_err(|e| TransportError::PublishFailed {
                    destination: bus.clone(),
                    reason: DisplayErrorContext(e).to_string(),
                })?;

            // PutEvents succeeds as a call even when the entry itself was rejected
            if let Some(reason) = rejected_entry(&output) {
                return Err(TransportError::PublishFailed {
                    destination: bus,
                    reason,
                });
            }

            tracing::debug!(
                bus = %bus,
                event_id = output.entries().first().and_then(|e| e.event_id()).unwrap_or_default(),
                "Put event on EventBridge"
            );
            Ok(())
        })
    }
}

fn request_entry(envelope: &CloudEnvelope) -> PutEventsRequestEntry {
    PutEventsRequestEntry::builder()
        .source(&envelope.source)
        .detail_type(&envelope.detail_type)
        .detail(&envelope.detail)
        .event_bus_name(&envelope.event_bus_name)
        .build()
}

fn rejected_entry(output: &PutEventsOutput) -> Option<String> {
    if output.failed_entry_count() == 0 {
        return None;
    }
    let entry = output.entries().iter().find(|e| e.error_code().is_some());
    Some(format!(
        "{}: {}",
        entry.and_then(|e| e.error_code()).unwrap_or("UnknownError"),
        entry.and_then(|e| e.error_message()).unwrap_or("entry rejected")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_eventbridge::types::PutEventsResultEntry;

    #[test]
    fn entry_carries_envelope_fields() {
        let envelope = CloudEnvelope::new("catalog.service", "ProductCreated", r#"{"event":"ProductCreated"}"#, "shop-bus");
        let entry = request_entry(&envelope);

        assert_eq!(entry.source(), Some("catalog.service"));
        assert_eq!(entry.detail_type(), Some("ProductCreated"));
        assert_eq!(entry.detail(), Some(r#"{"event":"ProductCreated"}"#));
        assert_eq!(entry.event_bus_name(), Some("shop-bus"));
    }

    #[test]
    fn accepted_entries_are_not_failures() {
        let output = PutEventsOutput::builder()
            .failed_entry_count(0)
            .entries(PutEventsResultEntry::builder().event_id("e-1").build())
            .build();
        assert_eq!(rejected_entry(&output), None);
    }

    #[test]
    fn rejected_entry_reports_its_error() {
        let output = PutEventsOutput::builder()
            .failed_entry_count(1)
            .entries(
                PutEventsResultEntry::builder()
                    .error_code("ThrottlingException")
                    .error_message("Rate exceeded")
                    .build(),
            )
            .build();
        assert_eq!(rejected_entry(&output).as_deref(), Some("ThrottlingException: Rate exceeded"));
    }
}
