//! Outbound messages: annotated-event relay and dead letters.
//!
//! Message construction is plain data and always compiled; the rdkafka
//! producer that sends it is behind the `kafka` feature.

use crate::event::AnnotatedEvent;
use chrono::Utc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Result of a successful message delivery
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
}

/// Message to be sent to the transport
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    /// Partitioning key
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    pub fn new_json<T: serde::Serialize>(topic: impl Into<String>, message: &T) -> Result<Self, ProducerError> {
        Ok(Self {
            topic: topic.into(),
            key: None,
            payload: serde_json::to_vec(message)?,
            headers: Vec::new(),
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_correlation_id(self, id: impl Into<String>) -> Self {
        self.with_header("correlation-id", id)
    }

    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header("message-type", msg_type)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// An annotated event keyed by shipment so one shipment stays on one
/// partition. Keyless shipments fall back to the tracker, then the event id.
pub fn annotated_message(topic: &str, event: &AnnotatedEvent) -> Result<OutgoingMessage, ProducerError> {
    let key = event
        .shpt_no
        .as_deref()
        .or(event.tracker_id.as_deref())
        .unwrap_or(&event.id);
    Ok(OutgoingMessage::new_json(topic, event)?
        .with_key(key)
        .with_message_type("annotated_event")
        .with_correlation_id(&event.id)
        .with_header("event-type", event.event_type.as_str()))
}

/// Dead-letter envelope. The original payload is kept as (lossy) UTF-8
/// since raw events are JSON.
pub fn dead_letter_message(
    topic: &str,
    original_topic: &str,
    original_message: &[u8],
    error: &str,
) -> Result<OutgoingMessage, ProducerError> {
    let record = serde_json::json!({
        "original_topic": original_topic,
        "original_message": String::from_utf8_lossy(original_message),
        "error": error,
        "timestamp": Utc::now().to_rfc3339(),
    });

    Ok(OutgoingMessage::new_json(topic, &record)?
        .with_key(Uuid::new_v4().to_string())
        .with_message_type("dead_letter")
        .with_header("original-topic", original_topic)
        .with_header("error-reason", error))
}

#[cfg(feature = "kafka")]
pub use self::kafka::{relay_annotated, EventProducer};

#[cfg(feature = "kafka")]
mod kafka {
    use super::{annotated_message, dead_letter_message, DeliveryResult, OutgoingMessage, ProducerError};
    use crate::config::KafkaConfig;
    use crate::event::AnnotatedEvent;
    use crate::pipeline::IngestNotice;
    use rdkafka::message::{Header, OwnedHeaders};
    use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
    use rdkafka::util::Timeout;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tracing::{debug, info, instrument, warn};

    pub struct EventProducer {
        producer: FutureProducer,
        config: Arc<KafkaConfig>,
        default_timeout: Duration,
    }

    impl EventProducer {
        pub fn new(config: KafkaConfig) -> Result<Self, ProducerError> {
            info!(servers = %config.bootstrap_servers, "Creating Kafka producer");

            let producer: FutureProducer = config
                .build_producer_config()
                .create()
                .map_err(|e| ProducerError::CreationError(e.to_string()))?;

            Ok(Self {
                producer,
                default_timeout: config.request_timeout(),
                config: Arc::new(config),
            })
        }

        #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
        pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
            let mut headers = OwnedHeaders::new_with_capacity(message.headers.len());
            for (key, value) in &message.headers {
                headers = headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_bytes()),
                });
            }

            let mut record = FutureRecord::to(&message.topic)
                .payload(&message.payload)
                .headers(headers);
            if let Some(ref k) = message.key {
                record = record.key(k);
            }

            let (partition, offset) = self
                .producer
                .send(record, Timeout::After(self.default_timeout))
                .await
                .map_err(|(e, _)| ProducerError::SendError {
                    topic: message.topic.clone(),
                    message: e.to_string(),
                })?;

            debug!(partition, offset, "Message delivered");
            Ok(DeliveryResult {
                topic: message.topic,
                partition,
                offset,
                key: message.key,
            })
        }

        #[instrument(skip(self, messages), fields(count = messages.len()))]
        pub async fn send_batch(&self, messages: Vec<OutgoingMessage>) -> Vec<Result<DeliveryResult, ProducerError>> {
            futures::future::join_all(messages.into_iter().map(|m| self.send(m))).await
        }

        pub async fn publish_annotated(&self, events: &[AnnotatedEvent]) -> Result<usize, ProducerError> {
            let topic = &self.config.topics.annotated_events;
            let messages = events
                .iter()
                .map(|e| annotated_message(topic, e))
                .collect::<Result<Vec<_>, _>>()?;

            let mut delivered = 0;
            for result in self.send_batch(messages).await {
                match result {
                    Ok(_) => delivered += 1,
                    Err(e) => warn!(error = %e, "Failed to publish annotated event"),
                }
            }
            Ok(delivered)
        }

        pub async fn send_to_dlq(
            &self,
            original_topic: &str,
            original_message: &[u8],
            error: &str,
        ) -> Result<DeliveryResult, ProducerError> {
            let message = dead_letter_message(
                &self.config.topics.dead_letter_queue,
                original_topic,
                original_message,
                error,
            )?;
            self.send(message).await
        }

        pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
            self.producer
                .flush(Timeout::After(timeout))
                .map_err(|_| ProducerError::Timeout(timeout))
        }
    }

    impl Drop for EventProducer {
        fn drop(&mut self) {
            info!("Shutting down Kafka producer");
            if let Err(e) = self.flush(Duration::from_secs(5)) {
                warn!(error = %e, "Failed to flush producer on shutdown");
            }
        }
    }

    /// Publish every ingest notice until the pipeline's sender is dropped
    pub async fn relay_annotated(producer: Arc<EventProducer>, mut notices: broadcast::Receiver<IngestNotice>) {
        loop {
            match notices.recv().await {
                Ok(notice) => {
                    if let Err(e) = producer.publish_annotated(&notice.events).await {
                        warn!(error = %e, "Failed to relay annotated events");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Annotated-event relay lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
