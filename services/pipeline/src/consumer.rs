//! Raw-event consumption.
//!
//! The handler side ([`MessageHandler`], [`IngestHandler`]) is transport
//! agnostic and always compiled. The Kafka stream consumer is behind the
//! `kafka` feature.

use crate::pipeline::Pipeline;
use crate::wire::{decode_payload, WireError};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to decode message: {0}")]
    Decode(#[from] WireError),

}

/// Metadata about a received message
#[derive(Debug, Clone, Default)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    /// Broker timestamp in epoch millis
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            metadata: MessageMetadata {
                topic: topic.into(),
                ..Default::default()
            },
        }
    }

    pub fn key_str(&self) -> Option<String> {
        self.metadata
            .key
            .as_ref()
            .and_then(|k| String::from_utf8(k.clone()).ok())
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header("correlation-id")
    }
}

/// Handler trait for processing messages
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError>;

    /// Called when message processing fails
    async fn on_error(&self, message: &IncomingMessage, error: &ConsumerError) {
        warn!(
            topic = %message.metadata.topic,
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            correlation_id = ?message.correlation_id(),
            error = %error,
            "Message processing failed"
        );
    }
}

/// Decodes each payload into raw events and ingests them as one batch
pub struct IngestHandler {
    pipeline: Arc<Pipeline>,
}

impl IngestHandler {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait::async_trait]
impl MessageHandler for IngestHandler {
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        let raws = decode_payload(&message.payload)?;
        if raws.is_empty() {
            return Ok(());
        }
        let outcome = self.pipeline.ingest(raws);
        debug!(
            offset = message.metadata.offset,
            key = ?message.key_str(),
            correlation_id = ?message.correlation_id(),
            admitted = outcome.admitted.len(),
            "Handled raw event message"
        );
        Ok(())
    }
}

#[cfg(feature = "kafka")]
pub use self::kafka::{ConsumerBuilder, EventConsumer};

#[cfg(feature = "kafka")]
mod kafka {
    use super::{ConsumerError, IncomingMessage, MessageHandler, MessageMetadata};
    use crate::config::KafkaConfig;
    use crate::producer::EventProducer;
    use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
    use rdkafka::message::{Headers, Message};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::broadcast;
    use tokio_stream::StreamExt;
    use tracing::{debug, error, info, instrument, warn};

    /// Stream consumer over the raw-events topic
    pub struct EventConsumer {
        consumer: StreamConsumer,
        config: Arc<KafkaConfig>,
        shutdown_tx: broadcast::Sender<()>,
        dlq_producer: Option<Arc<EventProducer>>,
    }

    impl EventConsumer {
        pub fn new(config: KafkaConfig) -> Result<Self, ConsumerError> {
            info!(
                servers = %config.bootstrap_servers,
                group = %config.consumer.group_id,
                "Creating Kafka consumer"
            );

            let consumer: StreamConsumer = config
                .build_consumer_config()
                .create()
                .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

            let (shutdown_tx, _) = broadcast::channel(1);

            Ok(Self {
                consumer,
                config: Arc::new(config),
                shutdown_tx,
                dlq_producer: None,
            })
        }

        pub fn with_dlq_producer(mut self, producer: Arc<EventProducer>) -> Self {
            self.dlq_producer = Some(producer);
            self
        }

        pub fn subscribe_raw_events(&self) -> Result<(), ConsumerError> {
            let topic = self.config.topics.raw_events.as_str();
            info!(topic, "Subscribing");
            self.consumer
                .subscribe(&[topic])
                .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))
        }

        pub fn shutdown(&self) {
            info!("Signaling consumer shutdown");
            let _ = self.shutdown_tx.send(());
        }

        pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
            self.shutdown_tx.clone()
        }

        fn commit(&self, mode: CommitMode) {
            if let Err(e) = self.consumer.commit_consumer_state(mode) {
                warn!(error = %e, "Failed to commit offsets");
            }
        }

        /// Consume until shutdown. Failed messages go to the dead letter
        /// queue when one is configured; offsets advance either way.
        #[instrument(skip(self, handler))]
        pub async fn run<H: MessageHandler>(&self, handler: Arc<H>) -> Result<(), ConsumerError> {
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let stream = self.consumer.stream();
            tokio::pin!(stream);

            info!("Starting message consumption loop");

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Received shutdown signal");
                        break;
                    }
                    next = stream.next() => {
                        match next {
                            Some(Ok(borrowed)) => {
                                let incoming = convert_message(&borrowed);
                                debug!(
                                    partition = incoming.metadata.partition,
                                    offset = incoming.metadata.offset,
                                    "Received message"
                                );

                                if let Err(e) = handler.handle(incoming.clone()).await {
                                    error!(error = %e, "Message processing failed");
                                    handler.on_error(&incoming, &e).await;
                                    if let Some(ref dlq) = self.dlq_producer {
                                        if let Err(dlq_err) = dlq
                                            .send_to_dlq(&incoming.metadata.topic, &incoming.payload, &e.to_string())
                                            .await
                                        {
                                            error!(error = %dlq_err, "Failed to send to DLQ");
                                        }
                                    }
                                }
                                self.commit(CommitMode::Async);
                            }
                            Some(Err(e)) => error!(error = %e, "Kafka error"),
                            None => {
                                debug!("Stream ended");
                                break;
                            }
                        }
                    }
                }
            }

            self.commit(CommitMode::Sync);
            Ok(())
        }
    }

    fn convert_message<M: Message>(msg: &M) -> IncomingMessage {
        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for header in h.iter() {
                if let Some(Ok(v)) = header.value.map(|v| std::str::from_utf8(v)) {
                    headers.insert(header.key.to_string(), v.to_string());
                }
            }
        }

        IncomingMessage {
            payload: msg.payload().unwrap_or(&[]).to_vec(),
            metadata: MessageMetadata {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg.key().map(|k| k.to_vec()),
                timestamp: msg.timestamp().to_millis(),
                headers,
            },
        }
    }

    /// Builder for creating consumers with custom settings
    pub struct ConsumerBuilder {
        config: KafkaConfig,
        dlq_producer: Option<Arc<EventProducer>>,
    }

    impl ConsumerBuilder {
        pub fn new(config: KafkaConfig) -> Self {
            Self {
                config,
                dlq_producer: None,
            }
        }

        pub fn with_dlq_producer(mut self, producer: Arc<EventProducer>) -> Self {
            self.dlq_producer = Some(producer);
            self
        }

        pub fn build(self) -> Result<EventConsumer, ConsumerError> {
            let mut consumer = EventConsumer::new(self.config)?;
            if let Some(dlq) = self.dlq_producer {
                consumer = consumer.with_dlq_producer(dlq);
            }
            Ok(consumer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geofence::GeofenceIndex;
    use crate::pipeline::PipelineSettings;
    use crate::reference::ReferenceData;

    fn pipeline() -> Arc<Pipeline> {
        Arc::new(Pipeline::new(PipelineSettings::default(), GeofenceIndex::default(), ReferenceData::default()).unwrap())
    }

    #[test]
    fn test_incoming_message_headers() {
        let mut message = IncomingMessage::new("mosb.events.raw", b"{}".to_vec());
        message.metadata.key = Some(b"SHPT-1".to_vec());
        message
            .metadata
            .headers
            .insert("correlation-id".to_string(), "abc-123".to_string());

        assert_eq!(message.correlation_id(), Some("abc-123"));
        assert_eq!(message.key_str(), Some("SHPT-1".to_string()));
        assert_eq!(message.header("missing"), None);
    }

    #[tokio::test]
    async fn test_ingest_handler_feeds_pipeline() {
        let p = pipeline();
        let handler = IngestHandler::new(Arc::clone(&p));

        let body = r#"[{"id":"a","position":[54.4,24.3],"shpt_no":"S1"},{"id":"b","position":[54.5,24.3]}]"#;
        handler.handle(IncomingMessage::new("raw", body)).await.unwrap();
        assert_eq!(p.len(), 2);

        handler
            .handle(IncomingMessage::new("raw", r#"{"type":"ping"}"#))
            .await
            .unwrap();
        assert_eq!(p.len(), 2);
    }

    #[tokio::test]
    async fn test_ingest_handler_rejects_garbage() {
        let p = pipeline();
        let handler = IngestHandler::new(Arc::clone(&p));
        let err = handler.handle(IncomingMessage::new("raw", "not json")).await.unwrap_err();
        assert!(matches!(err, ConsumerError::Decode(_)));
        assert!(p.is_empty());
    }
}
