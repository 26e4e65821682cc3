//! Kafka producer side of the job queue.

use crate::config::KafkaConfig;
use crate::{Message, QueueError};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Publishes job envelopes to the configured topic.
pub struct JobProducer {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl JobProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self, QueueError> {
        info!(
            brokers = %config.brokers,
            topic = %config.topic,
            "Creating Kafka producer"
        );

        let producer: FutureProducer = config
            .producer_config()
            .create()
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            timeout: config.delivery_timeout(),
        })
    }

    /// Send a message and wait for the broker to confirm delivery.
    #[instrument(skip(self, message), fields(topic = %self.topic, message_id = %message.id))]
    pub async fn send(&self, message: &Message) -> Result<(), QueueError> {
        let payload = message.to_wire()?;
        let record = FutureRecord::to(&self.topic)
            .key(&message.id)
            .payload(&payload);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| classify(e))?;

        debug!(partition, offset, "Message delivered");
        Ok(())
    }

    pub fn flush(&self, timeout: Duration) -> Result<(), QueueError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|e| QueueError::Connection(e.to_string()))
    }
}

impl Drop for JobProducer {
    fn drop(&mut self) {
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!(error = %e, "Failed to flush producer on shutdown");
        }
    }
}

fn classify(error: KafkaError) -> QueueError {
    match error {
        KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge) => {
            QueueError::Serialization("message exceeds broker size limit".to_string())
        }
        other => QueueError::Connection(other.to_string()),
    }
}
