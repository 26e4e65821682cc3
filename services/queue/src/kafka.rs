use crate::config::KafkaConfig;
use crate::consumer::JobConsumer;
use crate::producer::JobProducer;
use crate::{Message, MessageQueue, QueueError};
use async_trait::async_trait;

/// Kafka-backed [`MessageQueue`]: one producer and one consumer on the same topic.
pub struct KafkaQueue {
    producer: JobProducer,
    consumer: JobConsumer,
}

impl KafkaQueue {
    pub fn new(config: &KafkaConfig) -> Result<Self, QueueError> {
        config
            .validate()
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Self {
            producer: JobProducer::new(config)?,
            consumer: JobConsumer::new(config)?,
        })
    }
}

#[async_trait]
impl MessageQueue for KafkaQueue {
    async fn send(&self, message: &Message) -> Result<(), QueueError> {
        self.producer.send(message).await
    }

    async fn receive(&self) -> Result<Vec<Message>, QueueError> {
        self.consumer.receive().await
    }

    async fn acknowledge(&self, id: &str) -> Result<(), QueueError> {
        self.consumer.acknowledge(id)
    }
}
