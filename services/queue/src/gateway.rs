//! The queue contract the orchestrator depends on.

use crate::Message;
use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by queue backends
#[derive(Error, Debug)]
pub enum QueueError {
    /// Broker unreachable, timed out, or otherwise transient
    #[error("Queue connection error: {0}")]
    Connection(String),

    #[error("Failed to encode or decode message: {0}")]
    Serialization(String),

    #[error("No in-flight message with id {0}")]
    UnknownMessage(String),

    #[error("Queue is closed")]
    Closed,
}

impl QueueError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Connection(_))
    }
}

/// At-least-once work queue.
///
/// A received message stays in flight until it is acknowledged. Consumers
/// must tolerate redelivery of anything they did not acknowledge.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a message.
    async fn send(&self, message: &Message) -> Result<(), QueueError>;

    /// Take the next batch of messages. An empty batch means nothing was
    /// available within the backend's receive window.
    async fn receive(&self) -> Result<Vec<Message>, QueueError>;

    /// Mark a received message as done so it is not delivered again.
    async fn acknowledge(&self, id: &str) -> Result<(), QueueError>;
}
