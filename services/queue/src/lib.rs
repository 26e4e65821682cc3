//! Encore Queue - work queue gateway for audio processing jobs
//!
//! Job requests travel as [`Message`] envelopes (`{id, content}`) over an
//! at-least-once queue. The orchestrator only sees the [`MessageQueue`]
//! trait; the backend is picked by configuration:
//!
//! - [`KafkaQueue`]: rdkafka producer + consumer, offsets committed on
//!   acknowledge
//! - [`MemoryQueue`]: in-process FIFO for local runs and tests
//!
//! # Example
//!
//! ```rust,no_run
//! use encore_queue::{KafkaConfig, KafkaQueue, Message, MessageQueue};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let queue = KafkaQueue::new(&KafkaConfig::from_env()?)?;
//!     queue.send(&Message::new(br#"{"song_id":"abc"}"#.to_vec())).await?;
//!
//!     for message in queue.receive().await? {
//!         queue.acknowledge(&message.id).await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod gateway;
pub mod kafka;
pub mod memory;
pub mod message;
pub mod producer;

pub use config::{ConfigError, Credentials, KafkaConfig, SecurityProtocol};
pub use consumer::JobConsumer;
pub use gateway::{MessageQueue, QueueError};
pub use kafka::KafkaQueue;
pub use memory::MemoryQueue;
pub use message::Message;
pub use producer::JobProducer;

/// Async trait for queue backends (re-export for convenience)
pub use async_trait::async_trait;
