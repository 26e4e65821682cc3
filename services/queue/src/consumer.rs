//! Kafka consumer side of the job queue.
//!
//! Messages are handed out in batches and committed only once acknowledged.
//! Because a Kafka commit covers every earlier offset in the partition, the
//! committed position never moves past the lowest offset still in flight.

use crate::config::KafkaConfig;
use crate::{Message, QueueError};
use parking_lot::Mutex;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as KafkaMessage;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Where a received message lives in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Position {
    topic: String,
    partition: i32,
    offset: i64,
}

/// In-flight bookkeeping for one partition.
#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    highest_acked: Option<i64>,
}

impl PartitionOffsets {
    /// Offset safe to commit: everything before it has been acknowledged.
    fn commit_position(&self) -> Option<i64> {
        match self.in_flight.iter().next() {
            Some(&lowest) => Some(lowest),
            None => self.highest_acked.map(|offset| offset + 1),
        }
    }
}

#[derive(Debug, Default)]
struct OffsetTracker {
    by_id: HashMap<String, VecDeque<Position>>,
    partitions: HashMap<(String, i32), PartitionOffsets>,
}

impl OffsetTracker {
    fn track(&mut self, id: &str, position: Position) {
        self.partitions
            .entry((position.topic.clone(), position.partition))
            .or_default()
            .in_flight
            .insert(position.offset);
        self.by_id.entry(id.to_string()).or_default().push_back(position);
    }

    /// Release the oldest in-flight delivery of `id` and return the
    /// partition position that may now be committed.
    fn release(&mut self, id: &str) -> Option<(Position, Option<i64>)> {
        let positions = self.by_id.get_mut(id)?;
        let position = positions.pop_front()?;
        if positions.is_empty() {
            self.by_id.remove(id);
        }

        let partition = self
            .partitions
            .entry((position.topic.clone(), position.partition))
            .or_default();
        partition.in_flight.remove(&position.offset);
        partition.highest_acked = partition.highest_acked.max(Some(position.offset));
        let commit = partition.commit_position();

        Some((position, commit))
    }
}

/// Batch-oriented consumer over the job topic.
pub struct JobConsumer {
    consumer: StreamConsumer,
    tracker: Mutex<OffsetTracker>,
    batch_size: usize,
    receive_window: Duration,
}

impl JobConsumer {
    pub fn new(config: &KafkaConfig) -> Result<Self, QueueError> {
        info!(
            brokers = %config.brokers,
            group = %config.group_id,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .consumer_config()
            .create()
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        info!(topic = %config.topic, "Subscribed to job topic");

        Ok(Self {
            consumer,
            tracker: Mutex::new(OffsetTracker::default()),
            batch_size: config.batch_size,
            receive_window: config.receive_window(),
        })
    }

    /// Collect up to `batch_size` messages, waiting at most the receive window.
    #[instrument(skip(self))]
    pub async fn receive(&self) -> Result<Vec<Message>, QueueError> {
        let deadline = tokio::time::Instant::now() + self.receive_window;
        let mut batch = Vec::new();

        while batch.len() < self.batch_size {
            let borrowed = match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Ok(borrowed)) => borrowed,
                Ok(Err(e)) if batch.is_empty() => {
                    return Err(QueueError::Connection(e.to_string()));
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Kafka error mid-batch, returning partial batch");
                    break;
                }
            };

            let position = Position {
                topic: borrowed.topic().to_string(),
                partition: borrowed.partition(),
                offset: borrowed.offset(),
            };
            let payload = borrowed.payload().unwrap_or(&[]);

            // An envelope that does not decode is still handed out so the
            // caller can acknowledge it away instead of replaying it forever.
            let message = Message::from_wire(payload).unwrap_or_else(|e| {
                warn!(
                    error = %e,
                    partition = position.partition,
                    offset = position.offset,
                    "Undecodable envelope"
                );
                Message::with_id(
                    format!("{}:{}:{}", position.topic, position.partition, position.offset),
                    payload.to_vec(),
                )
            });

            self.tracker.lock().track(&message.id, position);
            batch.push(message);
        }

        if !batch.is_empty() {
            debug!(count = batch.len(), "Received batch");
        }
        Ok(batch)
    }

    /// Commit the message's offset (or the lowest still-in-flight offset).
    #[instrument(skip(self))]
    pub fn acknowledge(&self, id: &str) -> Result<(), QueueError> {
        let released = self.tracker.lock().release(id);
        let (position, commit) =
            released.ok_or_else(|| QueueError::UnknownMessage(id.to_string()))?;

        if let Some(offset) = commit {
            let mut list = TopicPartitionList::new();
            list.add_partition_offset(&position.topic, position.partition, Offset::Offset(offset))
                .map_err(|e| QueueError::Connection(e.to_string()))?;
            self.consumer
                .commit(&list, CommitMode::Async)
                .map_err(|e| QueueError::Connection(e.to_string()))?;
            debug!(partition = position.partition, offset, "Committed offset");
        }

        Ok(())
    }
}
