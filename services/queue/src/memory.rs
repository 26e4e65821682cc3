//! In-process queue for local runs and tests.

use crate::{Message, MessageQueue, QueueError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Message>,
    in_flight: HashMap<String, VecDeque<Message>>,
    closed: bool,
}

/// FIFO queue with explicit in-flight tracking.
///
/// `receive` moves messages to in-flight; `redeliver_unacknowledged` plays the
/// role of a broker visibility timeout and puts them back.
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<State>,
    batch_size: usize,
}

impl MemoryQueue {
    pub fn new(batch_size: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            batch_size: batch_size.max(1),
        }
    }

    /// Messages waiting to be received.
    pub fn ready_len(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Messages received but not yet acknowledged.
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.values().map(VecDeque::len).sum()
    }

    /// Return every unacknowledged message to the front of the queue.
    pub fn redeliver_unacknowledged(&self) -> usize {
        let mut state = self.state.lock();
        let pending: Vec<Message> = state
            .in_flight
            .drain()
            .flat_map(|(_, messages)| messages)
            .collect();
        let count = pending.len();
        for message in pending.into_iter().rev() {
            state.ready.push_front(message);
        }
        count
    }

    /// Reject further sends and receives.
    pub fn close(&self) {
        self.state.lock().closed = true;
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(10)
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn send(&self, message: &Message) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.ready.push_back(message.clone());
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<Message>, QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }

        let take = self.batch_size.min(state.ready.len());
        let batch: Vec<Message> = state.ready.drain(..take).collect();
        for message in &batch {
            state
                .in_flight
                .entry(message.id.clone())
                .or_default()
                .push_back(message.clone());
        }
        Ok(batch)
    }

    async fn acknowledge(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let deliveries = state
            .in_flight
            .get_mut(id)
            .ok_or_else(|| QueueError::UnknownMessage(id.to_string()))?;
        deliveries.pop_front();
        if deliveries.is_empty() {
            state.in_flight.remove(id);
        }
        Ok(())
    }
}
