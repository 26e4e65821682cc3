//! Drives job messages through the operation lifecycle.
//!
//! ```text
//!   Pending ──▶ Processing ──▶ Completed
//!      │             │
//!      └─────────────┴──────▶ Failed ──(attempts < max)──▶ re-admitted
//! ```
//!
//! Delivery is at-least-once, so every step is idempotent per `song_id`:
//! an existing Completed operation or stored blob short-circuits the work.

use crate::acquisition::AudioAcquirer;
use crate::blob::BlobStore;
use crate::error::{ProcessError, StoreError};
use crate::model::{JobRequest, Metadata, Operation, OperationStatus};
use crate::store::{MetadataStore, OperationStore};
use backoff::{backoff::Backoff, ExponentialBackoff};
use encore_queue::{Message, MessageQueue, QueueError};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const MAX_RECEIVE_BACKOFF: Duration = Duration::from_secs(30);

/// Tries at sending a requeue copy or an acknowledgement before the message
/// is parked for the run loop.
const SETTLE_ATTEMPTS: u32 = 4;
const MAX_SETTLE_BACKOFF: Duration = Duration::from_secs(5);

/// Retry ceiling and concurrency for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_attempts: u32,
    pub worker_count: usize,
    pub poll_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            worker_count: 4,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// What happened to one queue message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Content was not a job request; dropped.
    Rejected,
    AlreadyCompleted,
    /// The song's operation already failed `max_attempts` times.
    Exhausted,
    Completed { cached: bool },
    Failed { retry: bool },
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Rejected => "rejected",
            Outcome::AlreadyCompleted => "already_completed",
            Outcome::Exhausted => "exhausted",
            Outcome::Completed { cached: true } => "completed_cached",
            Outcome::Completed { cached: false } => "completed",
            Outcome::Failed { retry: true } => "requeued",
            Outcome::Failed { retry: false } => "failed",
        }
    }
}

/// A message whose requeue or acknowledgement has not gone through yet.
#[derive(Debug, Clone)]
struct Unsettled {
    message: Message,
    outcome: Outcome,
    /// The requeue copy is already on the queue, or none is needed.
    requeued: bool,
}

/// One async lock per key, dropped from the registry once nobody holds or
/// waits on it.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

struct KeyGuard<'a> {
    registry: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let lock = self.locks.lock().entry(key.to_string()).or_default().clone();
        let guard = lock.lock_owned().await;

        KeyGuard {
            registry: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();

        let mut locks = self.registry.locks.lock();
        if let Some(lock) = locks.get(&self.key) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&self.key);
            }
        }
    }
}

/// Consumes job messages and keeps operation records in step with the work.
pub struct Orchestrator {
    queue: Arc<dyn MessageQueue>,
    operations: Arc<dyn OperationStore>,
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    acquirer: Arc<dyn AudioAcquirer>,
    settings: OrchestratorSettings,
    locks: KeyLocks,
    unsettled: Mutex<Vec<Unsettled>>,
}

impl Orchestrator {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        operations: Arc<dyn OperationStore>,
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        acquirer: Arc<dyn AudioAcquirer>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            queue,
            operations,
            metadata,
            blobs,
            acquirer,
            settings,
            locks: KeyLocks::default(),
            unsettled: Mutex::new(Vec::new()),
        }
    }

    /// Poll the queue until `cancel` fires. The batch in progress is finished
    /// before returning.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            max_attempts = self.settings.max_attempts,
            worker_count = self.settings.worker_count,
            "Orchestrator started"
        );

        let mut receive_backoff = ExponentialBackoff {
            initial_interval: self.settings.poll_interval,
            max_interval: MAX_RECEIVE_BACKOFF,
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            self.resettle().await;

            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                batch = self.queue.receive() => batch,
            };

            let delay = match batch {
                Ok(batch) if batch.is_empty() => {
                    receive_backoff.reset();
                    self.settings.poll_interval
                }
                Ok(batch) => {
                    receive_backoff.reset();
                    debug!(batch_size = batch.len(), "Processing batch");
                    stream::iter(batch)
                        .for_each_concurrent(self.settings.worker_count.max(1), |message| async move {
                            if let Err(e) = self.handle_message(&message).await {
                                error!(message_id = %message.id, error = %e, "Failed to settle message");
                                metrics::counter!("processor.messages.unsettled").increment(1);
                            }
                        })
                        .await;
                    continue;
                }
                Err(QueueError::Closed) => {
                    info!("Queue closed, stopping orchestrator");
                    break;
                }
                Err(e) => {
                    let delay = receive_backoff.next_backoff().unwrap_or(MAX_RECEIVE_BACKOFF);
                    error!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to receive from queue, backing off"
                    );
                    delay
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Orchestrator stopped");
    }

    /// Process one message and settle it on the queue.
    ///
    /// An `Err` means the requeue or acknowledgement still failed after
    /// retrying. Retryable failures are kept and settled again by
    /// [`Orchestrator::resettle`].
    #[instrument(skip(self, message), fields(message_id = %message.id))]
    pub async fn handle_message(&self, message: &Message) -> Result<Outcome, ProcessError> {
        metrics::counter!("processor.messages.received").increment(1);

        let request = match message.decode_json::<JobRequest>() {
            Ok(request) if !request.song_id.trim().is_empty() => request,
            Ok(_) => {
                warn!("Rejecting job without song_id");
                return self.settle(message, Outcome::Rejected).await;
            }
            Err(e) => {
                let e = ProcessError::Decode(e.to_string());
                warn!(error = %e, "Rejecting undecodable job message");
                return self.settle(message, Outcome::Rejected).await;
            }
        };

        let outcome = {
            let _guard = self.locks.lock(&request.song_id).await;
            self.run_job(&request).await
        };

        info!(song_id = %request.song_id, outcome = outcome.label(), "Job message handled");
        self.settle(message, outcome).await
    }

    async fn settle(&self, message: &Message, outcome: Outcome) -> Result<Outcome, ProcessError> {
        let mut pending = Unsettled {
            message: message.clone(),
            outcome,
            requeued: outcome != (Outcome::Failed { retry: true }),
        };

        match self.settle_with_backoff(&mut pending).await {
            Ok(()) => Ok(outcome),
            Err(e) => {
                if e.is_retryable() {
                    warn!(message_id = %message.id, error = %e, "Keeping message to settle later");
                    self.unsettled.lock().push(pending);
                }
                Err(e.into())
            }
        }
    }

    async fn settle_with_backoff(&self, pending: &mut Unsettled) -> Result<(), QueueError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.settings.poll_interval,
            max_interval: MAX_SETTLE_BACKOFF,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut tries = 1;
        loop {
            match self.settle_once(pending).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && tries < SETTLE_ATTEMPTS => {
                    let delay = backoff.next_backoff().unwrap_or(MAX_SETTLE_BACKOFF);
                    warn!(
                        message_id = %pending.message.id,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Settling message failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    tries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Requeue a copy when the outcome calls for one, then acknowledge.
    /// Progress is recorded in `pending` so a later try never sends a second copy.
    async fn settle_once(&self, pending: &mut Unsettled) -> Result<(), QueueError> {
        if !pending.requeued {
            self.queue.send(&pending.message).await?;
            pending.requeued = true;
            metrics::counter!("processor.messages.requeued").increment(1);
        }
        self.queue.acknowledge(&pending.message.id).await?;

        metrics::counter!("processor.messages.settled", "outcome" => pending.outcome.label())
            .increment(1);
        Ok(())
    }

    /// Try once more to settle every message kept by an earlier failure.
    /// Returns how many are still waiting.
    pub async fn resettle(&self) -> usize {
        let parked = std::mem::take(&mut *self.unsettled.lock());
        if parked.is_empty() {
            return 0;
        }

        let mut still_waiting = Vec::new();
        for mut pending in parked {
            match self.settle_once(&mut pending).await {
                Ok(()) => info!(message_id = %pending.message.id, "Settled kept message"),
                Err(e) if e.is_retryable() => still_waiting.push(pending),
                Err(e) => {
                    error!(message_id = %pending.message.id, error = %e, "Dropping unsettleable message");
                }
            }
        }

        let mut unsettled = self.unsettled.lock();
        unsettled.extend(still_waiting);
        unsettled.len()
    }

    /// Drive one request through the lifecycle. The caller holds the song lock.
    async fn run_job(&self, request: &JobRequest) -> Outcome {
        let max_attempts = self.settings.max_attempts;

        let existing = match self.operations.find_by_song(&request.song_id).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(song_id = %request.song_id, error = %e, "Operation lookup failed");
                return Outcome::Failed {
                    retry: e.is_retryable(),
                };
            }
        };

        let mut operation = match existing {
            Some(op) if op.status == OperationStatus::Completed => {
                debug!(operation_id = %op.id, "Song already completed");
                return Outcome::AlreadyCompleted;
            }
            Some(mut op) if op.attempts >= max_attempts => {
                if op.status != OperationStatus::Failed {
                    op.fail("attempts exhausted");
                    if let Err(e) = self.operations.save(&op).await {
                        warn!(operation_id = %op.id, error = %e, "Failed to record exhaustion");
                    }
                }
                metrics::counter!("processor.operations.exhausted").increment(1);
                return Outcome::Exhausted;
            }
            Some(mut op) => {
                if op.status == OperationStatus::Failed {
                    op.reset_to_pending();
                }
                info!(operation_id = %op.id, attempts = op.attempts, "Re-admitting operation");
                op
            }
            None => {
                let id = request.operation_id.unwrap_or_else(Uuid::new_v4);
                let op = Operation::pending(id, &request.song_id);
                if let Err(e) = self.operations.save(&op).await {
                    warn!(operation_id = %id, error = %e, "Failed to create operation");
                    return Outcome::Failed {
                        retry: e.is_retryable(),
                    };
                }
                metrics::counter!("processor.operations.created").increment(1);
                op
            }
        };

        let metadata = request.to_metadata();
        if let Err(e) = metadata.validate() {
            warn!(operation_id = %operation.id, error = %e, "Job request is invalid");
            self.record_failure(&mut operation, &e.to_string()).await;
            return Outcome::Failed { retry: false };
        }

        let attempts_before = operation.attempts;
        match self.attempt(request, &mut operation, metadata).await {
            Ok(cached) => {
                metrics::counter!("processor.operations.completed", "cached" => cached.to_string())
                    .increment(1);
                info!(
                    operation_id = %operation.id,
                    attempts = operation.attempts,
                    cached,
                    "Operation completed"
                );
                Outcome::Completed { cached }
            }
            Err(e) => {
                if operation.attempts == attempts_before {
                    operation.attempts += 1;
                }
                let retry = e.is_retryable() && operation.attempts < max_attempts;
                warn!(
                    operation_id = %operation.id,
                    attempts = operation.attempts,
                    retry,
                    error = %e,
                    "Operation attempt failed"
                );
                self.record_failure(&mut operation, &e.to_string()).await;
                Outcome::Failed { retry }
            }
        }
    }

    /// Store the audio unless it already exists, then complete the operation.
    /// Returns whether the blob was already stored.
    async fn attempt(
        &self,
        request: &JobRequest,
        operation: &mut Operation,
        metadata: Metadata,
    ) -> Result<bool, ProcessError> {
        let key = request.blob_key();
        let cached = self.blobs.exists(&key).await?;

        if cached {
            metrics::counter!("processor.blob.hits").increment(1);
            debug!(key = %key, "Audio already stored");
        } else {
            operation.start_attempt();
            self.operations.save(operation).await?;

            let audio = self.acquirer.acquire(request).await?;
            self.blobs.upload(&key, audio).await?;
            metrics::counter!("processor.blob.uploads").increment(1);
        }

        let stored = self.persist_metadata(metadata).await?;
        operation.complete(stored);
        self.operations.save(operation).await?;

        Ok(cached)
    }

    /// Save metadata; a concurrent writer that got there first wins.
    async fn persist_metadata(&self, metadata: Metadata) -> Result<Metadata, StoreError> {
        match self.metadata.save(metadata).await {
            Err(StoreError::DuplicateKey(id)) => {
                debug!(metadata_id = %id, "Metadata already stored, reusing it");
                match self.metadata.get(&id).await {
                    Err(StoreError::NotFound(what)) => Err(StoreError::Retryable(format!(
                        "{what} disappeared after a duplicate key"
                    ))),
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn record_failure(&self, operation: &mut Operation, error: &str) {
        operation.fail(error);
        metrics::counter!("processor.operations.failed").increment(1);
        if let Err(e) = self.operations.save(operation).await {
            error!(operation_id = %operation.id, error = %e, "Failed to record operation failure");
        }
    }
}
