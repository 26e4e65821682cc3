//! Operation status lookups for clients.

use crate::error::StoreError;
use crate::model::Operation;
use crate::store::OperationStore;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Read side of the operation lifecycle. Records are returned verbatim,
/// including the failure message of a Failed operation.
#[derive(Clone)]
pub struct OperationStatusService {
    operations: Arc<dyn OperationStore>,
}

impl OperationStatusService {
    pub fn new(operations: Arc<dyn OperationStore>) -> Self {
        Self { operations }
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: Uuid, song_id: &str) -> Result<Operation, StoreError> {
        self.operations.get(id, song_id).await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.operations.delete(id).await
    }
}
