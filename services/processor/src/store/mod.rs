//! Persistence for operation records and track metadata.

pub mod memory;
pub mod postgres;

use crate::error::StoreError;
use crate::model::{Metadata, Operation};
use async_trait::async_trait;
use uuid::Uuid;

pub use memory::{MemoryMetadataStore, MemoryOperationStore};
pub use postgres::PostgresStore;

/// Operation records keyed by id, looked up by song.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Insert or fully replace the record with `operation.id`.
    async fn save(&self, operation: &Operation) -> Result<(), StoreError>;

    /// `NotFound` unless a record with this id belongs to `song_id`.
    async fn get(&self, id: Uuid, song_id: &str) -> Result<Operation, StoreError>;

    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    /// Most recently updated operation for the song.
    async fn find_by_song(&self, song_id: &str) -> Result<Option<Operation>, StoreError>;
}

/// Completed-track descriptions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Validate and insert, generating an id when empty. Returns the stored record.
    async fn save(&self, metadata: Metadata) -> Result<Metadata, StoreError>;

    async fn get(&self, id: &str) -> Result<Metadata, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// Checks and id assignment shared by every metadata backend.
pub(crate) fn prepare_metadata(mut metadata: Metadata) -> Result<Metadata, StoreError> {
    metadata.validate()?;
    if metadata.id.is_empty() {
        metadata.id = Uuid::new_v4().to_string();
    }
    Ok(metadata)
}

pub(crate) fn require_id(id: &str) -> Result<(), StoreError> {
    if id.trim().is_empty() {
        return Err(StoreError::Validation("id must not be empty".to_string()));
    }
    Ok(())
}
