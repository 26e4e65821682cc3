//! In-process stores for local runs and tests.

use super::{prepare_metadata, require_id, MetadataStore, OperationStore};
use crate::error::StoreError;
use crate::model::{Metadata, Operation};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct MemoryOperationStore {
    operations: RwLock<HashMap<Uuid, Operation>>,
}

impl MemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.operations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OperationStore for MemoryOperationStore {
    async fn save(&self, operation: &Operation) -> Result<(), StoreError> {
        self.operations
            .write()
            .insert(operation.id, operation.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid, song_id: &str) -> Result<Operation, StoreError> {
        self.operations
            .read()
            .get(&id)
            .filter(|op| op.song_id == song_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("operation {id} for song {song_id}")))
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.operations
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("operation {id}")))
    }

    async fn find_by_song(&self, song_id: &str) -> Result<Option<Operation>, StoreError> {
        Ok(self
            .operations
            .read()
            .values()
            .filter(|op| op.song_id == song_id)
            .max_by_key(|op| op.updated_at)
            .cloned())
    }
}

#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: RwLock<HashMap<String, Metadata>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn save(&self, metadata: Metadata) -> Result<Metadata, StoreError> {
        let metadata = prepare_metadata(metadata)?;

        let mut records = self.records.write();
        if records.contains_key(&metadata.id) {
            return Err(StoreError::DuplicateKey(metadata.id));
        }
        records.insert(metadata.id.clone(), metadata.clone());
        Ok(metadata)
    }

    async fn get(&self, id: &str) -> Result<Metadata, StoreError> {
        require_id(id)?;
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("metadata {id}")))
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        require_id(id)?;
        self.records
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("metadata {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobRequest, OperationStatus};

    fn metadata() -> Metadata {
        JobRequest {
            song_id: "abc".to_string(),
            operation_id: None,
            title: "Song".to_string(),
            url: "https://youtube.com/watch?v=abc".to_string(),
            platform: "youtube".to_string(),
            thumbnail: None,
            duration_secs: Some(212),
        }
        .to_metadata()
    }

    #[tokio::test]
    async fn test_operation_crud() {
        let store = MemoryOperationStore::new();
        let mut op = Operation::pending(Uuid::new_v4(), "abc");
        store.save(&op).await.unwrap();

        op.start_attempt();
        store.save(&op).await.unwrap();
        assert_eq!(store.len(), 1);

        let loaded = store.get(op.id, "abc").await.unwrap();
        assert_eq!(loaded.status, OperationStatus::Processing);
        assert!(matches!(
            store.get(op.id, "other").await,
            Err(StoreError::NotFound(_))
        ));

        store.delete(op.id).await.unwrap();
        assert!(matches!(store.delete(op.id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_find_by_song_returns_latest() {
        let store = MemoryOperationStore::new();
        let older = Operation::pending(Uuid::new_v4(), "abc");
        let mut newer = Operation::pending(Uuid::new_v4(), "abc");
        newer.updated_at = older.updated_at + chrono::Duration::seconds(5);

        store.save(&older).await.unwrap();
        store.save(&newer).await.unwrap();
        store
            .save(&Operation::pending(Uuid::new_v4(), "xyz"))
            .await
            .unwrap();

        let found = store.find_by_song("abc").await.unwrap().unwrap();
        assert_eq!(found.id, newer.id);
        assert!(store.find_by_song("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_metadata_duplicate_and_validation() {
        let store = MemoryMetadataStore::new();
        let saved = store.save(metadata()).await.unwrap();
        assert_eq!(store.get(&saved.id).await.unwrap(), saved);

        assert!(matches!(
            store.save(metadata()).await,
            Err(StoreError::DuplicateKey(_))
        ));

        let mut invalid = metadata();
        invalid.id.clear();
        invalid.title.clear();
        assert!(matches!(
            store.save(invalid).await,
            Err(StoreError::Validation(_))
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_metadata_generates_missing_id() {
        let store = MemoryMetadataStore::new();
        let mut record = metadata();
        record.id.clear();

        let saved = store.save(record).await.unwrap();
        assert!(Uuid::parse_str(&saved.id).is_ok());

        store.delete(&saved.id).await.unwrap();
        assert!(matches!(store.get(&saved.id).await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.get("").await, Err(StoreError::Validation(_))));
    }
}
