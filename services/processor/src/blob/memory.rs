use super::BlobStore;
use crate::error::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Blob store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.objects.write().insert(key.into(), data.into());
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.objects.read().contains_key(key))
    }

    async fn upload(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        self.objects.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Bytes, StoreError> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("blob {key}")))
    }
}
