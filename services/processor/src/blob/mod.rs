//! Content-addressed storage for encoded audio.

pub mod local;
pub mod memory;
pub mod s3;

use crate::error::StoreError;
use async_trait::async_trait;
use bytes::Bytes;

pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;
pub use s3::S3BlobStore;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Store `data` under `key`, replacing any previous object.
    async fn upload(&self, key: &str, data: Bytes) -> Result<(), StoreError>;

    /// `NotFound` when no object exists under `key`.
    async fn download(&self, key: &str) -> Result<Bytes, StoreError>;
}

/// Content type for a blob key.
pub(crate) fn content_type_for(key: &str) -> &'static str {
    match key.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("dca") => "audio/x-dca",
        Some("opus") => "audio/opus",
        Some("ogg") => "audio/ogg",
        Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    }
}
