use super::BlobStore;
use crate::error::StoreError;
use crate::model::sanitize_path_component;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::PathBuf;
use tracing::{debug, instrument};

/// Blob store on the local filesystem, one file per key under `root`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Each `/`-separated segment is sanitized so keys stay under `root`.
    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            let (stem, ext) = match segment.rsplit_once('.') {
                Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
                _ => (segment, None),
            };
            let mut name = sanitize_path_component(stem);
            if let Some(ext) = ext {
                name.push('.');
                name.push_str(&sanitize_path_component(ext));
            }
            path.push(name);
        }
        path
    }
}

fn io_error(e: io::Error, key: &str) -> StoreError {
    match e.kind() {
        io::ErrorKind::NotFound => StoreError::NotFound(format!("blob {key}")),
        io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput => {
            StoreError::Backend(format!("blob {key}: {e}"))
        }
        _ => StoreError::Retryable(format!("blob {key}: {e}")),
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        tokio::fs::try_exists(self.path_for(key))
            .await
            .map_err(|e| io_error(e, key))
    }

    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn upload(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(e, key))?;
        }

        // Write then rename so readers never observe a partial file.
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| io_error(e, key))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(e, key));
        }

        debug!(path = %path.display(), "Blob written");
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Bytes, StoreError> {
        tokio::fs::read(self.path_for(key))
            .await
            .map(Bytes::from)
            .map_err(|e| io_error(e, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_root() -> PathBuf {
        std::env::temp_dir().join(format!("encore-blobs-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_path_stays_under_root() {
        let store = LocalBlobStore::new("/data");
        assert_eq!(store.path_for("audio/abc.dca"), PathBuf::from("/data/audio/abc.dca"));
        assert_eq!(store.path_for("../../etc/passwd"), PathBuf::from("/data/__/__/etc/passwd"));
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let root = scratch_root();
        let store = LocalBlobStore::new(&root);

        assert!(!store.exists("audio/abc.dca").await.unwrap());
        assert!(matches!(
            store.download("audio/abc.dca").await,
            Err(StoreError::NotFound(_))
        ));

        store
            .upload("audio/abc.dca", Bytes::from_static(b"\x02\x00hi"))
            .await
            .unwrap();
        assert!(store.exists("audio/abc.dca").await.unwrap());
        assert_eq!(
            store.download("audio/abc.dca").await.unwrap(),
            Bytes::from_static(b"\x02\x00hi")
        );

        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
