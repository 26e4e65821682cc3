use super::{content_type_for, BlobStore};
use crate::config::S3Config;
use crate::error::StoreError;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

/// S3 blob store for encoded audio
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

/// Transport-level failures are worth retrying; everything else is not.
fn classify<E, R>(e: SdkError<E, R>, what: &str, key: &str) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let message = format!("{what} {key}: {}", DisplayErrorContext(&e));
    match e {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::Retryable(message)
        }
        _ => StoreError::Backend(message),
    }
}

impl S3BlobStore {
    /// Client for `config.bucket`, honouring a custom endpoint for MinIO or LocalStack.
    pub async fn new(config: &S3Config) -> Result<Self> {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = S3ConfigBuilder::from(&shared);
        builder.set_endpoint_url(config.endpoint_url.clone());
        let client = S3Client::from_conf(
            builder
                .force_path_style(config.force_path_style)
                .build(),
        );
        info!(bucket = %config.bucket, region = %config.region, "S3 blob store ready");

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    async fn put_whole(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type_for(key))
            .send()
            .await
            .map_err(|e| classify(e, "put", key))?;

        Ok(())
    }

    /// Upload in `part_size_bytes` pieces, aborting the upload if any part fails.
    async fn multipart_upload(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type_for(key))
            .send()
            .await
            .map_err(|e| classify(e, "create multipart upload", key))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| StoreError::Backend(format!("no upload id for {key}")))?
            .to_string();

        match self.upload_parts(key, &upload_id, data).await {
            Ok(parts) => {
                let manifest = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(manifest)
                    .send()
                    .await
                    .map_err(|e| classify(e, "complete multipart upload", key))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key = %key, error = %DisplayErrorContext(&abort), "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        data: Bytes,
    ) -> Result<Vec<CompletedPart>, StoreError> {
        let part_size = self.config.part_size_bytes.max(1);
        let mut parts = Vec::with_capacity(data.len().div_ceil(part_size));

        for (index, start) in (0..data.len()).step_by(part_size).enumerate() {
            // S3 part numbers start at 1
            let part_number = index as i32 + 1;
            let chunk = data.slice(start..(start + part_size).min(data.len()));
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| classify(e, "upload part", key))?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .build(),
            );
        }

        Ok(parts)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(classify(e, "head", key))
                }
            }
        }
    }

    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn upload(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let size_bytes = data.len();
        if size_bytes > 0 && size_bytes >= self.config.multipart_threshold_bytes {
            self.multipart_upload(key, data).await?;
        } else {
            self.put_whole(key, data).await?;
        }

        metrics::counter!("processor.blob.uploaded_bytes").increment(size_bytes as u64);
        info!(key = %key, size_bytes, "Audio uploaded to S3");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn download(&self, key: &str) -> Result<Bytes, StoreError> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Err(StoreError::NotFound(format!("blob {key}")));
                }
                return Err(classify(e, "get", key));
            }
        };

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Retryable(format!("read {key}: {e}")))?;

        let data = body.into_bytes();
        debug!(key = %key, size_bytes = data.len(), "Audio downloaded from S3");
        Ok(data)
    }
}
