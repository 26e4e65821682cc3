//! Processor settings.
//!
//! Layered from `config/processor.*`, `/etc/encore/processor.*` and then
//! `PROCESSOR__SECTION__KEY` environment variables. Every key is optional.

use anyhow::{bail, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub queue: QueueConfig,
    pub blob: BlobConfig,
    pub database: DatabaseConfig,
    pub acquisition: AcquisitionConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Reported in logs
    pub name: String,
    /// Fallback filter when `RUST_LOG` is unset
    pub log_level: String,
    pub metrics_port: u16,
    /// Attempts per operation before it stays Failed
    pub max_attempts: u32,
    /// Messages handled at once
    pub worker_count: usize,
    /// Pause after an empty receive
    pub poll_interval_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "encore-processor".to_string(),
            log_level: "info".to_string(),
            metrics_port: 9090,
            max_attempts: 3,
            worker_count: 4,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    #[default]
    Kafka,
    Memory,
}

/// Which queue to consume. Kafka itself is configured through `KAFKA_*`
/// variables, see [`encore_queue::KafkaConfig::from_env`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub memory_batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Kafka,
            memory_batch_size: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobBackend {
    #[default]
    S3,
    Local,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    pub backend: BlobBackend,
    pub s3: S3Config,
    pub local_root: PathBuf,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            backend: BlobBackend::S3,
            s3: S3Config::default(),
            local_root: PathBuf::from("data/blobs"),
        }
    }
}

const FIVE_MIB: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Set for MinIO or LocalStack
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    /// Audio at least this large goes up in parts
    pub multipart_threshold_bytes: usize,
    pub part_size_bytes: usize,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: "encore-audio".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            force_path_style: false,
            multipart_threshold_bytes: FIVE_MIB,
            part_size_bytes: FIVE_MIB,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseBackend {
    #[default]
    Postgres,
    Memory,
}

/// Backing store for operations and song metadata.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    /// `postgres://` URL, required for the Postgres backend
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::Postgres,
            url: String::new(),
            max_connections: 10,
            min_connections: 2,
            connect_timeout_secs: 30,
            idle_timeout_secs: 600,
            run_migrations: true,
        }
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// External command that writes encoded audio to stdout.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub program: String,
    /// `{url}` and `{song_id}` are substituted per job
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            program: "encore-fetch".to_string(),
            args: vec!["{url}".to_string()],
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub cors_enabled: bool,
    /// Any origin when empty
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::with_name("config/processor").required(false))
            .add_source(config::File::with_name("/etc/encore/processor").required(false))
            .add_source(
                config::Environment::with_prefix("PROCESSOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the service cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.service.max_attempts == 0 {
            bail!("service.max_attempts must be at least 1");
        }
        if self.service.worker_count == 0 {
            bail!("service.worker_count must be at least 1");
        }
        if self.database.backend == DatabaseBackend::Postgres && self.database.url.is_empty() {
            bail!("database.url is required for the postgres backend");
        }
        if self.blob.s3.part_size_bytes < FIVE_MIB {
            bail!("blob.s3.part_size_bytes is below the S3 minimum part size");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.service.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: serde_json::Value) -> Config {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config = parse(serde_json::json!({
            "service": { "max_attempts": 5 },
            "queue": { "backend": "memory" },
            "blob": { "backend": "local", "local_root": "/tmp/encore" },
            "database": { "backend": "memory" }
        }));

        assert_eq!(config.service.max_attempts, 5);
        assert_eq!(config.service.worker_count, 4);
        assert_eq!(config.queue.backend, QueueBackend::Memory);
        assert_eq!(config.blob.backend, BlobBackend::Local);
        assert_eq!(config.blob.local_root, PathBuf::from("/tmp/encore"));
        assert_eq!(config.blob.s3.part_size_bytes, FIVE_MIB);
        assert_eq!(config.database.backend, DatabaseBackend::Memory);
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.database.connect_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_uses_production_backends() {
        let config = parse(serde_json::json!({}));
        assert_eq!(config.queue.backend, QueueBackend::Kafka);
        assert_eq!(config.blob.backend, BlobBackend::S3);
        assert_eq!(config.database.backend, DatabaseBackend::Postgres);
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        let missing_url = Config::default();
        assert!(missing_url.validate().is_err());

        let no_workers = parse(serde_json::json!({
            "service": { "worker_count": 0 },
            "database": { "backend": "memory" }
        }));
        assert!(no_workers.validate().is_err());

        let tiny_parts = parse(serde_json::json!({
            "blob": { "s3": { "part_size_bytes": 1024 } },
            "database": { "backend": "memory" }
        }));
        assert!(tiny_parts.validate().is_err());
    }
}
