use super::{prepare_metadata, require_id, MetadataStore, OperationStore};
use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::model::{Metadata, Operation};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[derive(Debug, FromRow)]
struct OperationRow {
    id: Uuid,
    song_id: String,
    status: String,
    attempts: i32,
    error: Option<String>,
    metadata: Option<Json<Metadata>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OperationRow> for Operation {
    type Error = StoreError;

    fn try_from(row: OperationRow) -> Result<Self, Self::Error> {
        let attempts = u32::try_from(row.attempts).map_err(|_| {
            StoreError::Backend(format!(
                "operation {} has negative attempts {}",
                row.id, row.attempts
            ))
        })?;

        Ok(Operation {
            id: row.id,
            song_id: row.song_id,
            status: row.status.parse()?,
            attempts,
            error: row.error,
            metadata: row.metadata.map(|Json(m)| m),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct SongRow {
    id: String,
    title: String,
    url_youtube: String,
    thumbnail: Option<String>,
    platform: String,
    duration_secs: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SongRow> for Metadata {
    fn from(row: SongRow) -> Self {
        Metadata {
            id: row.id,
            title: row.title,
            url_youtube: row.url_youtube,
            thumbnail: row.thumbnail,
            platform: row.platform,
            duration_secs: row.duration_secs.and_then(|d| u32::try_from(d).ok()),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Map a sqlx failure onto the store error taxonomy.
fn classify(e: sqlx::Error, what: &str) -> StoreError {
    match e {
        sqlx::Error::RowNotFound => StoreError::NotFound(what.to_string()),
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            StoreError::DuplicateKey(what.to_string())
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Retryable(format!("{what}: {e}")),
        other => StoreError::Backend(format!("{what}: {other}")),
    }
}

/// PostgreSQL-backed operation and metadata store
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new store with a connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl OperationStore for PostgresStore {
    #[instrument(skip(self, operation), fields(operation_id = %operation.id, song_id = %operation.song_id))]
    async fn save(&self, operation: &Operation) -> Result<(), StoreError> {
        let metadata = operation.metadata.as_ref().map(Json);

        sqlx::query(
            r#"
            INSERT INTO operations (
                id, song_id, status, attempts, error, metadata, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8
            )
            ON CONFLICT (id) DO UPDATE SET
                song_id = EXCLUDED.song_id,
                status = EXCLUDED.status,
                attempts = EXCLUDED.attempts,
                error = EXCLUDED.error,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(operation.id)
        .bind(&operation.song_id)
        .bind(operation.status.as_str())
        .bind(i32::try_from(operation.attempts).unwrap_or(i32::MAX))
        .bind(&operation.error)
        .bind(metadata)
        .bind(operation.created_at)
        .bind(operation.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, "save operation"))?;

        debug!(status = %operation.status, attempts = operation.attempts, "Operation saved");
        Ok(())
    }

    async fn get(&self, id: Uuid, song_id: &str) -> Result<Operation, StoreError> {
        let row = sqlx::query_as::<_, OperationRow>(
            r#"
            SELECT id, song_id, status, attempts, error, metadata, created_at, updated_at
            FROM operations
            WHERE id = $1 AND song_id = $2
            "#,
        )
        .bind(id)
        .bind(song_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify(e, "get operation"))?
        .ok_or_else(|| StoreError::NotFound(format!("operation {id} for song {song_id}")))?;

        row.try_into()
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM operations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, "delete operation"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("operation {id}")));
        }

        info!(operation_id = %id, "Operation deleted");
        Ok(())
    }

    async fn find_by_song(&self, song_id: &str) -> Result<Option<Operation>, StoreError> {
        let row = sqlx::query_as::<_, OperationRow>(
            r#"
            SELECT id, song_id, status, attempts, error, metadata, created_at, updated_at
            FROM operations
            WHERE song_id = $1
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(song_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify(e, "find operation by song"))?;

        row.map(Operation::try_from).transpose()
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    #[instrument(skip(self, metadata), fields(title = %metadata.title))]
    async fn save(&self, metadata: Metadata) -> Result<Metadata, StoreError> {
        let metadata = prepare_metadata(metadata)?;

        let row = sqlx::query_as::<_, SongRow>(
            r#"
            INSERT INTO songs (
                id, title, url_youtube, thumbnail, platform, duration_secs,
                created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, NOW(), NOW()
            )
            RETURNING id, title, url_youtube, thumbnail, platform, duration_secs,
                      created_at, updated_at
            "#,
        )
        .bind(&metadata.id)
        .bind(&metadata.title)
        .bind(&metadata.url_youtube)
        .bind(&metadata.thumbnail)
        .bind(&metadata.platform)
        .bind(metadata.duration_secs.map(i64::from))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match classify(e, &metadata.id) {
            StoreError::DuplicateKey(_) => StoreError::DuplicateKey(metadata.id.clone()),
            other => other,
        })?;

        metrics::counter!("processor.metadata.saved").increment(1);
        info!(metadata_id = %row.id, "Metadata saved");

        Ok(row.into())
    }

    async fn get(&self, id: &str) -> Result<Metadata, StoreError> {
        require_id(id)?;

        let row = sqlx::query_as::<_, SongRow>(
            r#"
            SELECT id, title, url_youtube, thumbnail, platform, duration_secs,
                   created_at, updated_at
            FROM songs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify(e, "get metadata"))?
        .ok_or_else(|| StoreError::NotFound(format!("metadata {id}")))?;

        Ok(row.into())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        require_id(id)?;

        let result = sqlx::query("DELETE FROM songs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, "delete metadata"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("metadata {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OperationStatus;

    #[test]
    fn test_classify_connectivity_errors_as_retryable() {
        assert!(classify(sqlx::Error::PoolTimedOut, "save").is_retryable());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(classify(sqlx::Error::Io(io), "save").is_retryable());
        assert!(matches!(
            classify(sqlx::Error::RowNotFound, "get"),
            StoreError::NotFound(_)
        ));
        assert!(matches!(
            classify(sqlx::Error::ColumnNotFound("status".into()), "get"),
            StoreError::Backend(_)
        ));
    }

    #[test]
    fn test_operation_row_conversion() {
        let now = Utc::now();
        let row = OperationRow {
            id: Uuid::new_v4(),
            song_id: "abc".to_string(),
            status: "failed".to_string(),
            attempts: 2,
            error: Some("timeout".to_string()),
            metadata: None,
            created_at: now,
            updated_at: now,
        };

        let op = Operation::try_from(row).unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.attempts, 2);

        let bad = OperationRow {
            id: Uuid::new_v4(),
            song_id: "abc".to_string(),
            status: "exploded".to_string(),
            attempts: 0,
            error: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        };
        assert!(matches!(Operation::try_from(bad), Err(StoreError::Backend(_))));
    }

    #[test]
    fn test_negative_attempts_is_rejected() {
        let now = Utc::now();
        let row = OperationRow {
            id: Uuid::new_v4(),
            song_id: "abc".to_string(),
            status: "failed".to_string(),
            attempts: -1,
            error: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        };

        match Operation::try_from(row) {
            Err(StoreError::Backend(reason)) => assert!(reason.contains("negative attempts")),
            other => panic!("expected a backend error, got {other:?}"),
        }
    }
}
