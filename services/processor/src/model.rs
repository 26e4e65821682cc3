//! Job requests, operation records and track metadata.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "processing" => Ok(OperationStatus::Processing),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(StoreError::Backend(format!("unknown operation status '{other}'"))),
        }
    }
}

/// Description of a processed track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Empty until saved; the store generates one if needed.
    #[serde(default)]
    pub id: String,
    pub title: String,
    pub url_youtube: String,
    pub thumbnail: Option<String>,
    pub platform: String,
    /// Track length in seconds
    pub duration_secs: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Metadata {
    /// Title, source locator and platform are required.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.title.trim().is_empty() {
            return Err(StoreError::Validation("title is required".to_string()));
        }
        if self.url_youtube.trim().is_empty() {
            return Err(StoreError::Validation("source url is required".to_string()));
        }
        if self.platform.trim().is_empty() {
            return Err(StoreError::Validation("platform is required".to_string()));
        }
        Ok(())
    }
}

/// Stable metadata id for a song, so concurrent attempts collide on the key.
pub fn metadata_id_for(song_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("encore:song:{song_id}").as_bytes()).to_string()
}

/// Blob key of the encoded track for a song.
pub fn blob_key(song_id: &str) -> String {
    format!("audio/{}.dca", sanitize_path_component(song_id))
}

/// Replace anything outside `[A-Za-z0-9_-]` so ids cannot escape their prefix.
pub fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Progress record for one song's processing.
///
/// `error` is only set while Failed and `metadata` only while Completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub song_id: String,
    pub status: OperationStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    pub fn pending(id: Uuid, song_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            song_id: song_id.into(),
            status: OperationStatus::Pending,
            attempts: 0,
            error: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Enter Processing and count the attempt.
    pub fn start_attempt(&mut self) {
        self.attempts += 1;
        self.set_status(OperationStatus::Processing);
        self.error = None;
        self.metadata = None;
    }

    pub fn complete(&mut self, metadata: Metadata) {
        self.set_status(OperationStatus::Completed);
        self.error = None;
        self.metadata = Some(metadata);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.set_status(OperationStatus::Failed);
        self.error = Some(error.into());
        self.metadata = None;
    }

    /// Re-admit a Failed operation for another attempt.
    pub fn reset_to_pending(&mut self) {
        self.set_status(OperationStatus::Pending);
        self.error = None;
    }

    fn set_status(&mut self, status: OperationStatus) {
        self.status = status;
        // Timestamps of consecutive writes must not go backwards for
        // "latest by updated_at" lookups.
        self.updated_at = Utc::now().max(self.updated_at);
    }
}

/// Job message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub song_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<Uuid>,
    pub title: String,
    pub url: String,
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
}

impl JobRequest {
    pub fn blob_key(&self) -> String {
        blob_key(&self.song_id)
    }

    pub fn to_metadata(&self) -> Metadata {
        let now = Utc::now();
        Metadata {
            id: metadata_id_for(&self.song_id),
            title: self.title.clone(),
            url_youtube: self.url.clone(),
            thumbnail: self.thumbnail.clone(),
            platform: self.platform.clone(),
            duration_secs: self.duration_secs,
            created_at: now,
            updated_at: now,
        }
    }
}
