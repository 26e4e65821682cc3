//! Encore Processor
//!
//! Audio job orchestration for the Encore music platform. The service
//! consumes job requests from the work queue, makes sure each song's encoded
//! audio ends up in blob storage exactly once, and tracks progress as
//! operation records that clients can query over HTTP.
//!
//! ## Architecture
//!
//! ```text
//!  Work queue               Orchestrator                Stores
//! ┌────────────┐  receive  ┌──────────────┐        ┌──────────────────┐
//! │ job        │──────────▶│ per-song     │───────▶│ operations (pg)  │
//! │ requests   │◀──────────│ lock, retry  │───────▶│ songs (pg)       │
//! └────────────┘  requeue  └──────────────┘        └──────────────────┘
//!                             │       │                     ▲
//!                             ▼       ▼                     │
//!                    ┌────────────┐ ┌────────────┐  ┌──────────────┐
//!                    │ Acquirer   │ │ Blob store │  │ Status API   │
//!                    │ (command)  │ │ (S3/disk)  │  │ (axum)       │
//!                    └────────────┘ └────────────┘  └──────────────┘
//! ```
//!
//! Every backend sits behind a trait (`OperationStore`, `MetadataStore`,
//! `BlobStore`, `MessageQueue`, `AudioAcquirer`) and is chosen by
//! configuration; in-memory implementations back local runs and tests.

pub mod acquisition;
pub mod api;
pub mod blob;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod status;
pub mod store;

pub use acquisition::{AudioAcquirer, CommandAcquirer};
pub use api::{router, start_api_server, AppState};
pub use blob::{BlobStore, LocalBlobStore, MemoryBlobStore, S3BlobStore};
pub use config::Config;
pub use error::{AcquireError, ProcessError, StoreError};
pub use model::{blob_key, JobRequest, Metadata, Operation, OperationStatus};
pub use orchestrator::{Orchestrator, OrchestratorSettings, Outcome};
pub use status::OperationStatusService;
pub use store::{
    MemoryMetadataStore, MemoryOperationStore, MetadataStore, OperationStore, PostgresStore,
};
