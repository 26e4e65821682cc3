use anyhow::{Context, Result};
use encore_processor::config::{BlobBackend, Config, DatabaseBackend, QueueBackend};
use encore_processor::{
    start_api_server, AppState, BlobStore, CommandAcquirer, LocalBlobStore, MemoryBlobStore,
    MemoryMetadataStore, MemoryOperationStore, MetadataStore, OperationStatusService,
    OperationStore, Orchestrator, OrchestratorSettings, PostgresStore, S3BlobStore,
};
use encore_queue::{KafkaConfig, KafkaQueue, MemoryQueue, MessageQueue};
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long running jobs get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

struct Backends {
    queue: Arc<dyn MessageQueue>,
    operations: Arc<dyn OperationStore>,
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    pool: Option<PgPool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    init_telemetry(&config)?;
    info!(service = %config.service.name, "Starting");

    let backends = Backends::build(&config).await?;
    let orchestrator = Orchestrator::new(
        backends.queue,
        backends.operations.clone(),
        backends.metadata,
        backends.blobs,
        Arc::new(CommandAcquirer::from_config(&config.acquisition)),
        OrchestratorSettings {
            max_attempts: config.service.max_attempts,
            worker_count: config.service.worker_count,
            poll_interval: config.poll_interval(),
        },
    );
    let api_state = AppState {
        status: OperationStatusService::new(backends.operations),
        pool: backends.pool,
    };

    let cancel = CancellationToken::new();
    let worker = tokio::spawn({
        let cancel = cancel.clone();
        async move { orchestrator.run(cancel).await }
    });
    let api = tokio::spawn({
        let cancel = cancel.clone();
        let api_config = config.api.clone();
        async move {
            if let Err(e) = start_api_server(api_state, &api_config, cancel).await {
                error!(error = %e, "Status API failed");
            }
        }
    });

    wait_for_shutdown().await;
    info!("Shutdown requested, draining");
    cancel.cancel();

    let stopped = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let (worker, api) = tokio::join!(worker, api);
        report_task("orchestrator", worker);
        report_task("status API", api);
    })
    .await;
    if stopped.is_err() {
        warn!(grace = ?SHUTDOWN_GRACE, "Tasks still running at end of grace period");
    }

    info!("Stopped");
    Ok(())
}

impl Backends {
    async fn build(config: &Config) -> Result<Self> {
        let (operations, metadata, pool) = match config.database.backend {
            DatabaseBackend::Postgres => {
                let store = Arc::new(
                    PostgresStore::new(&config.database)
                        .await
                        .context("Failed to connect to Postgres")?,
                );
                if config.database.run_migrations {
                    store.run_migrations().await.context("Migrations failed")?;
                }
                let pool = store.pool().clone();
                let operations: Arc<dyn OperationStore> = store.clone();
                let metadata: Arc<dyn MetadataStore> = store;
                (operations, metadata, Some(pool))
            }
            DatabaseBackend::Memory => {
                warn!("In-memory stores selected, state is lost on restart");
                let operations: Arc<dyn OperationStore> = Arc::new(MemoryOperationStore::new());
                let metadata: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
                (operations, metadata, None)
            }
        };

        let blobs: Arc<dyn BlobStore> = match config.blob.backend {
            BlobBackend::S3 => Arc::new(
                S3BlobStore::new(&config.blob.s3)
                    .await
                    .context("Failed to set up S3 blob store")?,
            ),
            BlobBackend::Local => {
                info!(root = %config.blob.local_root.display(), "Blobs stored on local disk");
                Arc::new(LocalBlobStore::new(&config.blob.local_root))
            }
            BlobBackend::Memory => Arc::new(MemoryBlobStore::new()),
        };

        let queue: Arc<dyn MessageQueue> = match config.queue.backend {
            QueueBackend::Kafka => {
                let kafka = KafkaConfig::from_env().context("Invalid KAFKA_* settings")?;
                Arc::new(KafkaQueue::new(&kafka).context("Failed to connect to Kafka")?)
            }
            QueueBackend::Memory => Arc::new(MemoryQueue::new(config.queue.memory_batch_size)),
        };

        Ok(Self {
            queue,
            operations,
            metadata,
            blobs,
            pool,
        })
    }
}

/// Log a task that panicked or was aborted. Returns whether it ended cleanly.
fn report_task(task: &str, result: Result<(), JoinError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            error!(task, panicked = e.is_panic(), error = %e, "Task failed");
            false
        }
    }
}

/// JSON logs filtered by `RUST_LOG`, else the configured level, and a
/// Prometheus scrape endpoint.
fn init_telemetry(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();

    let port = config.service.metrics_port;
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to start Prometheus exporter")?;
    info!(port, "Metrics exporter listening");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = interrupt => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
