//! HTTP surface for operation status, plus liveness and readiness checks.

use crate::config::ApiConfig;
use crate::error::StoreError;
use crate::model::Operation;
use crate::status::OperationStatusService;
use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub status: OperationStatusService,
    /// Checked by `/ready`; `None` for the in-memory backend
    pub pool: Option<PgPool>,
}

#[derive(Debug, Deserialize)]
pub struct SongQuery {
    pub song_id: String,
}

/// JSON error body with a stable machine-readable code.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    pub code: &'static str,
    pub error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ApiError {
                status: StatusCode::NOT_FOUND,
                code: "NOT_FOUND",
                error: format!("{what} not found"),
            },
            other => {
                error!(error = %other, "Operation lookup failed");
                ApiError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "STORE_ERROR",
                    error: other.to_string(),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct Readiness {
    ready: bool,
    database: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn cors_layer(config: &ApiConfig) -> CorsLayer {
    if !config.cors_enabled {
        return CorsLayer::new();
    }
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if config.cors_origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    layer.allow_origin(origins)
}

pub fn router(state: AppState, config: &ApiConfig) -> Router {
    Router::new()
        .route("/health", get(live))
        .route("/ready", get(ready))
        .route(
            "/api/v1/operations/:operation_id",
            get(get_operation).delete(delete_operation),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(config))
        .with_state(state)
}

async fn live() -> &'static str {
    "ok"
}

async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Readiness>) {
    let Some(pool) = state.pool else {
        return (
            StatusCode::OK,
            Json(Readiness {
                ready: true,
                database: "memory",
                error: None,
            }),
        );
    };

    match sqlx::query("SELECT 1").execute(&pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(Readiness {
                ready: true,
                database: "postgres",
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(Readiness {
                ready: false,
                database: "postgres",
                error: Some(e.to_string()),
            }),
        ),
    }
}

#[instrument(skip(state))]
async fn get_operation(
    State(state): State<AppState>,
    Path(operation_id): Path<Uuid>,
    Query(query): Query<SongQuery>,
) -> Result<Json<Operation>, ApiError> {
    let operation = state.status.get(operation_id, &query.song_id).await?;
    Ok(Json(operation))
}

#[instrument(skip(state))]
async fn delete_operation(
    State(state): State<AppState>,
    Path(operation_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.status.delete(operation_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Serve until `cancel` fires, then drain in-flight requests.
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind status API to {addr}"))?;
    info!(address = %addr, "Status API listening");

    axum::serve(listener, router(state, config))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Status API stopped unexpectedly")
}
