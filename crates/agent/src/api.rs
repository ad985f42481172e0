//! HTTP API: health, Prometheus metrics, the job queue, the glidein registry,
//! rendered time series and presigned log objects

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use glidein_lib::{
    finalizer::{LocalObjectStore, SignedObject},
    health::{ComponentStatus, HealthRegistry},
    metrics::{parse_from, InMemoryTimeSeries, SeriesResponse},
    models::{Activity, ClusterId, GlideinRecord, JobSpec},
    queue::{HistoryEntry, JobAction, JobFilter, JobQueue},
    registry::{AdvertisementRegistry, RecordFilter},
    GlideinError,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub queue: Arc<dyn JobQueue>,
    pub registry: Arc<dyn AdvertisementRegistry>,
    pub timeseries: Arc<InMemoryTimeSeries>,
    pub store: Arc<LocalObjectStore>,
}

/// Error body returned by every endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

pub struct ApiError(StatusCode, ErrorBody);

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self(
            StatusCode::BAD_REQUEST,
            ErrorBody {
                error: message.into(),
                kind: "bad_request".to_string(),
            },
        )
    }
}

impl From<GlideinError> for ApiError {
    fn from(err: GlideinError) -> Self {
        let status = match &err {
            GlideinError::Queue(_) | GlideinError::SchemaViolation { .. } => StatusCode::BAD_REQUEST,
            GlideinError::InvalidSignature(_) => StatusCode::FORBIDDEN,
            GlideinError::UnknownRecord(_) => StatusCode::NOT_FOUND,
            GlideinError::DuplicateIdentity(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(
            status,
            ErrorBody {
                error: err.to_string(),
                kind: err.kind().to_string(),
            },
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(flatten)]
    pub spec: JobSpec,
    #[serde(default = "default_count")]
    pub count: u32,
}

fn default_count() -> u32 {
    1
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub cluster: ClusterId,
    pub count: u32,
}

async fn submit_jobs(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let cluster = state.queue.submit(request.spec, request.count).await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            cluster,
            count: request.count,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub cluster: Option<u64>,
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    100
}

async fn job_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let filter = JobFilter {
        cluster: query.cluster.map(ClusterId),
    };
    Ok(Json(state.queue.query_history(&filter, query.limit).await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveResponse {
    pub removed: usize,
}

async fn remove_jobs(
    State(state): State<Arc<AppState>>,
    Json(filter): Json<JobFilter>,
) -> Result<Json<RemoveResponse>, ApiError> {
    let removed = state.queue.act(JobAction::Remove, &filter).await?;
    info!(removed, cluster = ?filter.cluster, "Removed jobs via API");
    Ok(Json(RemoveResponse { removed }))
}

#[derive(Debug, Default, Deserialize)]
pub struct GlideinQuery {
    pub site: Option<String>,
    pub partition: Option<String>,
    /// Comma-separated capabilities that must be true
    pub resources: Option<String>,
    pub activity: Option<Activity>,
    pub accepting: Option<bool>,
    /// Withdrawn and expired records instead of live ones
    #[serde(default)]
    pub retired: bool,
}

impl GlideinQuery {
    fn filter(&self) -> RecordFilter {
        let mut filter = RecordFilter::all();
        if let Some(site) = &self.site {
            filter = filter.site(site.clone());
        }
        if let Some(partition) = &self.partition {
            filter = filter.partition(partition.clone());
        }
        if let Some(resources) = &self.resources {
            for name in resources.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                filter = filter.resource(name);
            }
        }
        if let Some(activity) = self.activity {
            filter = filter.activity(activity);
        }
        if let Some(accepting) = self.accepting {
            filter = filter.accepting_work(accepting);
        }
        filter
    }
}

async fn list_glideins(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GlideinQuery>,
) -> Result<Json<Vec<GlideinRecord>>, ApiError> {
    let filter = query.filter();
    let records = if query.retired {
        state.registry.list_retired(&filter).await?
    } else {
        state.registry.list_all(&filter).await?
    };
    Ok(Json(records))
}

#[derive(Debug, Deserialize)]
pub struct RenderQuery {
    pub target: String,
    #[serde(default = "default_from")]
    pub from: String,
}

fn default_from() -> String {
    "-10min".to_string()
}

async fn render(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RenderQuery>,
) -> Result<Json<Vec<SeriesResponse>>, ApiError> {
    let now = chrono::Utc::now().timestamp();
    let from = parse_from(&query.from, now)
        .ok_or_else(|| ApiError::bad_request(format!("invalid from {}", query.from)))?;
    Ok(Json(state.timeseries.render(&query.target, from)))
}

#[derive(Debug, Deserialize)]
pub struct SignatureQuery {
    pub expires: i64,
    pub signature: String,
}

async fn get_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<SignatureQuery>,
) -> Result<Response, ApiError> {
    let object = SignedObject {
        bucket,
        key,
        expires: query.expires,
        signature: query.signature,
    };
    let path = state.store.verify(&object, chrono::Utc::now().timestamp())?;
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok((
            StatusCode::OK,
            [("content-type", "application/gzip")],
            bytes,
        )
            .into_response()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StatusCode::NOT_FOUND.into_response()),
        Err(e) => Err(GlideinError::Io(e).into()),
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/jobs", post(submit_jobs))
        .route("/v1/jobs/history", get(job_history))
        .route("/v1/jobs/remove", post(remove_jobs))
        .route("/v1/glideins", get(list_glideins))
        .route("/render", get(render))
        .route("/objects/:bucket/*key", get(get_object))
        .with_state(state)
}

/// Start the API server
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
