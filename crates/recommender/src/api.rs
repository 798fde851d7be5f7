//! HTTP API for health checks, Prometheus metrics and state ingestion
//!
//! The ingestion routes stand in for the watch and metrics feeds: they take
//! pods, VPA objects, usage samples and OOM events as JSON and apply them to
//! the shared cluster state.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use recommender_lib::{
    ClusterState, ContainerId, ContainerUsageSampleWithKey, LabelSelector, Labels, ModelError,
    PodId, PodPhase, RecommenderMetrics, ResourceAmount, Resources, StructuredLogger, VpaId,
    VpaObject,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<RwLock<ClusterState>>,
    pub metrics: RecommenderMetrics,
    pub logger: StructuredLogger,
}

impl AppState {
    pub fn new(
        cluster: Arc<RwLock<ClusterState>>,
        metrics: RecommenderMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            cluster,
            metrics,
            logger,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    pods: usize,
    containers: usize,
    vpas: usize,
    aggregates: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_gc: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(err: ModelError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match err {
        ModelError::PodNotFound(_)
        | ModelError::ContainerNotFound(_)
        | ModelError::VpaNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

/// Health check response with a summary of the tracked state
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cluster = state.cluster.read().await;
    Json(HealthResponse {
        status: "ok",
        pods: cluster.pod_count(),
        containers: cluster.container_count(),
        vpas: cluster.vpa_count(),
        aggregates: cluster.aggregate_count(),
        last_gc: cluster.last_gc(),
    })
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            buffer,
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            err.to_string().into_bytes(),
        ),
    }
}

/// Aggregate as seen by the recommendation pass
#[derive(Debug, Serialize, Deserialize)]
pub struct AggregateView {
    pub namespace: String,
    pub container_name: String,
    pub labels: Labels,
    pub total_samples_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_sample_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sample_start: Option<DateTime<Utc>>,
    pub is_under_vpa: bool,
    pub cpu_cores_p50: f64,
    pub cpu_cores_p90: f64,
    pub cpu_cores_p95: f64,
    pub memory_bytes_p50: f64,
    pub memory_bytes_p90: f64,
    pub memory_bytes_p95: f64,
}

async fn aggregates(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshots = state.cluster.read().await.aggregate_snapshots();
    let mut views: Vec<AggregateView> = snapshots
        .into_iter()
        .map(|(key, snapshot)| AggregateView {
            namespace: key.namespace().to_string(),
            container_name: key.container_name().to_string(),
            labels: key.labels().clone(),
            total_samples_count: snapshot.total_samples_count,
            first_sample_start: snapshot.first_sample_start,
            last_sample_start: snapshot.last_sample_start,
            is_under_vpa: snapshot.is_under_vpa,
            cpu_cores_p50: snapshot.cpu_percentile(0.5),
            cpu_cores_p90: snapshot.cpu_percentile(0.9),
            cpu_cores_p95: snapshot.cpu_percentile(0.95),
            memory_bytes_p50: snapshot.memory_percentile(0.5),
            memory_bytes_p90: snapshot.memory_percentile(0.9),
            memory_bytes_p95: snapshot.memory_percentile(0.95),
        })
        .collect();
    views.sort_by(|a, b| {
        (&a.namespace, &a.container_name).cmp(&(&b.namespace, &b.container_name))
    });
    Json(views)
}

#[derive(Debug, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    #[serde(default)]
    pub request: Resources,
}

#[derive(Debug, Deserialize)]
pub struct PodSpec {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
}

async fn upsert_pod(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<PodSpec>,
) -> impl IntoResponse {
    let now = Utc::now();
    let pod_id = PodId::new(spec.namespace, spec.name);
    let mut cluster = state.cluster.write().await;
    cluster.add_or_update_pod(pod_id.clone(), &spec.labels, spec.phase, now);

    let stale: Vec<ContainerId> = cluster
        .pod(&pod_id)
        .into_iter()
        .flat_map(|pod| pod.container_names())
        .filter(|name| !spec.containers.iter().any(|c| c.name == *name))
        .map(|name| ContainerId::new(pod_id.clone(), name))
        .collect();
    for id in &stale {
        if let Err(err) = cluster.delete_container(id) {
            return error_response(err).into_response();
        }
    }

    for container in spec.containers {
        let id = ContainerId::new(pod_id.clone(), container.name);
        if let Err(err) = cluster.add_or_update_container(&id, container.request, now) {
            return error_response(err).into_response();
        }
    }
    debug!(pod = %pod_id, "Pod upserted");
    StatusCode::NO_CONTENT.into_response()
}

async fn delete_pod(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let id = PodId::new(namespace, name);
    match state.cluster.write().await.delete_pod(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SampleResult {
    pub accepted: usize,
    pub rejected: usize,
    pub errors: Vec<String>,
}

async fn add_samples(
    State(state): State<Arc<AppState>>,
    Json(samples): Json<Vec<ContainerUsageSampleWithKey>>,
) -> impl IntoResponse {
    let cluster = state.cluster.read().await;
    let mut result = SampleResult::default();
    for sample in &samples {
        match cluster.add_sample(sample) {
            Ok(accepted) => {
                state.metrics.record_sample(sample.sample.resource, accepted);
                if accepted {
                    result.accepted += 1;
                } else {
                    result.rejected += 1;
                }
            }
            Err(err) => {
                state.metrics.record_sample(sample.sample.resource, false);
                result.errors.push(err.to_string());
            }
        }
    }
    Json(result)
}

#[derive(Debug, Deserialize)]
pub struct OomEvent {
    pub container: ContainerId,
    pub timestamp: DateTime<Utc>,
    pub requested_memory: ResourceAmount,
}

async fn record_oom(
    State(state): State<Arc<AppState>>,
    Json(event): Json<OomEvent>,
) -> impl IntoResponse {
    let cluster = state.cluster.read().await;
    match cluster.record_oom(&event.container, event.timestamp, event.requested_memory) {
        Ok(()) => {
            state.metrics.inc_ooms_recorded();
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            state
                .logger
                .log_oom_rejected(&event.container.to_string(), &err.to_string());
            error_response(err).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VpaSpec {
    #[serde(flatten)]
    pub object: VpaObject,
    #[serde(default)]
    pub selector: LabelSelector,
}

async fn upsert_vpa(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<VpaSpec>,
) -> impl IntoResponse {
    let id = spec.object.id();
    let mut cluster = state.cluster.write().await;
    cluster.add_or_update_vpa(&spec.object, Arc::new(spec.selector));
    info!(vpa = %id, "VPA upserted");
    StatusCode::NO_CONTENT
}

async fn delete_vpa(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let id = VpaId::new(namespace, name);
    match state.cluster.write().await.delete_vpa(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn vpa_status(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let id = VpaId::new(namespace, name);
    match state.cluster.read().await.vpa(&id) {
        Some(vpa) => Json(vpa.as_status()).into_response(),
        None => error_response(ModelError::VpaNotFound(id)).into_response(),
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/aggregates", get(aggregates))
        .route("/pods", post(upsert_pod))
        .route("/pods/:namespace/:name", delete(delete_pod))
        .route("/samples", post(add_samples))
        .route("/ooms", post(record_oom))
        .route("/vpas", post(upsert_vpa))
        .route("/vpas/:namespace/:name", delete(delete_vpa))
        .route("/vpas/:namespace/:name/status", get(vpa_status))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
