//! The thin northbound HTTP surface (spec §6). Deliberately minimal: the
//! request/response DTO layer and the field-name case converter are named
//! non-goals of the spec this core implements — these are the smallest
//! plausible wire shapes needed to exercise the four subsystems, not a
//! finished API surface.

use crate::cache::{ComponentRole, ModelCache, SuiteSpec};
use crate::metrics::MetricsSource;
use crate::pool::{ModelLoadSpec, WorkerPoolManager};
use crate::session::{SessionManager, SessionRequest};
use crate::{OrchestratorError, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub struct ServerState {
    pub pool: Arc<WorkerPoolManager>,
    pub cache: Arc<ModelCache>,
    pub sessions: Arc<SessionManager>,
    pub metrics: Arc<dyn MetricsSource>,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/models/:gpu/load", post(load_model))
        .route("/models/:gpu/unload", post(unload_model))
        .route("/models/validate", post(validate_models))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(session_status))
        .route("/sessions/:id/cancel", post(cancel_session))
        .route("/pool/status", get(pool_status))
        .route("/pool/auto-balance", get(auto_balance))
        .route("/suites/:name/cache", post(cache_suite))
        .route("/suites/:name/readiness", get(suite_readiness))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Uniform envelope: `{success, data?, error?: {code, message, details}}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    code: String,
    message: String,
    details: Option<Value>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body: ApiResponse<()> = ApiResponse {
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                code: self.category().to_string(),
                message: self.to_string(),
                details: None,
            }),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>>;

#[derive(Debug, Deserialize)]
pub struct LoadModelRequest {
    pub model_id: String,
    pub display_name: Option<String>,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct LoadModelResponse {
    pub gpu_id: String,
    pub model_id: String,
    pub size_bytes: u64,
    pub unloaded_previous: Option<String>,
    pub evicted: Vec<String>,
}

async fn load_model(
    State(state): State<Arc<ServerState>>,
    Path(gpu_id): Path<String>,
    Json(body): Json<LoadModelRequest>,
) -> ApiResult<LoadModelResponse> {
    let report = state
        .pool
        .load_model(
            &gpu_id,
            ModelLoadSpec {
                model_id: body.model_id,
                display_name: body.display_name.unwrap_or_default(),
                path: PathBuf::from(body.path),
            },
        )
        .await?;
    Ok(Json(ApiResponse::ok(LoadModelResponse {
        gpu_id: report.gpu_id,
        model_id: report.model_id,
        size_bytes: report.size_bytes,
        unloaded_previous: report.unloaded_previous,
        evicted: report.evicted,
    })))
}

#[derive(Debug, Serialize)]
pub struct UnloadModelResponse {
    pub unloaded: bool,
}

async fn unload_model(
    State(state): State<Arc<ServerState>>,
    Path(gpu_id): Path<String>,
) -> ApiResult<UnloadModelResponse> {
    let unloaded = state.pool.unload_model(&gpu_id).await?;
    Ok(Json(ApiResponse::ok(UnloadModelResponse { unloaded })))
}

#[derive(Debug, Deserialize)]
pub struct ValidateModelsRequest {
    pub paths: Vec<String>,
}

async fn validate_models(
    Json(body): Json<ValidateModelsRequest>,
) -> ApiResult<Vec<crate::cache::ValidationReport>> {
    let paths: Vec<PathBuf> = body.paths.into_iter().map(PathBuf::from).collect();
    let reports = crate::cache::validate_paths(&paths).await;
    Ok(Json(ApiResponse::ok(reports)))
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub model_id: String,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
}

async fn create_session(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CreateSessionRequest>,
) -> ApiResult<CreateSessionResponse> {
    let mut request = SessionRequest::inference(body.model_id, body.payload);
    if let Some(message_type) = body.message_type {
        request.message_type = message_type;
    }
    let session_id = state.sessions.create(request).await?;
    Ok(Json(ApiResponse::ok(CreateSessionResponse { session_id })))
}

#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    pub id: String,
    pub model_id: String,
    pub device_id: String,
    pub state: String,
    pub progress: u8,
    pub started_at: u64,
    pub completed_at: Option<u64>,
    pub error_message: Option<String>,
    pub output_artifacts: Vec<String>,
}

async fn session_status(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> ApiResult<SessionStatusResponse> {
    let snapshot = state.sessions.get_status(&session_id).await?;
    Ok(Json(ApiResponse::ok(SessionStatusResponse {
        id: snapshot.id,
        model_id: snapshot.model_id,
        device_id: snapshot.device_id,
        state: format!("{:?}", snapshot.state),
        progress: snapshot.progress,
        started_at: snapshot.started_at,
        completed_at: snapshot.completed_at,
        error_message: snapshot.error_message,
        output_artifacts: snapshot.output_artifacts,
    })))
}

#[derive(Debug, Serialize)]
pub struct CancelSessionResponse {
    pub cancelled: bool,
}

async fn cancel_session(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> ApiResult<CancelSessionResponse> {
    let cancelled = state.sessions.cancel(&session_id).await?;
    Ok(Json(ApiResponse::ok(CancelSessionResponse { cancelled })))
}

#[derive(Debug, Serialize)]
pub struct PoolStatusResponse {
    pub total_workers: usize,
    pub ready_workers: usize,
    pub busy_workers: usize,
    pub error_workers: usize,
    pub workers: Vec<WorkerStatusDto>,
}

#[derive(Debug, Serialize)]
pub struct WorkerStatusDto {
    pub gpu_id: String,
    pub state: String,
    pub current_model: Option<String>,
    pub active_sessions: u32,
    pub available_vram_bytes: u64,
    pub total_vram_bytes: u64,
}

async fn pool_status(State(state): State<Arc<ServerState>>) -> ApiResult<PoolStatusResponse> {
    let status = state.pool.pool_status().await;
    Ok(Json(ApiResponse::ok(PoolStatusResponse {
        total_workers: status.total_workers,
        ready_workers: status.ready_workers,
        busy_workers: status.busy_workers,
        error_workers: status.error_workers,
        workers: status
            .workers
            .into_iter()
            .map(|w| WorkerStatusDto {
                gpu_id: w.gpu_id,
                state: format!("{:?}", w.state),
                current_model: w.current_model,
                active_sessions: w.active_sessions,
                available_vram_bytes: w.available_vram_bytes,
                total_vram_bytes: w.total_vram_bytes,
            })
            .collect(),
    })))
}

#[derive(Debug, Serialize)]
pub struct RecommendationDto {
    pub kind: String,
    pub gpu_id: String,
    pub target_gpu_id: Option<String>,
    pub expected_benefit: f32,
    pub priority: u8,
}

/// Advisory-only placement recommendations (spec §4.1 `auto_balance`); the
/// caller decides whether to act on them, the core never executes them.
async fn auto_balance(State(state): State<Arc<ServerState>>) -> ApiResult<Vec<RecommendationDto>> {
    let recs = state.pool.auto_balance_live(state.metrics.as_ref()).await;
    Ok(Json(ApiResponse::ok(
        recs.into_iter()
            .map(|r| RecommendationDto {
                kind: match r.kind {
                    crate::pool::RecommendationKind::Migrate => "migrate".to_string(),
                    crate::pool::RecommendationKind::Cleanup => "cleanup".to_string(),
                },
                gpu_id: r.gpu_id,
                target_gpu_id: r.target_gpu_id,
                expected_benefit: r.expected_benefit,
                priority: r.priority,
            })
            .collect(),
    )))
}

#[derive(Debug, Deserialize)]
pub struct CacheSuiteRequest {
    /// component role (`base`, `refiner`, `vae`, `controlnet`, `lora`) -> path
    pub components: HashMap<String, String>,
    pub gpu_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CacheSuiteResponse {
    pub name: String,
    pub components: HashMap<String, std::result::Result<String, String>>,
}

async fn cache_suite(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Json(body): Json<CacheSuiteRequest>,
) -> ApiResult<CacheSuiteResponse> {
    let mut components = HashMap::new();
    for (role_str, path) in body.components {
        let Some(role) = ComponentRole::from_str(&role_str) else {
            return Err(OrchestratorError::Validation(format!(
                "unknown suite component role: {role_str}"
            )));
        };
        components.insert(role, PathBuf::from(path));
    }
    let spec = SuiteSpec { name: name.clone(), components };

    if let Some(gpu_id) = body.gpu_id {
        let report = state.pool.load_suite(&gpu_id, &spec).await;
        return Ok(Json(ApiResponse::ok(CacheSuiteResponse {
            name,
            components: report
                .components
                .into_iter()
                .map(|(k, v)| (k, v.map(|r| r.model_id)))
                .collect(),
        })));
    }

    let outcomes = state.cache.cache_suite(&spec, false).await;
    let components = outcomes
        .into_iter()
        .map(|(role, result)| (role.as_str().to_string(), result.map(|o| o.id).map_err(|e| e.to_string())))
        .collect();
    Ok(Json(ApiResponse::ok(CacheSuiteResponse { name, components })))
}

#[derive(Debug, Serialize)]
pub struct SuiteReadinessResponse {
    pub name: String,
    pub present: bool,
    pub components: HashMap<String, String>,
}

async fn suite_readiness(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> ApiResult<SuiteReadinessResponse> {
    let suites = state.cache.suites().await;
    match suites.into_iter().find(|s| s.name == name) {
        Some(record) => Ok(Json(ApiResponse::ok(SuiteReadinessResponse {
            name,
            present: true,
            components: record.components,
        }))),
        None => Ok(Json(ApiResponse::ok(SuiteReadinessResponse {
            name,
            present: false,
            components: HashMap::new(),
        }))),
    }
}
