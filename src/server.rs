use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::{
    cache::ResponseCache,
    config::AppConfig,
    error::ServiceError,
    ledger::{JobStatus, Ledger, RequestLog},
    model::{GenerationRequest, GenerationResult, ModelInfo, ModelKind, ModelRouter},
    service::InferenceService,
    training::{Trainer, TrainingAccepted, TrainingRequest},
};

/// Everything a request handler needs, built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub service: Arc<InferenceService>,
    pub ledger: Arc<dyn Ledger>,
    pub trainer: Arc<Trainer>,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        router: Arc<ModelRouter>,
        cache: Arc<dyn ResponseCache>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        let service = InferenceService::new(router, cache, config.cache_ttl);
        let trainer = Trainer::new(ledger.clone(), config.training_step);
        Self {
            service: Arc::new(service),
            trainer: Arc::new(trainer),
            ledger,
            config,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    device: String,
    models_loaded: usize,
    max_concurrent_requests: usize,
}

#[derive(Deserialize)]
struct ReloadRequest {
    model: String,
}

#[derive(Serialize)]
struct ReloadResponse {
    model: String,
    #[serde(rename = "type")]
    kind: ModelKind,
}

#[derive(Serialize)]
struct TrainingStatusResponse {
    task_id: String,
    status: JobStatus,
    progress: f64,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/models", get(list_models))
        .route("/models/reload", post(reload_model))
        .route("/train", post(start_training))
        .route("/training/:task_id", get(training_status))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now(),
        device: state.config.device_label(),
        models_loaded: state.service.router().loaded_count(),
        max_concurrent_requests: state.config.max_concurrent_requests,
    })
}

async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<GenerationResult>, ServiceError> {
    let start = Instant::now();
    let model = request
        .model
        .clone()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| state.config.default_model.clone());
    let prompt = request.prompt.clone();

    let outcome = match request.validate(&state.config.default_model, state.config.max_tokens) {
        Ok(validated) => state.service.generate(validated).await,
        Err(err) => Err(err),
    };

    let entry = match &outcome {
        Ok(result) => RequestLog::success(
            &model,
            &prompt,
            result.tokens_used,
            result.processing_time_ms,
        ),
        Err(err) => {
            error!(model = %model, error = %err, "generation failed");
            RequestLog::failure(
                &model,
                &prompt,
                start.elapsed().as_millis() as u64,
                err.to_string(),
            )
        }
    };
    let ledger = state.ledger.clone();
    tokio::spawn(async move {
        if let Err(err) = ledger.record_request(entry).await {
            warn!(error = %err, "failed to log request");
        }
    });

    outcome.map(Json)
}

async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelInfo>> {
    Json(state.service.router().list_models().await)
}

async fn reload_model(
    State(state): State<AppState>,
    Json(request): Json<ReloadRequest>,
) -> Result<Json<ReloadResponse>, ServiceError> {
    if request.model.trim().is_empty() {
        return Err(ServiceError::BadRequest("model must not be empty".into()));
    }
    info!(model = %request.model, "forced model reload");
    let handle = state.service.router().resolve(&request.model, true).await?;
    Ok(Json(ReloadResponse {
        model: request.model,
        kind: handle.kind(),
    }))
}

async fn start_training(
    State(state): State<AppState>,
    Json(request): Json<TrainingRequest>,
) -> Result<Json<TrainingAccepted>, ServiceError> {
    Ok(Json(state.trainer.submit(request).await?))
}

async fn training_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TrainingStatusResponse>, ServiceError> {
    let job = state
        .ledger
        .job(&task_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound("Training task not found".into()))?;

    Ok(Json(TrainingStatusResponse {
        task_id: job.id,
        status: job.status,
        progress: job.progress,
        created_at: job.created_at,
        started_at: job.started_at,
        completed_at: job.completed_at,
        error_message: job.error_message,
    }))
}
