use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::debug;

use crate::{
    error::ServiceError,
    model::{GenerationRequest, GenerationResponse, LoadReport, ModelConfig},
    service::CompletionService,
};

#[derive(Clone)]
pub struct AppState {
    pub service: CompletionService,
}

#[derive(Serialize)]
struct MetadataResponse {
    model: ModelConfig,
    device: String,
    vocab_size: usize,
    checkpoint: LoadReport,
}

pub fn build_router(service: CompletionService) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/metadata", get(metadata))
        .with_state(state)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerationResponse>, ServiceError> {
    let Json(request) =
        payload.map_err(|rejection| ServiceError::InvalidArgument(rejection.body_text()))?;

    let result = state.service.complete(request).await?;
    debug!(
        generated = result.generated_tokens,
        stop = ?result.stop_reason,
        "http generate"
    );

    Ok(Json(GenerationResponse {
        response: result.text,
    }))
}

async fn metadata(State(state): State<AppState>) -> Json<MetadataResponse> {
    let serving = state.service.state();
    Json(MetadataResponse {
        model: serving.config().clone(),
        device: serving.device(),
        vocab_size: serving.tokenizer().vocab_size(),
        checkpoint: serving.load_report().clone(),
    })
}
