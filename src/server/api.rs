//! HTTP API server implementation

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::config::OrchestratorConfig;
use crate::core::errors::TranslationError;
use crate::core::metrics::MetricsSnapshot;
use crate::core::models::{ModelChoice, TokenReservoir, TranslationContext, TranslationResult};
use crate::core::orchestrator::{BatchOutcome, BatchRequest, HealthReport, Orchestrator};
use crate::core::store::{load_progress, progress_key_for_lines};
use crate::processors::dedup::SubtitleFormat;

/// Application state
#[derive(Clone)]
pub struct AppState {
    orchestrator: Orchestrator,
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
}

/// Single-line or streaming translation request
#[derive(Debug, Deserialize)]
pub struct TranslateRequest {
    pub text: String,
    #[serde(default)]
    pub context: TranslationContext,
    /// `auto`, `fast`, `pro` or a model id
    #[serde(default)]
    pub model: Option<String>,
}

/// Batch translation request
#[derive(Debug, Deserialize)]
pub struct BatchTranslateRequest {
    pub lines: Vec<String>,
    /// Enables progress saving and resume under this name
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub format: Option<SubtitleFormat>,
    #[serde(default)]
    pub context: TranslationContext,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub resume: bool,
}

/// Batch translation response
#[derive(Debug, Serialize)]
pub struct BatchTranslateResponse {
    /// Translated lines, originals where translation did not finish
    pub lines: Vec<String>,
    pub completed_lines: usize,
    pub total_lines: usize,
    pub chunks_sent: usize,
    pub final_chunk_size: usize,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
}

/// Error surfaced to API clients with a matching status code
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn invalid(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorResponse {
                error: ErrorDetail {
                    message: message.to_string(),
                    code: Some("invalid_request".to_string()),
                    r#type: Some("invalid_request_error".to_string()),
                },
            },
        }
    }
}

impl From<TranslationError> for ApiError {
    fn from(err: TranslationError) -> Self {
        let status = match &err {
            TranslationError::QuotaExhausted => StatusCode::TOO_MANY_REQUESTS,
            TranslationError::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            TranslationError::Upstream { .. } | TranslationError::BatchAlignment { .. } => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            body: ErrorResponse {
                error: ErrorDetail {
                    message: err.to_string(),
                    code: Some(err.kind().to_string()),
                    r#type: Some("translation_error".to_string()),
                },
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn model_choice(model: &Option<String>) -> ModelChoice {
    model
        .as_deref()
        .and_then(|m| m.parse().ok())
        .unwrap_or_default()
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: crate::NAME.to_string(),
        version: crate::VERSION.to_string(),
    })
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.orchestrator.metrics())
}

async fn reset_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    state.orchestrator.reset_metrics().await;
    Json(state.orchestrator.metrics())
}

async fn get_reservoir(State(state): State<Arc<AppState>>) -> Json<TokenReservoir> {
    Json(state.orchestrator.reservoir().await)
}

async fn run_health_check(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    Json(state.orchestrator.check_health().await)
}

async fn translate(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TranslateRequest>,
) -> Result<Json<TranslationResult>, ApiError> {
    if payload.text.trim().is_empty() {
        return Err(ApiError::invalid("No text to translate"));
    }

    let result = state
        .orchestrator
        .translate(&payload.text, &payload.context, &model_choice(&payload.model))
        .await
        .map_err(|e| {
            warn!("Translation failed: {}", e);
            ApiError::from(e)
        })?;

    Ok(Json(result))
}

/// Chunks as `data` events, an `error` event on failure, then `done`
async fn translate_stream(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TranslateRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let chunks = state.orchestrator.translate_stream(
        &payload.text,
        &payload.context,
        &model_choice(&payload.model),
    );

    let events = chunks
        .map(|chunk| {
            Ok(match chunk {
                Ok(text) => Event::default().data(text),
                Err(e) => Event::default().event("error").data(e.to_string()),
            })
        })
        .chain(stream::once(async { Ok(Event::default().event("done").data("")) }));

    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn translate_batch(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<BatchTranslateRequest>,
) -> Result<Json<BatchTranslateResponse>, ApiError> {
    if payload.lines.is_empty() {
        return Err(ApiError::invalid("lines cannot be empty"));
    }

    let format = payload.format.unwrap_or_else(|| {
        payload
            .file_name
            .as_deref()
            .map(SubtitleFormat::from_file_name)
            .unwrap_or_default()
    });

    let key = payload
        .file_name
        .as_deref()
        .map(|name| progress_key_for_lines(name, &payload.lines));

    let completed = match (&key, payload.resume) {
        (Some(key), true) => {
            load_progress(state.orchestrator.store().as_ref(), key, payload.lines.len())
                .map(|p| p.lines)
                .unwrap_or_default()
        }
        _ => Vec::new(),
    };

    let request = BatchRequest {
        lines: payload.lines.clone(),
        context: payload.context,
        format,
        model: model_choice(&payload.model),
        completed,
        progress_key: key,
    };

    let report = state
        .orchestrator
        .translate_batch(request, &CancellationToken::new())
        .await;

    let (outcome, error) = match &report.outcome {
        BatchOutcome::Completed => ("completed", None),
        BatchOutcome::Cancelled => ("cancelled", None),
        BatchOutcome::Halted(e) => ("halted", Some(e.to_string())),
    };

    Ok(Json(BatchTranslateResponse {
        lines: report.merged(&payload.lines),
        completed_lines: report.completed_lines,
        total_lines: report.total_lines,
        chunks_sent: report.chunks_sent,
        final_chunk_size: report.final_chunk_size,
        outcome: outcome.to_string(),
        error,
    }))
}

/// Router over a shared orchestrator
pub fn router(orchestrator: Orchestrator) -> Router {
    let state = Arc::new(AppState { orchestrator });

    Router::new()
        .route("/", get(health_check))
        .route("/v1/metrics", get(get_metrics))
        .route("/v1/metrics/reset", post(reset_metrics))
        .route("/v1/reservoir", get(get_reservoir))
        .route("/v1/health/check", post(run_health_check))
        .route("/v1/translate", post(translate))
        .route("/v1/translate/stream", post(translate_stream))
        .route("/v1/translate/batch", post(translate_batch))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
}

/// Run the HTTP server
pub async fn run_server(config: OrchestratorConfig, host: String, port: u16) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;
    let app = router(orchestrator);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
