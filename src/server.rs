//! HTTP server for the question-answering API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/` | Answer a question (`{ "question": ..., "image": ... }`) |
//! | `GET`  | `/` | Liveness check with loaded document counts |
//! | `GET`  | `/health` | Health check (version, LLM and store status) |
//!
//! The liveness endpoints never touch the LLM or OCR engine, so they keep
//! answering `200` while either is degraded.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `payload_too_large` (413),
//! `malformed_model_output` (502), `upstream_error` (502), `timeout` (504).

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::answer::AnswerService;
use crate::config::Config;
use crate::error::AnswerError;
use crate::llm::create_completer;
use crate::models::{Answer, Question};
use crate::ocr::create_extractor;
use crate::store::ContentStore;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    service: Arc<AnswerService>,
}

/// Wire the production answer service: load the content store from the
/// data directory, and build the OpenAI completer and OCR extractor.
///
/// Never fails. Missing content, a missing API key or a disabled OCR engine
/// all produce a service that answers in degraded mode.
pub fn build_service(config: &Config) -> Arc<AnswerService> {
    let store = Arc::new(ContentStore::load_or_empty(&config.data.dir));
    let completer = create_completer(&config.llm, std::env::var("OPENAI_API_KEY").ok());
    let extractor = create_extractor(&config.ocr);
    Arc::new(AnswerService::new(store, completer, extractor, config))
}

/// Starts the HTTP server with the production service wiring.
///
/// This is the entry point used by `tds-ta serve`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    run_server_with_service(config, build_service(config)).await
}

/// Starts the HTTP server around an already-built [`AnswerService`].
///
/// Binds to `[server].bind` and runs until Ctrl-C. Tests use this to serve
/// fake completers and synthetic content.
pub async fn run_server_with_service(
    config: &Config,
    service: Arc<AnswerService>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(config, service);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!("listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

/// Build the router with all routes and middleware.
pub fn router(config: &Config, service: Arc<AnswerService>) -> Router {
    let state = AppState {
        config: Arc::new(config.clone()),
        service,
    };

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/api", post(handle_answer))
        .route("/api/", post(handle_answer))
        .layer(DefaultBodyLimit::max(config.server.max_body_bytes))
        .layer(cors_layer(&config.server.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// Inner error detail with a machine-readable code and human-readable message.
#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Constructs a 400 Bad Request error.
fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<AnswerError> for AppError {
    fn from(err: AnswerError) -> Self {
        let status = match &err {
            AnswerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AnswerError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            AnswerError::MalformedModelOutput(_) | AnswerError::Upstream(_) => {
                StatusCode::BAD_GATEWAY
            }
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return AppError {
                status: StatusCode::PAYLOAD_TOO_LARGE,
                code: "payload_too_large".to_string(),
                message: rejection.body_text(),
            };
        }
        bad_request(rejection.body_text())
    }
}

// ============ GET / ============

#[derive(Serialize)]
struct RootResponse {
    message: String,
    status: String,
    course_content_loaded: usize,
    discourse_posts_loaded: usize,
}

async fn handle_root(State(state): State<AppState>) -> Json<RootResponse> {
    let (github, discourse) = state.service.store().counts();
    Json(RootResponse {
        message: "TDS Virtual Teaching Assistant API".to_string(),
        status: "running".to_string(),
        course_content_loaded: github,
        discourse_posts_loaded: discourse,
    })
}

// ============ GET /health ============

/// JSON response body for `GET /health`.
#[derive(Serialize)]
struct HealthResponse {
    /// Always `"healthy"` when the server is running.
    status: String,
    version: String,
    timestamp: String,
    openai_configured: bool,
    model: String,
    ocr_engine: String,
    store_status: String,
    course_content_count: usize,
    discourse_posts_count: usize,
}

/// Handler for `GET /health`.
///
/// Used by the container health check. Reports degradation in the body but
/// always returns `200` so a process that can still serve partial answers
/// is not restarted.
async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let service = &state.service;
    let (github, discourse) = service.store().counts();
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        openai_configured: service.completer().is_configured(),
        model: service.completer().model_name().to_string(),
        ocr_engine: service.extractor().name().to_string(),
        store_status: service.store().status().label().to_string(),
        course_content_count: github,
        discourse_posts_count: discourse,
    })
}

// ============ POST /api/ ============

/// Request body for `POST /api/`.
///
/// `question` is optional at the serde level so a missing field gets the
/// same 400 message as an empty one.
#[derive(Deserialize)]
struct AnswerRequest {
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    image: Option<String>,
}

/// Handler for `POST /api/`.
///
/// Returns `400` for malformed JSON or an empty question, `413` for bodies
/// over `server.max_body_bytes`, `504` when no answer is ready within
/// `server.answer_timeout_secs`, and `502` for unusable LLM responses.
async fn handle_answer(
    State(state): State<AppState>,
    payload: Result<Json<AnswerRequest>, JsonRejection>,
) -> Result<Json<Answer>, AppError> {
    let Json(request) = payload?;

    let text = request.question.unwrap_or_default();
    if text.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let question = Question {
        text,
        image: request.image.filter(|i| !i.trim().is_empty()),
    };

    let deadline =
        Instant::now() + Duration::from_secs(state.config.server.answer_timeout_secs);
    let answer = state.service.answer(&question, deadline).await?;

    Ok(Json(answer))
}
