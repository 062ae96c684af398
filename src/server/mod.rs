//! HTTP server exposing the pipeline.
//!
//! - [`api`]: route handlers and their JSON types
//! - [`streaming`]: SSE progress for `POST /api/generate/stream`

pub mod api;
pub mod streaming;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::export::{ExportError, ExportOptions};
use crate::invoker::ollama::OllamaClient;
use crate::metrics::Metrics;
use crate::pipeline::{Router, RouterError};
use crate::protocol::{GenerateResponse, ProtocolError};

/// Application state shared across handlers.
pub struct AppState {
    /// One request in the pipeline at a time.
    pub router: Mutex<Router>,
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
    pub ollama: Option<OllamaClient>,
    pub output_dir: PathBuf,
    pub export: ExportOptions,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(router: Router, config: Arc<Config>, metrics: Arc<Metrics>) -> Self {
        let output_dir = config.output_dir.clone();
        let export = ExportOptions {
            blender: config.blender.clone(),
            ..Default::default()
        };
        Self {
            router: Mutex::new(router),
            config,
            metrics,
            ollama: None,
            output_dir,
            export,
            start_time: Instant::now(),
        }
    }

    pub fn with_ollama(mut self, client: OllamaClient) -> Self {
        self.ollama = Some(client);
        self
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/health", get(api::health))
        .route("/metrics", get(api::metrics))
        .route("/api/models", get(api::list_models))
        .route("/api/generate", post(api::generate))
        .route("/api/generate/stream", post(api::generate_stream))
        .route("/api/outputs/{*path}", get(api::output_file))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error reply: a status code and a `{success: false, error}` body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(GenerateResponse::failure(self.message))).into_response()
    }
}

impl From<RouterError> for ApiError {
    fn from(e: RouterError) -> Self {
        let status = if e.is_client_error() {
            StatusCode::BAD_REQUEST
        } else if e.is_backend_error() {
            StatusCode::BAD_GATEWAY
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self::new(status, e.to_string())
    }
}

impl From<ExportError> for ApiError {
    fn from(e: ExportError) -> Self {
        match e {
            ExportError::Blender(_) | ExportError::NoRender(_) => Self::new(StatusCode::BAD_GATEWAY, e.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}

/// Unreadable bodies and unknown field values are client errors.
impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::bad_request(e.body_text())
    }
}

impl From<ProtocolError> for ApiError {
    fn from(e: ProtocolError) -> Self {
        Self::bad_request(e.to_string())
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        Self::internal(e.to_string())
    }
}
