//! Route handlers.
//!
//! - GET  /health
//! - GET  /metrics
//! - GET  /api/models
//! - POST /api/generate
//! - POST /api/generate/stream
//! - GET  /api/outputs/{*path}

use std::collections::BTreeMap;
use std::path::{Component, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::streaming::pipeline_to_sse_stream;
use super::{ApiError, AppState};
use crate::device::Device;
use crate::export::{self, MANIFESTS_DIR};
use crate::invoker::{BackendKind, ModelHandle};
use crate::pipeline::PipelineEvent;
use crate::protocol::{self, GenerateRequest, GenerateResponse, ImagePayload};
use crate::request::OutputKind;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub device: Device,
    /// A request is in the pipeline.
    pub busy: bool,
    pub backends: BTreeMap<OutputKind, BackendKind>,
}

#[derive(Debug, Serialize)]
pub struct StageModel {
    pub kind: OutputKind,
    pub model: String,
    pub backend: BackendKind,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub device: Device,
    pub stages: Vec<StageModel>,
    /// Models bound so far; absent while a request holds the pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded: Option<Vec<ModelHandle>>,
    /// Ollama tags, when a server is configured and reachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ollama: Option<Vec<String>>,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let backends = OutputKind::ALL
        .iter()
        .map(|&kind| (kind, state.config.backends.for_kind(kind)))
        .collect();
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        device: state.config.resolved_device(),
        busy: state.router.try_lock().is_err(),
        backends,
    })
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let stages = OutputKind::ALL
        .iter()
        .map(|&kind| StageModel {
            kind,
            model: state.config.models.for_kind(kind).to_string(),
            backend: state.config.backends.for_kind(kind),
        })
        .collect();

    let loaded = match state.router.try_lock() {
        Ok(router) => Some(router.invokers().loaded_models().await),
        Err(_) => None,
    };

    let ollama = match &state.ollama {
        Some(client) => match client.list_models().await {
            Ok(tags) => Some(tags),
            Err(e) => {
                warn!(error = %e, "Ollama unreachable");
                None
            }
        },
        None => None,
    };

    Json(ModelsResponse {
        device: state.config.resolved_device(),
        stages,
        loaded,
        ollama,
    })
}

pub async fn generate(
    State(state): State<Arc<AppState>>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let Json(body) = body?;
    run_generation(&state, body, None).await.map(Json)
}

/// Same as `generate`, reporting stage progress as SSE events and the
/// reply as a final `result` event.
pub async fn generate_stream(
    State(state): State<Arc<AppState>>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body?;
    let (tx, rx) = mpsc::channel(32);
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        let result = run_generation(&state, body, Some(&tx)).await;
        drop(tx);
        let response = result.unwrap_or_else(|e| GenerateResponse::failure(e.message));
        let _ = done_tx.send(response);
    });

    Ok(Sse::new(pipeline_to_sse_stream(rx, done_rx)).keep_alive(KeepAlive::default()))
}

/// Serve a file from the output tree.
pub async fn output_file(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let relative = PathBuf::from(&path);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(ApiError::bad_request(format!("invalid output path: {path}")));
    }

    let full = state.output_dir.join(&relative);
    if !full.is_file() {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("no such output: {path}"),
        ));
    }
    let bytes = tokio::fs::read(&full).await?;
    Ok(([(header::CONTENT_TYPE, protocol::mime_for_path(&full))], bytes).into_response())
}

/// Route one request, export it and inline the exported files.
pub async fn run_generation(
    state: &AppState,
    body: GenerateRequest,
    events: Option<&mpsc::Sender<PipelineEvent>>,
) -> Result<GenerateResponse, ApiError> {
    let start = Instant::now();
    let mut request = body.to_request();

    // Uploaded source images live until the bundle is exported.
    let mut _upload_dir = None;
    if let Some(data) = &body.image {
        let (mime, bytes) = protocol::decode_data_url(data)?;
        let dir = tempfile::Builder::new()
            .prefix("promptforge-upload-")
            .tempdir()?;
        let ext = protocol::extension_for_mime(&mime, OutputKind::Texture);
        let path = dir.path().join(format!("source.{ext}"));
        tokio::fs::write(&path, &bytes).await?;
        request = request.with_source(path);
        _upload_dir = Some(dir);
    }
    if let Some(device) = &body.device {
        debug!(requested = %device, "Ignoring client device, using configured device");
    }

    info!(
        prompt = %request.prompt,
        kinds = ?request.kinds,
        size = %request.size,
        source = request.source.is_some(),
        "Generate request"
    );

    let bundle = {
        let router = state.router.lock().await;
        router.route_with_events(request, events).await?
    };
    let report = export::export(&bundle, &state.output_dir, &state.export).await?;

    let mut images = Vec::with_capacity(report.files.len());
    for (&kind, path) in &report.files {
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        images.push(ImagePayload {
            kind: Some(kind),
            filepath: Some(format!("{}/{filename}", kind.dir_name())),
            data: protocol::encode_data_url(protocol::mime_for_path(path), &bytes),
            filename,
        });
    }

    let request = &bundle.request;
    Ok(GenerateResponse {
        success: true,
        id: Some(report.id.to_string()),
        images,
        generation_time: start.elapsed().as_secs_f64(),
        metadata: json!({
            "prompt": request.prompt,
            "prompt_used": report.prompt_used,
            "negative_prompt": request.negative_prompt,
            "size": request.size.to_string(),
            "seed": request.seed,
            "steps": request.steps,
            "guidance_scale": request.guidance_scale,
            "timings_ms": report.timings_ms,
            "manifest": format!("{MANIFESTS_DIR}/{}.json", report.stem),
        }),
        error: None,
    })
}
