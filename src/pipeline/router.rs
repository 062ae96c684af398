//! Request router.
//!
//! A request runs as one sequential chain: required stages (requested kinds
//! plus their dependencies) execute in the order texture → depth → normal →
//! mesh, each receiving the files of the stages before it. Every stage is
//! checked for a capable backend before anything runs, and the first failing
//! stage aborts the request.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::bundle::AssetBundle;
use crate::invoker::ollama::OllamaClient;
use crate::invoker::{BackendKind, InvokeError, InvokerSet};
use crate::metrics::Metrics;
use crate::request::{GenerationRequest, OutputKind, RequestError};

#[derive(Error, Debug)]
pub enum RouterError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("unsupported output kind: no backend for {kind} (configured backend '{backend}' cannot produce it)")]
    UnsupportedKind { kind: OutputKind, backend: BackendKind },

    #[error("{kind} stage failed: {source}")]
    Stage {
        kind: OutputKind,
        #[source]
        source: InvokeError,
    },

    #[error("prompt enhancement failed: {0}")]
    Enhance(#[source] InvokeError),

    #[error("cannot read source image {}: {source}", path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bundle is missing {0} output")]
    Incomplete(OutputKind),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RouterError {
    /// Whether the caller's request, rather than a backend, is at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RouterError::Request(_) | RouterError::UnsupportedKind { .. } | RouterError::Source { .. }
        )
    }

    /// Whether an external backend failed.
    pub fn is_backend_error(&self) -> bool {
        matches!(self, RouterError::Stage { .. } | RouterError::Enhance(_))
    }
}

/// Progress of a request, in the order it happens.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    PromptEnhanced { prompt: String },
    StageStarted { kind: OutputKind, backend: String },
    StageCompleted { kind: OutputKind, elapsed_ms: u64 },
    StageFailed { kind: OutputKind, error: String },
    Completed { id: Uuid, kinds: Vec<OutputKind> },
}

pub struct Router {
    invokers: InvokerSet,
    ollama: Option<OllamaClient>,
    metrics: Option<Arc<Metrics>>,
}

impl Router {
    pub fn new(invokers: InvokerSet) -> Self {
        Self {
            invokers,
            ollama: None,
            metrics: None,
        }
    }

    /// Enable `enhance_prompt` through this client.
    pub fn with_ollama(mut self, client: OllamaClient) -> Self {
        self.ollama = Some(client);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn invokers(&self) -> &InvokerSet {
        &self.invokers
    }

    /// Validate `request` and return the stages it needs, failing if any
    /// stage has no capable backend.
    pub fn preflight(&self, request: &GenerationRequest) -> Result<BTreeSet<OutputKind>, RouterError> {
        request.validate()?;
        let stages = request.required_stages();
        for &kind in &stages {
            if kind == OutputKind::Texture && request.source.is_some() {
                continue;
            }
            self.invokers.check(kind).map_err(|e| match e {
                InvokeError::Unsupported { kind, backend } => RouterError::UnsupportedKind { kind, backend },
                other => RouterError::Stage { kind, source: other },
            })?;
        }
        Ok(stages)
    }

    /// Run `request` to completion.
    pub async fn route(&self, request: GenerationRequest) -> Result<AssetBundle, RouterError> {
        self.route_with_events(request, None).await
    }

    /// Run `request`, reporting progress on `events` when given.
    pub async fn route_with_events(
        &self,
        request: GenerationRequest,
        events: Option<&mpsc::Sender<PipelineEvent>>,
    ) -> Result<AssetBundle, RouterError> {
        let result = self.run(request, events).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_request(result.is_ok());
        }
        match &result {
            Ok(bundle) => info!(
                id = %bundle.id,
                kinds = ?bundle.files.keys().collect::<Vec<_>>(),
                total_ms = bundle.total_ms(),
                "Request complete"
            ),
            Err(e) => error!(error = %e, "Request failed"),
        }
        result
    }

    async fn run(
        &self,
        request: GenerationRequest,
        events: Option<&mpsc::Sender<PipelineEvent>>,
    ) -> Result<AssetBundle, RouterError> {
        let stages = self.preflight(&request)?;
        info!(
            prompt = %request.prompt,
            stages = ?stages,
            size = %request.size,
            seed = ?request.seed,
            "Routing request"
        );

        let prompt_used = self.prompt_for(&request, events).await?;
        let staging = tempfile::Builder::new().prefix("promptforge-").tempdir()?;
        let mut upstream: BTreeMap<OutputKind, PathBuf> = BTreeMap::new();
        let mut timings_ms = BTreeMap::new();

        for kind in stages {
            let backend = match (&request.source, kind) {
                (Some(_), OutputKind::Texture) => "source".to_string(),
                _ => self.invokers.backend_for(kind).to_string(),
            };
            emit(events, PipelineEvent::StageStarted { kind, backend: backend.clone() }).await;
            debug!(kind = %kind, backend = %backend, "Stage started");

            let start = Instant::now();
            let result = match (&request.source, kind) {
                (Some(source), OutputKind::Texture) => copy_source(source, staging.path()).await,
                _ => self
                    .invokers
                    .invoke(kind, &request, &prompt_used, &upstream, staging.path())
                    .await
                    .map_err(|source| RouterError::Stage { kind, source }),
            };
            let elapsed = start.elapsed();
            if let Some(metrics) = &self.metrics {
                metrics.record_stage(kind, result.is_ok(), elapsed.as_secs_f64());
            }

            match result {
                Ok(path) => {
                    let elapsed_ms = elapsed.as_millis() as u64;
                    info!(kind = %kind, backend = %backend, elapsed_ms, path = %path.display(), "Stage complete");
                    emit(events, PipelineEvent::StageCompleted { kind, elapsed_ms }).await;
                    timings_ms.insert(kind, elapsed_ms);
                    upstream.insert(kind, path);
                }
                Err(e) => {
                    emit(
                        events,
                        PipelineEvent::StageFailed {
                            kind,
                            error: e.to_string(),
                        },
                    )
                    .await;
                    return Err(e);
                }
            }
        }

        let (files, intermediates): (BTreeMap<_, _>, BTreeMap<_, _>) = upstream
            .into_iter()
            .partition(|(kind, _)| request.kinds.contains(kind));
        let bundle = AssetBundle::new(request, prompt_used, files, timings_ms, Some(staging))
            .with_intermediates(intermediates);
        if let Some(&kind) = bundle.missing().first() {
            return Err(RouterError::Incomplete(kind));
        }

        emit(
            events,
            PipelineEvent::Completed {
                id: bundle.id,
                kinds: bundle.files.keys().copied().collect(),
            },
        )
        .await;
        Ok(bundle)
    }

    async fn prompt_for(
        &self,
        request: &GenerationRequest,
        events: Option<&mpsc::Sender<PipelineEvent>>,
    ) -> Result<String, RouterError> {
        if !request.enhance_prompt {
            return Ok(request.prompt.clone());
        }
        let Some(ollama) = &self.ollama else {
            warn!("Prompt enhancement requested but no Ollama client is configured");
            return Ok(request.prompt.clone());
        };
        let prompt = ollama
            .enhance(&request.prompt)
            .await
            .map_err(RouterError::Enhance)?;
        emit(events, PipelineEvent::PromptEnhanced { prompt: prompt.clone() }).await;
        Ok(prompt)
    }
}

async fn emit(events: Option<&mpsc::Sender<PipelineEvent>>, event: PipelineEvent) {
    if let Some(tx) = events {
        // A dropped receiver only means nobody is listening any more.
        let _ = tx.send(event).await;
    }
}

/// Texture stage for requests built on an existing image.
async fn copy_source(source: &Path, work_dir: &Path) -> Result<PathBuf, RouterError> {
    let ext = source
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_else(|| "png".to_string());
    let target = work_dir.join(format!("{}.{ext}", OutputKind::Texture));
    tokio::fs::copy(source, &target)
        .await
        .map_err(|e| RouterError::Source {
            path: source.to_path_buf(),
            source: e,
        })?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::config::ModelsConfig;
    use crate::device::Device;
    use crate::invoker::{Invoker, StageInput};

    /// Writes a one-line file per stage and counts calls.
    struct Recording {
        backend: BackendKind,
        kinds: Vec<OutputKind>,
        fail_on: Option<OutputKind>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Invoker for Recording {
        fn backend(&self) -> BackendKind {
            self.backend
        }

        fn supports(&self, kind: OutputKind) -> bool {
            self.kinds.contains(&kind)
        }

        async fn invoke(&self, kind: OutputKind, input: &StageInput<'_>) -> Result<PathBuf, InvokeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(kind) {
                return Err(InvokeError::Backend("model crashed".into()));
            }
            for dep in kind.dependencies() {
                input.upstream(kind, *dep)?;
            }
            let path = input.output_path(kind, "txt");
            std::fs::write(&path, format!("{kind}:{}", input.prompt))?;
            Ok(path)
        }
    }

    fn router(fail_on: Option<OutputKind>) -> (Router, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let invoker = Recording {
            backend: BackendKind::Remote,
            kinds: OutputKind::ALL.to_vec(),
            fail_on,
            calls: calls.clone(),
        };
        let mut set = InvokerSet::empty(ModelsConfig::default(), Device::Cpu).with_invoker(Arc::new(invoker));
        for kind in OutputKind::ALL {
            set = set.route(kind, BackendKind::Remote);
        }
        (Router::new(set), calls)
    }

    #[tokio::test]
    async fn test_bundle_holds_only_requested_kinds() {
        let (router, calls) = router(None);
        let req = GenerationRequest::new("lava").with_kinds([OutputKind::Normal]);
        let bundle = router.route(req).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(bundle.files.keys().copied().collect::<Vec<_>>(), vec![OutputKind::Normal]);
        assert_eq!(bundle.timings_ms.len(), 3);
        assert!(bundle.is_complete());
        let text = std::fs::read_to_string(bundle.file(OutputKind::Normal).unwrap()).unwrap();
        assert_eq!(text, "normal:lava");
    }

    #[tokio::test]
    async fn test_first_failure_aborts() {
        let (router, calls) = router(Some(OutputKind::Depth));
        let req = GenerationRequest::new("lava").with_kinds(OutputKind::ALL);
        let err = router.route(req).await.unwrap_err();
        assert!(matches!(err, RouterError::Stage { kind: OutputKind::Depth, .. }));
        assert!(err.is_backend_error());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_preflight_rejects_before_running() {
        let calls = Arc::new(AtomicUsize::new(0));
        let texture_only = Recording {
            backend: BackendKind::Remote,
            kinds: vec![OutputKind::Texture],
            fail_on: None,
            calls: calls.clone(),
        };
        let set = InvokerSet::empty(ModelsConfig::default(), Device::Cpu)
            .with_invoker(Arc::new(texture_only))
            .route(OutputKind::Texture, BackendKind::Remote)
            .route(OutputKind::Depth, BackendKind::Remote);
        let router = Router::new(set);

        let err = router
            .route(GenerationRequest::new("x").with_kinds([OutputKind::Depth]))
            .await
            .unwrap_err();
        match err {
            RouterError::UnsupportedKind { kind, backend } => {
                assert_eq!(kind, OutputKind::Depth);
                assert_eq!(backend, BackendKind::Remote);
            }
            other => panic!("expected UnsupportedKind, got {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_source_replaces_texture_stage() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("photo.PNG");
        std::fs::write(&source, b"pixels").unwrap();

        let (router, calls) = router(None);
        let req = GenerationRequest::new("")
            .with_source(&source)
            .with_kinds([OutputKind::Texture, OutputKind::Depth]);
        let bundle = router.route(req).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let texture = bundle.file(OutputKind::Texture).unwrap();
        assert_eq!(texture.extension().unwrap(), "png");
        assert_eq!(std::fs::read(texture).unwrap(), b"pixels");
    }

    #[tokio::test]
    async fn test_events_in_order() {
        let (router, _) = router(None);
        let (tx, mut rx) = mpsc::channel(16);
        let req = GenerationRequest::new("lava").with_kinds([OutputKind::Depth]);
        router.route_with_events(req, Some(&tx)).await.unwrap();
        drop(tx);

        let mut names = Vec::new();
        while let Some(event) = rx.recv().await {
            names.push(serde_json::to_value(&event).unwrap()["event"].as_str().unwrap().to_string());
        }
        assert_eq!(
            names,
            vec!["stage_started", "stage_completed", "stage_started", "stage_completed", "completed"]
        );
    }

    #[tokio::test]
    async fn test_invalid_request_is_client_error() {
        let (router, calls) = router(None);
        let err = router.route(GenerationRequest::new(" ")).await.unwrap_err();
        assert!(err.is_client_error());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
