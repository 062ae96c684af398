//! Model invokers: one call into an external backend per pipeline stage.
//!
//! - [`remote`]: HTTP generation server (`/api/generate`)
//! - [`command`]: subprocess per stage from an argv template
//! - [`blender`]: mesh stage through headless Blender
//! - [`normal`]: normal map derived natively from depth
//! - [`mock`]: deterministic offline placeholders
//! - [`ollama`]: prompt enhancement client (not a stage backend)

pub mod blender;
pub mod command;
pub mod mock;
pub mod normal;
pub mod ollama;
pub mod remote;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::blender::BlenderError;
use crate::config::{BackendsConfig, CommandsConfig, Config, ModelsConfig};
use crate::device::Device;
use crate::protocol::ProtocolError;
use crate::request::{GenerationRequest, OutputKind};

#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("backend '{backend}' cannot produce {kind} output")]
    Unsupported { kind: OutputKind, backend: BackendKind },

    #[error("{kind} stage needs a {needed} input that was not produced")]
    MissingInput { kind: OutputKind, needed: OutputKind },

    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("backend reported failure: {0}")]
    Backend(String),

    #[error("backend reply contains no {0} output")]
    MissingOutput(OutputKind),

    #[error("command '{program}' exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("command '{program}' finished but did not write {}", path.display())]
    NoOutputFile { program: String, path: PathBuf },

    #[error("command '{program}' timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    #[error(transparent)]
    Blender(#[from] BlenderError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which external (or native) backend serves a stage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// HTTP generation server.
    Remote,
    /// Configured subprocess.
    Command,
    /// Offline placeholders.
    Mock,
    /// Normal map from depth gradients.
    Sobel,
    /// Headless Blender.
    Blender,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Remote => "remote",
            BackendKind::Command => "command",
            BackendKind::Mock => "mock",
            BackendKind::Sobel => "sobel",
            BackendKind::Blender => "blender",
        }
    }

    /// Static capability table. `command` supports whatever has a template.
    pub fn supports(self, kind: OutputKind, commands: &CommandsConfig) -> bool {
        match self {
            BackendKind::Remote => true,
            BackendKind::Command => commands.template(kind).is_some(),
            BackendKind::Mock => matches!(
                kind,
                OutputKind::Texture | OutputKind::Depth | OutputKind::Mesh
            ),
            BackendKind::Sobel => kind == OutputKind::Normal,
            BackendKind::Blender => kind == OutputKind::Mesh,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a stage needs to run.
#[derive(Debug, Clone, Copy)]
pub struct StageInput<'a> {
    pub request: &'a GenerationRequest,
    /// Prompt after optional enhancement.
    pub prompt: &'a str,
    pub model: &'a str,
    pub device: Device,
    /// Files produced by earlier stages of this request.
    pub upstream: &'a BTreeMap<OutputKind, PathBuf>,
    /// Staging directory the stage writes into.
    pub work_dir: &'a Path,
}

impl<'a> StageInput<'a> {
    /// Output of an earlier stage, or `MissingInput`.
    pub fn upstream(&self, kind: OutputKind, needed: OutputKind) -> Result<&'a Path, InvokeError> {
        self.upstream
            .get(&needed)
            .map(PathBuf::as_path)
            .ok_or(InvokeError::MissingInput { kind, needed })
    }

    /// Where a stage should write its file.
    pub fn output_path(&self, kind: OutputKind, extension: &str) -> PathBuf {
        self.work_dir.join(format!("{kind}.{extension}"))
    }

    /// Seed for this request; prompt-derived when none was given.
    pub fn seed(&self) -> u64 {
        self.request
            .seed
            .unwrap_or_else(|| mock::prompt_seed(self.prompt))
    }
}

/// A backend that can produce one or more output kinds.
#[async_trait]
pub trait Invoker: Send + Sync {
    fn backend(&self) -> BackendKind;

    fn supports(&self, kind: OutputKind) -> bool;

    /// Run one stage and return the path of the file it wrote.
    async fn invoke(&self, kind: OutputKind, input: &StageInput<'_>) -> Result<PathBuf, InvokeError>;
}

/// The model a stage is currently bound to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHandle {
    pub kind: OutputKind,
    pub model: String,
    pub backend: BackendKind,
    pub loaded_at: DateTime<Utc>,
}

/// Model handles by stage. Filled on first use, swapped when a request names
/// a different model. Nothing is ever evicted.
#[derive(Debug, Default)]
pub struct ModelSlots {
    slots: RwLock<HashMap<OutputKind, ModelHandle>>,
}

impl ModelSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `kind` to `model`, returning the handle in effect.
    pub async fn ensure(&self, kind: OutputKind, model: &str, backend: BackendKind) -> ModelHandle {
        {
            let slots = self.slots.read().await;
            if let Some(handle) = slots.get(&kind) {
                if handle.model == model && handle.backend == backend {
                    return handle.clone();
                }
            }
        }

        let mut slots = self.slots.write().await;
        let handle = ModelHandle {
            kind,
            model: model.to_string(),
            backend,
            loaded_at: Utc::now(),
        };
        match slots.insert(kind, handle.clone()) {
            Some(previous) => info!(
                kind = %kind,
                from = %previous.model,
                to = %model,
                backend = %backend,
                "Swapped model"
            ),
            None => info!(kind = %kind, model = %model, backend = %backend, "Loaded model"),
        }
        handle
    }

    /// All handles in pipeline order.
    pub async fn snapshot(&self) -> Vec<ModelHandle> {
        let slots = self.slots.read().await;
        let mut handles: Vec<ModelHandle> = slots.values().cloned().collect();
        handles.sort_by_key(|h| h.kind);
        handles
    }
}

/// The configured invoker for every stage.
pub struct InvokerSet {
    routes: BTreeMap<OutputKind, BackendKind>,
    invokers: HashMap<BackendKind, Arc<dyn Invoker>>,
    models: ModelsConfig,
    device: Device,
    slots: ModelSlots,
}

impl InvokerSet {
    /// Build every backend the configuration can describe.
    pub fn from_config(config: &Config) -> Result<Self, InvokeError> {
        let device = config.resolved_device();
        let remote = remote::RemoteInvoker::new(&config.remote.url, config.remote.timeout_secs)?;
        let invokers: Vec<Arc<dyn Invoker>> = vec![
            Arc::new(remote.with_device(device)),
            Arc::new(command::CommandInvoker::new(config.commands.clone())),
            Arc::new(mock::MockInvoker::new()),
            Arc::new(normal::SobelInvoker::new(config.normal.clone())),
            Arc::new(blender::BlenderMeshInvoker::from_config(&config.blender)),
        ];

        let mut set = Self::empty(config.models.clone(), device);
        for kind in OutputKind::ALL {
            set.routes.insert(kind, config.backends.for_kind(kind));
        }
        for invoker in invokers {
            set.invokers.insert(invoker.backend(), invoker);
        }
        Ok(set)
    }

    /// A set with no backends, routed like the default configuration.
    pub fn empty(models: ModelsConfig, device: Device) -> Self {
        let defaults = BackendsConfig::default();
        Self {
            routes: OutputKind::ALL
                .into_iter()
                .map(|kind| (kind, defaults.for_kind(kind)))
                .collect(),
            invokers: HashMap::new(),
            models,
            device,
            slots: ModelSlots::new(),
        }
    }

    /// Register (or replace) the invoker for its backend kind.
    pub fn with_invoker(mut self, invoker: Arc<dyn Invoker>) -> Self {
        self.invokers.insert(invoker.backend(), invoker);
        self
    }

    /// Route `kind` to `backend`.
    pub fn route(mut self, kind: OutputKind, backend: BackendKind) -> Self {
        self.routes.insert(kind, backend);
        self
    }

    pub fn backend_for(&self, kind: OutputKind) -> BackendKind {
        self.routes
            .get(&kind)
            .copied()
            .unwrap_or_else(|| BackendsConfig::default().for_kind(kind))
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Model a stage runs with: the request's override applies to texture.
    pub fn model_for(&self, kind: OutputKind, request: &GenerationRequest) -> String {
        match (&request.model, kind) {
            (Some(model), OutputKind::Texture) => model.clone(),
            _ => self.models.for_kind(kind).to_string(),
        }
    }

    /// The invoker for `kind`, or `Unsupported` if none can serve it.
    pub fn check(&self, kind: OutputKind) -> Result<&Arc<dyn Invoker>, InvokeError> {
        let backend = self.backend_for(kind);
        match self.invokers.get(&backend) {
            Some(invoker) if invoker.supports(kind) => Ok(invoker),
            _ => Err(InvokeError::Unsupported { kind, backend }),
        }
    }

    /// Run one stage through its configured backend.
    pub async fn invoke(
        &self,
        kind: OutputKind,
        request: &GenerationRequest,
        prompt: &str,
        upstream: &BTreeMap<OutputKind, PathBuf>,
        work_dir: &Path,
    ) -> Result<PathBuf, InvokeError> {
        let invoker = self.check(kind)?;
        let model = self.model_for(kind, request);
        self.slots.ensure(kind, &model, invoker.backend()).await;

        let input = StageInput {
            request,
            prompt,
            model: &model,
            device: self.device,
            upstream,
            work_dir,
        };
        invoker.invoke(kind, &input).await
    }

    pub async fn loaded_models(&self) -> Vec<ModelHandle> {
        self.slots.snapshot().await
    }
}
