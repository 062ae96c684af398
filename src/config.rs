//! Runtime configuration for promptforge.
//!
//! Configuration is loaded from a YAML or JSON file (picked by extension),
//! then patched from `PROMPTFORGE_*` environment variables. Every section has
//! a `Default`, so a partial file or no file at all is valid.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::blender::ObjectType;
use crate::device::{self, Device, HardwareInfo};
use crate::invoker::BackendKind;
use crate::request::{GenerationRequest, ImageSize, OutputKind};
use crate::segment::MaskBackend;

/// File names searched in the working directory when `--config` is absent.
pub const LOCAL_CONFIG_FILES: [&str; 2] = ["promptforge.yaml", "promptforge.json"];

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "promptforge",
    version,
    about = "Prompt-to-asset pipeline: texture, depth, normal and mesh generation"
)]
pub struct Cli {
    /// Path to configuration file (YAML or JSON).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Generate assets from a text prompt.
    Generate(GenerateArgs),

    /// Derive depth, normal or mesh assets from an existing image.
    Process(ProcessArgs),

    /// Run every request listed in a YAML/JSON batch file.
    Batch(BatchArgs),

    /// Separate an image's foreground from its background.
    Segment(SegmentArgs),

    /// Serve the pipeline over HTTP.
    Serve(ServeArgs),

    /// List configured models and the models an Ollama server offers.
    Models,

    /// Show detected hardware and the effective configuration.
    Info,

    /// Write a default configuration file.
    Init(InitArgs),
}

/// Flags shared by every command that runs the pipeline.
#[derive(Args, Debug, Clone, Default)]
pub struct PipelineArgs {
    /// Output kinds, comma separated (texture, depth, normal, mesh).
    #[arg(short, long, value_delimiter = ',')]
    pub kind: Vec<OutputKind>,

    /// Produce every output kind.
    #[arg(long, conflicts_with = "kind")]
    pub all: bool,

    /// Image size as WIDTHxHEIGHT.
    #[arg(long)]
    pub size: Option<ImageSize>,

    /// Output directory (defaults to the configured one).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Force one backend for every stage it supports.
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub steps: Option<u32>,

    #[arg(long)]
    pub guidance: Option<f32>,

    /// Negative prompt.
    #[arg(long)]
    pub negative: Option<String>,

    /// Model identifier for the texture stage.
    #[arg(long)]
    pub model: Option<String>,

    #[arg(long, value_enum)]
    pub device: Option<Device>,

    /// Also write a Blender scene script for the bundle.
    #[arg(long)]
    pub scene_script: bool,

    /// Render the scene with Blender (implies --scene-script).
    #[arg(long)]
    pub render: bool,

    /// Primitive used for the Blender scene and mesh stage.
    #[arg(long, value_enum)]
    pub object: Option<ObjectType>,

    /// Print the export report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl PipelineArgs {
    /// Kinds selected on the command line, or `fallback` when none were.
    pub fn kinds(&self, fallback: &[OutputKind]) -> Vec<OutputKind> {
        if self.all {
            OutputKind::ALL.to_vec()
        } else if self.kind.is_empty() {
            fallback.to_vec()
        } else {
            self.kind.clone()
        }
    }

    /// Build a request from these flags on top of the configured defaults.
    pub fn build_request(
        &self,
        prompt: String,
        defaults: &GenerationConfig,
        fallback_kinds: &[OutputKind],
    ) -> GenerationRequest {
        let mut request = GenerationRequest::new(prompt)
            .with_kinds(self.kinds(fallback_kinds))
            .with_size(self.size.unwrap_or(defaults.size))
            .with_seed(self.seed);
        request.steps = self.steps.unwrap_or(defaults.steps);
        request.guidance_scale = self.guidance.unwrap_or(defaults.guidance_scale);
        request.negative_prompt = self
            .negative
            .clone()
            .or_else(|| defaults.negative_prompt.clone());
        request.model = self.model.clone();
        request
    }
}

#[derive(Args, Debug, Clone)]
pub struct GenerateArgs {
    /// Text prompt.
    pub prompt: String,

    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Rewrite the prompt through Ollama first.
    #[arg(long)]
    pub enhance: bool,

    /// Run the request this many times, incrementing the seed each time.
    #[arg(long, default_value_t = NonZeroU32::MIN)]
    pub count: NonZeroU32,
}

#[derive(Args, Debug, Clone)]
pub struct ProcessArgs {
    /// Existing image used as the texture.
    pub input: PathBuf,

    /// Prompt passed to backends that take one (e.g. depth models).
    #[arg(long, default_value = "")]
    pub prompt: String,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    /// Batch file (YAML or JSON).
    pub file: PathBuf,

    /// Output directory (defaults to the configured one).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Force one backend for every stage it supports.
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Repeat every entry this many times, incrementing the seed.
    #[arg(long)]
    pub count: Option<NonZeroU32>,

    /// Print the batch summary as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SegmentArgs {
    /// Image to segment.
    pub input: PathBuf,

    /// Output directory (defaults to the configured one).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Where the raw mask comes from.
    #[arg(long, value_enum)]
    pub backend: Option<MaskBackend>,

    /// Keep the thresholded mask without morphological cleanup.
    #[arg(long)]
    pub no_clean: bool,

    /// Write only the mask.
    #[arg(long)]
    pub mask_only: bool,

    #[arg(long, value_enum)]
    pub device: Option<Device>,

    /// Print the report as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// HTTP listen address (defaults to the configured one).
    #[arg(long)]
    pub listen: Option<String>,

    /// Force one backend for every stage it supports.
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,
}

#[derive(Args, Debug, Clone)]
pub struct InitArgs {
    /// Where to write the file.
    #[arg(default_value = "promptforge.yaml")]
    pub path: PathBuf,

    /// Overwrite an existing file.
    #[arg(long)]
    pub force: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device handed to backends (`auto` resolves against the host).
    pub device: Device,

    /// On Apple silicon, resolve `auto` to mlx rather than mps.
    pub prefer_mlx: bool,

    /// Root of the exported output tree.
    pub output_dir: PathBuf,

    pub generation: GenerationConfig,

    pub models: ModelsConfig,

    pub backends: BackendsConfig,

    pub remote: RemoteConfig,

    pub commands: CommandsConfig,

    pub normal: NormalConfig,

    pub blender: BlenderConfig,

    pub segment: SegmentConfig,

    pub ollama: OllamaConfig,

    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: Device::Auto,
            prefer_mlx: true,
            output_dir: PathBuf::from("outputs"),
            generation: GenerationConfig::default(),
            models: ModelsConfig::default(),
            backends: BackendsConfig::default(),
            remote: RemoteConfig::default(),
            commands: CommandsConfig::default(),
            normal: NormalConfig::default(),
            blender: BlenderConfig::default(),
            segment: SegmentConfig::default(),
            ollama: OllamaConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Request defaults applied when the caller does not say otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub size: ImageSize,
    pub steps: u32,
    pub guidance_scale: f32,
    pub negative_prompt: Option<String>,
    pub kinds: Vec<OutputKind>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            size: ImageSize::square(512),
            steps: 20,
            guidance_scale: 7.5,
            negative_prompt: None,
            kinds: vec![OutputKind::Texture],
        }
    }
}

/// Model identifier per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub texture: String,
    pub depth: String,
    pub normal: String,
    pub mesh: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            texture: "runwayml/stable-diffusion-v1-5".to_string(),
            depth: "MiDaS_small".to_string(),
            normal: "sobel".to_string(),
            mesh: "blender".to_string(),
        }
    }
}

impl ModelsConfig {
    pub fn for_kind(&self, kind: OutputKind) -> &str {
        match kind {
            OutputKind::Texture => &self.texture,
            OutputKind::Depth => &self.depth,
            OutputKind::Normal => &self.normal,
            OutputKind::Mesh => &self.mesh,
        }
    }
}

/// Backend per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    pub texture: BackendKind,
    pub depth: BackendKind,
    pub normal: BackendKind,
    pub mesh: BackendKind,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            texture: BackendKind::Remote,
            depth: BackendKind::Remote,
            normal: BackendKind::Sobel,
            mesh: BackendKind::Blender,
        }
    }
}

impl BackendsConfig {
    pub fn for_kind(&self, kind: OutputKind) -> BackendKind {
        match kind {
            OutputKind::Texture => self.texture,
            OutputKind::Depth => self.depth,
            OutputKind::Normal => self.normal,
            OutputKind::Mesh => self.mesh,
        }
    }

    pub fn set(&mut self, kind: OutputKind, backend: BackendKind) {
        match kind {
            OutputKind::Texture => self.texture = backend,
            OutputKind::Depth => self.depth = backend,
            OutputKind::Normal => self.normal = backend,
            OutputKind::Mesh => self.mesh = backend,
        }
    }
}

/// Remote generation server (SDXL-Studio compatible `/api/generate`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:7860".to_string(),
            timeout_secs: 300,
        }
    }
}

/// Subprocess argv templates per stage. An empty list means no command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub texture: Vec<String>,
    pub depth: Vec<String>,
    pub normal: Vec<String>,
    pub mesh: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            texture: Vec::new(),
            depth: Vec::new(),
            normal: Vec::new(),
            mesh: Vec::new(),
            timeout_secs: 600,
        }
    }
}

impl CommandsConfig {
    pub fn template(&self, kind: OutputKind) -> Option<&[String]> {
        let argv = match kind {
            OutputKind::Texture => &self.texture,
            OutputKind::Depth => &self.depth,
            OutputKind::Normal => &self.normal,
            OutputKind::Mesh => &self.mesh,
        };
        (!argv.is_empty()).then_some(argv.as_slice())
    }
}

/// Background segmentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    pub backend: MaskBackend,
    /// Argv template for the command backend; placeholders
    /// `{input} {output} {model} {device}`.
    pub command: Vec<String>,
    pub model: String,
    /// Mask values at or above this are foreground.
    pub threshold: u8,
    /// Border backend: largest per-channel distance still counted as
    /// background.
    pub tolerance: u8,
    /// Edge of the square close/open kernel.
    pub kernel: u32,
    pub clean: bool,
    /// Also write the image with its background removed.
    pub remove_background: bool,
    pub timeout_secs: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            backend: MaskBackend::Border,
            command: Vec::new(),
            model: "deeplabv3_resnet50".to_string(),
            threshold: 128,
            tolerance: 48,
            kernel: 5,
            clean: true,
            remove_background: true,
            timeout_secs: 600,
        }
    }
}

/// Normal-map derivation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalConfig {
    pub strength: f32,
    /// Gaussian blur radius applied to depth first; 0 disables it.
    pub blur_radius: u32,
}

impl Default for NormalConfig {
    fn default() -> Self {
        Self {
            strength: 1.0,
            blur_radius: 0,
        }
    }
}

/// Blender executable and scene settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlenderConfig {
    pub executable: PathBuf,
    pub timeout_secs: u64,
    pub object: ObjectType,
    pub subdivision_levels: u32,
    /// Displace modifier strength applied with the depth map.
    pub displacement_strength: f32,
    pub resolution: u32,
    pub samples: u32,
}

impl Default for BlenderConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("blender"),
            timeout_secs: 120,
            object: ObjectType::Cube,
            subdivision_levels: 3,
            displacement_strength: 0.3,
            resolution: 1024,
            samples: 128,
        }
    }
}

/// Ollama server used for prompt enhancement and model listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:11434".to_string(),
            model: "llama3.2".to_string(),
            timeout_secs: 60,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:7860").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7860".to_string(),
        }
    }
}

impl Config {
    /// Find the configuration file to use.
    ///
    /// An explicit path always wins, even if it does not exist (so that
    /// `load` can warn about it). Otherwise the working directory and
    /// `~/.promptforge/config.yaml` are searched.
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        LOCAL_CONFIG_FILES
            .iter()
            .map(PathBuf::from)
            .chain(dirs::home_dir().map(|h| h.join(".promptforge").join("config.yaml")))
            .find(|p| p.is_file())
    }

    /// Load configuration from a YAML or JSON file, falling back to defaults
    /// when the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config = if is_json(path) {
                serde_json::from_str(&data)
                    .with_context(|| format!("parsing {}", path.display()))?
            } else {
                serde_yaml::from_str(&data)
                    .with_context(|| format!("parsing {}", path.display()))?
            };
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Locate, load and apply environment overrides in one step.
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match Self::locate(explicit) {
            Some(path) => Self::load(&path)?,
            None => {
                tracing::debug!("No config file found, using defaults");
                Config::default()
            }
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `PROMPTFORGE_*` overrides using `get` to read variables.
    pub fn apply_env_from<F>(&mut self, get: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(device) = get("PROMPTFORGE_DEVICE") {
            self.device = device
                .parse()
                .map_err(|e: String| anyhow::anyhow!("PROMPTFORGE_DEVICE: {e}"))?;
        }
        if let Some(dir) = get("PROMPTFORGE_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(url) = get("PROMPTFORGE_REMOTE_URL") {
            self.remote.url = url;
        }
        if let Some(url) = get("PROMPTFORGE_OLLAMA_URL") {
            self.ollama.url = url;
        }
        if let Some(model) = get("PROMPTFORGE_OLLAMA_MODEL") {
            self.ollama.model = model;
        }
        if let Some(exe) = get("PROMPTFORGE_BLENDER") {
            self.blender.executable = PathBuf::from(exe);
        }
        Ok(())
    }

    /// Write this configuration, as JSON for `.json` paths and YAML otherwise.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let data = if is_json(path) {
            serde_json::to_string_pretty(self)?
        } else {
            serde_yaml::to_string(self)?
        };
        std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Device handed to backends, with `auto` resolved against this host.
    pub fn resolved_device(&self) -> Device {
        device::resolve(self.device, &HardwareInfo::detect(), self.prefer_mlx)
    }

    /// Route every stage the given backend supports to it.
    pub fn override_backend(&mut self, backend: BackendKind) {
        for kind in OutputKind::ALL {
            if backend.supports(kind, &self.commands) {
                self.backends.set(kind, backend);
            }
        }
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.generation.steps, 20);
        assert_eq!(cfg.generation.guidance_scale, 7.5);
        assert_eq!(cfg.models.texture, "runwayml/stable-diffusion-v1-5");
        assert_eq!(cfg.backends.normal, BackendKind::Sobel);
        assert_eq!(cfg.blender.timeout_secs, 120);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("promptforge.yaml");
        std::fs::write(
            &path,
            "device: cpu\nbackends:\n  texture: mock\nnormal:\n  strength: 2.5\n",
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.device, Device::Cpu);
        assert_eq!(cfg.backends.texture, BackendKind::Mock);
        assert_eq!(cfg.backends.depth, BackendKind::Remote);
        assert_eq!(cfg.normal.strength, 2.5);
        assert_eq!(cfg.normal.blur_radius, 0);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/promptforge.yaml")).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn test_save_and_load_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cfg.json");
        let mut cfg = Config::default();
        cfg.remote.url = "http://gpu-box:7860".into();
        cfg.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.remote.url, "http://gpu-box:7860");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PROMPTFORGE_DEVICE", "cuda"),
            ("PROMPTFORGE_OUTPUT_DIR", "/tmp/out"),
            ("PROMPTFORGE_BLENDER", "/opt/blender/blender"),
        ]);
        let mut cfg = Config::default();
        cfg.apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.device, Device::Cuda);
        assert_eq!(cfg.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(cfg.blender.executable, PathBuf::from("/opt/blender/blender"));
        assert_eq!(cfg.remote.url, RemoteConfig::default().url);
    }

    #[test]
    fn test_bad_env_device_is_an_error() {
        let mut cfg = Config::default();
        let result = cfg.apply_env_from(|k| (k == "PROMPTFORGE_DEVICE").then(|| "tpu".into()));
        assert!(result.is_err());
    }

    #[test]
    fn test_override_backend_only_where_supported() {
        let mut cfg = Config::default();
        cfg.override_backend(BackendKind::Mock);
        assert_eq!(cfg.backends.texture, BackendKind::Mock);
        assert_eq!(cfg.backends.depth, BackendKind::Mock);
        assert_eq!(cfg.backends.normal, BackendKind::Sobel);
        assert_eq!(cfg.backends.mesh, BackendKind::Mock);
    }

    #[test]
    fn test_cli_kind_list() {
        let cli = Cli::try_parse_from([
            "promptforge",
            "generate",
            "rusty metal",
            "--kind",
            "texture,normal",
            "--size",
            "256x512",
        ])
        .unwrap();
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        let req = args.pipeline.build_request(
            args.prompt.clone(),
            &GenerationConfig::default(),
            &[OutputKind::Texture],
        );
        assert!(req.kinds.contains(&OutputKind::Normal));
        assert_eq!(req.size, ImageSize::new(256, 512));
        assert_eq!(req.steps, 20);
    }

    #[test]
    fn test_cli_count_must_be_positive() {
        for argv in [
            &["promptforge", "generate", "x", "--count", "0"][..],
            &["promptforge", "batch", "b.yaml", "--count", "0"][..],
        ] {
            assert!(Cli::try_parse_from(argv).is_err(), "{argv:?}");
        }

        let cli = Cli::try_parse_from(["promptforge", "generate", "x"]).unwrap();
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        assert_eq!(args.count.get(), 1);
    }

    #[test]
    fn test_cli_segment_flags() {
        let cli = Cli::try_parse_from([
            "promptforge",
            "segment",
            "photo.jpg",
            "--backend",
            "command",
            "--no-clean",
            "--mask-only",
        ])
        .unwrap();
        let Command::Segment(args) = cli.command else {
            panic!("expected segment");
        };
        assert_eq!(args.input, PathBuf::from("photo.jpg"));
        assert_eq!(args.backend, Some(MaskBackend::Command));
        assert!(args.no_clean && args.mask_only);
    }

    #[test]
    fn test_segment_section_from_yaml() {
        let cfg: Config = serde_yaml::from_str(
            "segment:\n  backend: command\n  command: [segment-bg, '{input}', '{output}']\n  kernel: 3\n",
        )
        .unwrap();
        assert_eq!(cfg.segment.backend, MaskBackend::Command);
        assert_eq!(cfg.segment.command[1], "{input}");
        assert_eq!(cfg.segment.kernel, 3);
        assert_eq!(cfg.segment.threshold, 128);
    }

    #[test]
    fn test_cli_rejects_unknown_kind() {
        let result = Cli::try_parse_from(["promptforge", "generate", "x", "--kind", "audio"]);
        assert!(result.is_err());
    }
}
