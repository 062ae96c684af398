//! Generation requests and output kinds.
//!
//! A [`GenerationRequest`] is built once per invocation (CLI, batch entry or
//! HTTP call), validated, handed to the router and then dropped.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest accepted edge length in pixels.
pub const MIN_EDGE: u32 = 64;
/// Largest accepted edge length in pixels.
pub const MAX_EDGE: u32 = 4096;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("unsupported output kind '{0}' (expected one of: texture, depth, normal, mesh)")]
    UnsupportedKind(String),

    #[error("prompt must not be empty")]
    EmptyPrompt,

    #[error("no output kinds requested")]
    NoKinds,

    #[error("invalid size '{0}' (expected WIDTHxHEIGHT or a single edge length)")]
    InvalidSize(String),

    #[error("size {width}x{height} out of range: edges must be {MIN_EDGE}..={MAX_EDGE} and multiples of 8")]
    SizeOutOfRange { width: u32, height: u32 },
}

/// One kind of asset the pipeline can produce.
///
/// The derived ordering is the fixed pipeline order:
/// texture → depth → normal → mesh.
/// Deserializes through [`FromStr`], so unknown names fail with
/// [`RequestError::UnsupportedKind`] wherever they appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum OutputKind {
    Texture,
    Depth,
    Normal,
    Mesh,
}

impl OutputKind {
    /// All kinds in pipeline order.
    pub const ALL: [OutputKind; 4] = [
        OutputKind::Texture,
        OutputKind::Depth,
        OutputKind::Normal,
        OutputKind::Mesh,
    ];

    /// Stages whose output this stage consumes.
    pub fn dependencies(self) -> &'static [OutputKind] {
        match self {
            OutputKind::Texture => &[],
            OutputKind::Depth => &[OutputKind::Texture],
            OutputKind::Normal => &[OutputKind::Depth],
            OutputKind::Mesh => &[OutputKind::Texture, OutputKind::Depth],
        }
    }

    /// Subdirectory of the output tree this kind is exported to.
    pub fn dir_name(self) -> &'static str {
        match self {
            OutputKind::Texture => "images",
            OutputKind::Depth => "depth",
            OutputKind::Normal => "normal",
            OutputKind::Mesh => "3d",
        }
    }

    /// File extension backends produce for this kind unless told otherwise.
    pub fn default_extension(self) -> &'static str {
        match self {
            OutputKind::Mesh => "glb",
            _ => "png",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::Texture => "texture",
            OutputKind::Depth => "depth",
            OutputKind::Normal => "normal",
            OutputKind::Mesh => "mesh",
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputKind {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "texture" | "image" => Ok(OutputKind::Texture),
            "depth" => Ok(OutputKind::Depth),
            "normal" => Ok(OutputKind::Normal),
            "mesh" | "3d" | "model" => Ok(OutputKind::Mesh),
            other => Err(RequestError::UnsupportedKind(other.to_string())),
        }
    }
}

impl TryFrom<String> for OutputKind {
    type Error = RequestError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Output image size in pixels.
///
/// Deserializes from `{width, height}`, a `"WxH"` string or a single edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn square(edge: u32) -> Self {
        Self::new(edge, edge)
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        let ok = |edge: u32| (MIN_EDGE..=MAX_EDGE).contains(&edge) && edge % 8 == 0;
        if ok(self.width) && ok(self.height) {
            Ok(())
        } else {
            Err(RequestError::SizeOutOfRange {
                width: self.width,
                height: self.height,
            })
        }
    }
}

impl Default for ImageSize {
    fn default() -> Self {
        Self::square(512)
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for ImageSize {
    type Err = RequestError;

    /// Accepts `512x768`, `512X768`, `512,768` or a single edge `512`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RequestError::InvalidSize(s.to_string());
        let parts: Vec<&str> = s
            .trim()
            .split(|c| c == 'x' || c == 'X' || c == ',')
            .collect();
        let parse = |p: &str| p.trim().parse::<u32>().map_err(|_| invalid());
        match parts.as_slice() {
            [edge] => Ok(ImageSize::square(parse(edge)?)),
            [w, h] => Ok(ImageSize::new(parse(w)?, parse(h)?)),
            _ => Err(invalid()),
        }
    }
}

impl<'de> Deserialize<'de> for ImageSize {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Edge(u32),
            Full { width: u32, height: u32 },
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Repr::Edge(edge) => Ok(ImageSize::square(edge)),
            Repr::Full { width, height } => Ok(ImageSize::new(width, height)),
        }
    }
}

fn default_steps() -> u32 {
    20
}

fn default_guidance() -> f32 {
    7.5
}

/// A request to turn a prompt (or an existing image) into assets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,

    pub kinds: BTreeSet<OutputKind>,

    #[serde(default)]
    pub size: ImageSize,

    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default = "default_steps")]
    pub steps: u32,

    #[serde(default = "default_guidance")]
    pub guidance_scale: f32,

    /// Model identifier overriding the configured one for this request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Existing image used as the texture stage instead of generating one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,

    /// Rewrite the prompt through the LLM backend before the texture stage.
    #[serde(default)]
    pub enhance_prompt: bool,
}

impl GenerationRequest {
    /// A texture-only request with default settings.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            kinds: BTreeSet::from([OutputKind::Texture]),
            size: ImageSize::default(),
            seed: None,
            steps: default_steps(),
            guidance_scale: default_guidance(),
            model: None,
            source: None,
            enhance_prompt: false,
        }
    }

    pub fn with_kinds<I: IntoIterator<Item = OutputKind>>(mut self, kinds: I) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn with_size(mut self, size: ImageSize) -> Self {
        self.size = size;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.prompt.trim().is_empty() && self.source.is_none() {
            return Err(RequestError::EmptyPrompt);
        }
        if self.kinds.is_empty() {
            return Err(RequestError::NoKinds);
        }
        self.size.validate()
    }

    /// Requested kinds plus everything they depend on, in pipeline order.
    pub fn required_stages(&self) -> BTreeSet<OutputKind> {
        let mut required = BTreeSet::new();
        let mut pending: Vec<OutputKind> = self.kinds.iter().copied().collect();
        while let Some(kind) = pending.pop() {
            if required.insert(kind) {
                pending.extend_from_slice(kind.dependencies());
            }
        }
        required
    }

    /// Prompt text used for naming exported files.
    pub fn label(&self) -> String {
        if !self.prompt.trim().is_empty() {
            return self.prompt.clone();
        }
        self.source
            .as_ref()
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "asset".to_string())
    }
}
