//! JSON contract of `POST /api/generate`.
//!
//! The server speaks it and the remote backend consumes it. Field names match
//! SDXL Studio's API (`prompt`, `width`, `guidance_scale`, `images[].data`, …),
//! so either side can talk to such a server.

use std::path::Path;

use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::{GenerationRequest, ImageSize, OutputKind};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("image payload is not a base64 data URL")]
    InvalidImageUrl,

    #[error("invalid base64 in image payload")]
    InvalidBase64,
}

fn default_edge() -> u32 {
    512
}

fn default_steps() -> u32 {
    20
}

fn default_guidance() -> f32 {
    7.5
}

/// Body of `POST /api/generate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Model identifier.
    #[serde(default, alias = "model", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub prompt: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,

    #[serde(default = "default_edge")]
    pub width: u32,

    #[serde(default = "default_edge")]
    pub height: u32,

    #[serde(default = "default_steps")]
    pub steps: u32,

    #[serde(default = "default_guidance")]
    pub guidance_scale: f32,

    #[serde(default)]
    pub seed: Option<u64>,

    /// Requested kinds; empty means texture only.
    #[serde(default)]
    pub kinds: Vec<OutputKind>,

    /// Source image as a data URL, used in place of the texture stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    #[serde(default)]
    pub enhance_prompt: bool,
}

impl GenerateRequest {
    /// Wire form of `request`, restricted to `kinds`.
    pub fn from_request(request: &GenerationRequest, kinds: &[OutputKind]) -> Self {
        Self {
            name: request.model.clone(),
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            width: request.size.width,
            height: request.size.height,
            steps: request.steps,
            guidance_scale: request.guidance_scale,
            seed: request.seed,
            kinds: kinds.to_vec(),
            image: None,
            device: None,
            enhance_prompt: false,
        }
    }

    /// Pipeline request for this body. The source image, if any, must be
    /// materialised by the caller and attached with `with_source`.
    pub fn to_request(&self) -> GenerationRequest {
        let kinds = if self.kinds.is_empty() {
            vec![OutputKind::Texture]
        } else {
            self.kinds.clone()
        };
        let mut request = GenerationRequest::new(self.prompt.clone())
            .with_kinds(kinds)
            .with_size(ImageSize::new(self.width, self.height))
            .with_seed(self.seed);
        request.negative_prompt = self.negative_prompt.clone();
        request.steps = self.steps;
        request.guidance_scale = self.guidance_scale;
        request.model = self.name.clone();
        request.enhance_prompt = self.enhance_prompt;
        request
    }
}

/// One produced file, inlined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePayload {
    /// Absent in replies from servers that only produce textures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<OutputKind>,

    pub filename: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<String>,

    /// `data:<mime>;base64,<payload>`
    pub data: String,
}

/// Reply of `POST /api/generate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub images: Vec<ImagePayload>,

    /// Seconds spent generating.
    #[serde(default)]
    pub generation_time: f64,

    #[serde(default)]
    pub metadata: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GenerateResponse {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// The payload for `kind`. Untagged payloads count as textures.
    pub fn payload_for(&self, kind: OutputKind) -> Option<&ImagePayload> {
        self.images
            .iter()
            .find(|p| p.kind == Some(kind))
            .or_else(|| {
                (kind == OutputKind::Texture)
                    .then(|| self.images.iter().find(|p| p.kind.is_none()))
                    .flatten()
            })
    }
}

/// Encode bytes as a base64 data URL.
pub fn encode_data_url(mime: &str, bytes: &[u8]) -> String {
    format!(
        "data:{mime};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// Decode a base64 data URL into its MIME type and bytes.
pub fn decode_data_url(data_url: &str) -> Result<(String, Vec<u8>), ProtocolError> {
    let base64_prefix = ";base64,";
    let idx = data_url
        .find(base64_prefix)
        .ok_or(ProtocolError::InvalidImageUrl)?;
    let mime = data_url[..idx]
        .strip_prefix("data:")
        .unwrap_or_default()
        .to_string();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data_url[idx + base64_prefix.len()..].trim())
        .map_err(|_| ProtocolError::InvalidBase64)?;
    Ok((mime, bytes))
}

/// MIME type for a produced file, by extension.
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "glb" => "model/gltf-binary",
        "gltf" => "model/gltf+json",
        "obj" => "model/obj",
        "json" => "application/json",
        "py" => "text/x-python",
        _ => "application/octet-stream",
    }
}

/// File extension for a MIME type, falling back to the kind's default.
pub fn extension_for_mime(mime: &str, kind: OutputKind) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "model/gltf-binary" => "glb",
        "model/gltf+json" => "gltf",
        "model/obj" => "obj",
        _ => kind.default_extension(),
    }
}
