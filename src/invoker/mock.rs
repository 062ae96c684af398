//! Offline backend producing deterministic placeholder assets.
//!
//! Textures are smooth colour noise from a seeded RNG, depth is the
//! normalised luminance of the texture, and meshes are a textured heightfield
//! GLB. The same seed always yields byte-identical files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use super::{BackendKind, InvokeError, Invoker, StageInput};
use crate::protocol::mime_for_path;
use crate::request::OutputKind;

/// Colour lattice cells along each axis of a mock texture.
const NOISE_CELLS: u32 = 8;

/// Quads along each axis of a mock heightfield.
const MESH_SEGMENTS: u32 = 32;

/// Height of a white depth pixel in mesh units.
const MESH_RELIEF: f32 = 0.25;

/// Seed derived from a prompt when a request carries none.
pub fn prompt_seed(prompt: &str) -> u64 {
    let digest = Sha256::digest(prompt.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

#[derive(Debug, Default)]
pub struct MockInvoker;

impl MockInvoker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Invoker for MockInvoker {
    fn backend(&self) -> BackendKind {
        BackendKind::Mock
    }

    fn supports(&self, kind: OutputKind) -> bool {
        matches!(
            kind,
            OutputKind::Texture | OutputKind::Depth | OutputKind::Mesh
        )
    }

    async fn invoke(&self, kind: OutputKind, input: &StageInput<'_>) -> Result<PathBuf, InvokeError> {
        match kind {
            OutputKind::Texture => {
                let path = input.output_path(kind, "png");
                let size = input.request.size;
                render_texture(input.seed(), size.width, size.height).save(&path)?;
                Ok(path)
            }
            OutputKind::Depth => {
                let texture = image::open(input.upstream(kind, OutputKind::Texture)?)?;
                let path = input.output_path(kind, "png");
                depth_from_luminance(&texture).save(&path)?;
                Ok(path)
            }
            OutputKind::Mesh => {
                let texture = input.upstream(kind, OutputKind::Texture)?;
                let depth = image::open(input.upstream(kind, OutputKind::Depth)?)?.to_luma8();
                let path = input.output_path(kind, "glb");
                std::fs::write(&path, heightfield_glb(texture, &depth)?)?;
                Ok(path)
            }
            OutputKind::Normal => Err(InvokeError::Unsupported {
                kind,
                backend: BackendKind::Mock,
            }),
        }
    }
}

/// Smooth colour noise: a random lattice upsampled with smoothstep weights.
pub fn render_texture(seed: u64, width: u32, height: u32) -> RgbImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let stride = (NOISE_CELLS + 1) as usize;
    let lattice: Vec<[f32; 3]> = (0..stride * stride)
        .map(|_| [rng.gen(), rng.gen(), rng.gen()])
        .collect();

    let cell = |pos: u32, extent: u32| -> (usize, f32) {
        let f = pos as f32 / (extent.max(2) - 1) as f32 * NOISE_CELLS as f32;
        let i = (f.floor() as u32).min(NOISE_CELLS - 1);
        let t = f - i as f32;
        (i as usize, t * t * (3.0 - 2.0 * t))
    };

    RgbImage::from_fn(width, height, |x, y| {
        let (ix, tx) = cell(x, width);
        let (iy, ty) = cell(y, height);
        let at = |cx: usize, cy: usize| lattice[cy * stride + cx];
        let (c00, c10) = (at(ix, iy), at(ix + 1, iy));
        let (c01, c11) = (at(ix, iy + 1), at(ix + 1, iy + 1));
        let mut px = [0u8; 3];
        for (ch, out) in px.iter_mut().enumerate() {
            let top = c00[ch] + (c10[ch] - c00[ch]) * tx;
            let bottom = c01[ch] + (c11[ch] - c01[ch]) * tx;
            *out = ((top + (bottom - top) * ty) * 255.0).round() as u8;
        }
        Rgb(px)
    })
}

/// Luminance stretched to the full 0..=255 range. A flat image maps to 0.
pub fn depth_from_luminance(texture: &DynamicImage) -> GrayImage {
    let mut luma = texture.to_luma8();
    let (lo, hi) = luma
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    let range = hi.saturating_sub(lo) as f32;
    for p in luma.pixels_mut() {
        p[0] = if range == 0.0 {
            0
        } else {
            ((p[0] - lo) as f32 / range * 255.0).round() as u8
        };
    }
    luma
}

/// Binary glTF of a grid displaced by `depth`, textured with the image at
/// `texture_path` (embedded as-is).
pub fn heightfield_glb(texture_path: &Path, depth: &GrayImage) -> Result<Vec<u8>, InvokeError> {
    let texture_bytes = std::fs::read(texture_path)?;
    let n = MESH_SEGMENTS + 1;
    let vertex_count = (n * n) as usize;

    let mut positions = Vec::with_capacity(vertex_count * 12);
    let mut uvs = Vec::with_capacity(vertex_count * 8);
    let mut max_height = 0f32;
    for j in 0..n {
        for i in 0..n {
            let u = i as f32 / MESH_SEGMENTS as f32;
            let v = j as f32 / MESH_SEGMENTS as f32;
            let sx = (u * (depth.width().max(1) - 1) as f32).round() as u32;
            let sy = (v * (depth.height().max(1) - 1) as f32).round() as u32;
            let h = depth.get_pixel(sx, sy)[0] as f32 / 255.0 * MESH_RELIEF;
            max_height = max_height.max(h);
            for c in [u * 2.0 - 1.0, h, v * 2.0 - 1.0] {
                positions.extend_from_slice(&c.to_le_bytes());
            }
            uvs.extend_from_slice(&u.to_le_bytes());
            uvs.extend_from_slice(&v.to_le_bytes());
        }
    }

    let mut indices = Vec::new();
    for j in 0..MESH_SEGMENTS {
        for i in 0..MESH_SEGMENTS {
            let a = j * n + i;
            let b = a + 1;
            let c = a + n;
            let d = c + 1;
            for idx in [a, c, b, b, c, d] {
                indices.extend_from_slice(&idx.to_le_bytes());
            }
        }
    }
    let index_count = indices.len() / 4;

    let pos_len = positions.len();
    let uv_len = uvs.len();
    let idx_len = indices.len();
    let img_len = texture_bytes.len();

    let mut bin = positions;
    bin.extend_from_slice(&uvs);
    bin.extend_from_slice(&indices);
    bin.extend_from_slice(&texture_bytes);
    bin.resize((bin.len() + 3) & !3, 0);

    let json = serde_json::json!({
        "asset": { "version": "2.0", "generator": "promptforge-mock" },
        "scene": 0,
        "scenes": [{ "nodes": [0] }],
        "nodes": [{ "mesh": 0, "name": "heightfield" }],
        "meshes": [{
            "primitives": [{
                "attributes": { "POSITION": 0, "TEXCOORD_0": 1 },
                "indices": 2,
                "material": 0
            }]
        }],
        "materials": [{
            "pbrMetallicRoughness": {
                "baseColorTexture": { "index": 0 },
                "metallicFactor": 0.0
            }
        }],
        "textures": [{ "source": 0 }],
        "images": [{ "bufferView": 3, "mimeType": mime_for_path(texture_path) }],
        "accessors": [
            {
                "bufferView": 0,
                "componentType": 5126,
                "count": vertex_count,
                "type": "VEC3",
                "min": [-1.0, 0.0, -1.0],
                "max": [1.0, max_height, 1.0]
            },
            { "bufferView": 1, "componentType": 5126, "count": vertex_count, "type": "VEC2" },
            { "bufferView": 2, "componentType": 5125, "count": index_count, "type": "SCALAR" }
        ],
        "bufferViews": [
            { "buffer": 0, "byteOffset": 0, "byteLength": pos_len, "target": 34962 },
            { "buffer": 0, "byteOffset": pos_len, "byteLength": uv_len, "target": 34962 },
            { "buffer": 0, "byteOffset": pos_len + uv_len, "byteLength": idx_len, "target": 34963 },
            { "buffer": 0, "byteOffset": pos_len + uv_len + idx_len, "byteLength": img_len }
        ],
        "buffers": [{ "byteLength": bin.len() }]
    });

    let mut json_bytes = serde_json::to_vec(&json).map_err(std::io::Error::from)?;
    json_bytes.resize((json_bytes.len() + 3) & !3, b' ');

    let total_len = 12 + 8 + json_bytes.len() + 8 + bin.len();
    let mut glb = Vec::with_capacity(total_len);
    glb.extend_from_slice(b"glTF");
    glb.extend_from_slice(&2u32.to_le_bytes());
    glb.extend_from_slice(&(total_len as u32).to_le_bytes());
    glb.extend_from_slice(&(json_bytes.len() as u32).to_le_bytes());
    glb.extend_from_slice(&0x4E4F534Au32.to_le_bytes()); // JSON
    glb.extend_from_slice(&json_bytes);
    glb.extend_from_slice(&(bin.len() as u32).to_le_bytes());
    glb.extend_from_slice(&0x004E4942u32.to_le_bytes()); // BIN
    glb.extend_from_slice(&bin);
    Ok(glb)
}
