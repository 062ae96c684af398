//! Asset exporter: copies a bundle into the output tree.
//!
//! ```text
//! <dest>/images/<stem>.png      texture
//! <dest>/depth/<stem>.png       depth map
//! <dest>/normal/<stem>.png      normal map
//! <dest>/3d/<stem>.glb          mesh
//! <dest>/scripts/<stem>_scene.py
//! <dest>/scripts/<stem>_<kind>.png  unrequested scene inputs
//! <dest>/renders/<stem>.png
//! <dest>/manifests/<stem>.json
//! ```
//!
//! `<stem>` is a slug of the prompt plus the seed, or the creation time when
//! the request had no seed. Existing files are overwritten.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::blender::{BlenderError, BlenderRunner, SceneScript};
use crate::config::BlenderConfig;
use crate::pipeline::AssetBundle;
use crate::request::{ImageSize, OutputKind};

pub const SCRIPTS_DIR: &str = "scripts";
pub const RENDERS_DIR: &str = "renders";
pub const MANIFESTS_DIR: &str = "manifests";

/// Longest slug taken from a prompt.
const MAX_SLUG: usize = 48;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("bundle is incomplete, missing: {0:?}")]
    Incomplete(Vec<OutputKind>),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Blender(#[from] BlenderError),

    #[error("Blender finished but wrote no render at {}", .0.display())]
    NoRender(PathBuf),

    #[error("manifest serialization failed: {0}")]
    Manifest(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ExportError + '_ {
    move |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Extras beyond copying files.
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Write a Blender scene script next to the assets.
    pub scene_script: bool,
    /// Render the scene (writes the script too).
    pub render: bool,
    pub blender: BlenderConfig,
}

/// One exported file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

/// Metadata written to `manifests/<stem>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub exported_at: DateTime<Utc>,
    pub prompt: String,
    pub prompt_used: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    pub size: ImageSize,
    pub seed: Option<u64>,
    pub steps: u32,
    pub guidance_scale: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    pub files: BTreeMap<OutputKind, ManifestFile>,
    pub timings_ms: BTreeMap<OutputKind, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_script: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render: Option<PathBuf>,
}

/// What an export wrote.
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub id: Uuid,
    pub stem: String,
    pub prompt_used: String,
    pub files: BTreeMap<OutputKind, PathBuf>,
    pub manifest: PathBuf,
    pub scene_script: Option<PathBuf>,
    pub render: Option<PathBuf>,
    pub timings_ms: BTreeMap<OutputKind, u64>,
}

/// Lowercase ASCII slug: alphanumerics kept, runs of anything else become `_`.
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
        if slug.len() >= MAX_SLUG {
            break;
        }
    }
    let slug = slug.trim_end_matches('_');
    if slug.is_empty() {
        "asset".to_string()
    } else {
        slug.to_string()
    }
}

/// File stem shared by every file of a bundle.
pub fn file_stem(bundle: &AssetBundle) -> String {
    let suffix = match bundle.request.seed {
        Some(seed) => seed.to_string(),
        None => bundle.created_at.timestamp().to_string(),
    };
    format!("{}_{suffix}", slugify(&bundle.request.label()))
}

/// Create every directory of the output tree.
pub fn prepare_layout(dest: &Path) -> Result<(), ExportError> {
    let dirs = OutputKind::ALL
        .iter()
        .map(|k| k.dir_name())
        .chain([SCRIPTS_DIR, RENDERS_DIR, MANIFESTS_DIR]);
    for dir in dirs {
        let path = dest.join(dir);
        std::fs::create_dir_all(&path).map_err(io_err(&path))?;
    }
    Ok(())
}

fn hash_file(path: &Path) -> Result<ManifestFile, ExportError> {
    let data = std::fs::read(path).map_err(io_err(path))?;
    Ok(ManifestFile {
        path: path.to_path_buf(),
        sha256: format!("{:x}", Sha256::digest(&data)),
        bytes: data.len() as u64,
    })
}

/// Image the scene script should load for `kind`: the exported file, or a
/// dependency-stage output copied beside the script so it outlives staging.
async fn scene_input(
    bundle: &AssetBundle,
    files: &BTreeMap<OutputKind, PathBuf>,
    kind: OutputKind,
    dest: &Path,
    stem: &str,
) -> Result<Option<PathBuf>, ExportError> {
    if let Some(path) = files.get(&kind) {
        return Ok(Some(path.clone()));
    }
    let Some(staged) = bundle.stage_file(kind) else {
        return Ok(None);
    };
    let ext = staged
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| kind.default_extension().to_string());
    let target = dest.join(SCRIPTS_DIR).join(format!("{stem}_{kind}.{ext}"));
    tokio::fs::copy(staged, &target).await.map_err(io_err(&target))?;
    Ok(Some(target))
}

/// Copy `bundle` into `dest` and write its manifest.
pub async fn export(
    bundle: &AssetBundle,
    dest: &Path,
    options: &ExportOptions,
) -> Result<ExportReport, ExportError> {
    let missing = bundle.missing();
    if !missing.is_empty() {
        return Err(ExportError::Incomplete(missing));
    }

    prepare_layout(dest)?;
    // Scripts are run from elsewhere, so they reference absolute paths.
    let dest = tokio::fs::canonicalize(dest).await.map_err(io_err(dest))?;
    let stem = file_stem(bundle);

    let mut files = BTreeMap::new();
    for (&kind, staged) in &bundle.files {
        let ext = staged
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| kind.default_extension().to_string());
        let target = dest.join(kind.dir_name()).join(format!("{stem}.{ext}"));
        tokio::fs::copy(staged, &target).await.map_err(io_err(&target))?;
        info!(kind = %kind, path = %target.display(), "Exported");
        files.insert(kind, target);
    }

    let mut scene_script = None;
    let mut render = None;
    if options.scene_script || options.render {
        let script_path = dest.join(SCRIPTS_DIR).join(format!("{stem}_scene.py"));
        let mut script = SceneScript::from_config(&options.blender);
        if let Some(mesh) = files.get(&OutputKind::Mesh) {
            script = script.import_glb(mesh);
        }
        if let Some(texture) = scene_input(bundle, &files, OutputKind::Texture, &dest, &stem).await? {
            script = script.texture(texture);
        }
        if let Some(depth) = scene_input(bundle, &files, OutputKind::Depth, &dest, &stem).await? {
            script = script.depth(depth);
        }
        let render_path = dest.join(RENDERS_DIR).join(format!("{stem}.png"));
        if options.render {
            script = script.render_to(&render_path);
        }
        script.write(&script_path).map_err(io_err(&script_path))?;
        info!(path = %script_path.display(), "Scene script written");

        if options.render {
            BlenderRunner::from_config(&options.blender)
                .run_script(&script_path)
                .await?;
            if !render_path.is_file() {
                return Err(ExportError::NoRender(render_path));
            }
            info!(path = %render_path.display(), "Scene rendered");
            render = Some(render_path);
        }
        scene_script = Some(script_path);
    }

    let manifest_files = files
        .iter()
        .map(|(&kind, path)| Ok((kind, hash_file(path)?)))
        .collect::<Result<BTreeMap<_, _>, ExportError>>()?;
    let request = &bundle.request;
    let manifest = Manifest {
        id: bundle.id,
        created_at: bundle.created_at,
        exported_at: Utc::now(),
        prompt: request.prompt.clone(),
        prompt_used: bundle.prompt_used.clone(),
        negative_prompt: request.negative_prompt.clone(),
        size: request.size,
        seed: request.seed,
        steps: request.steps,
        guidance_scale: request.guidance_scale,
        model: request.model.clone(),
        source: request.source.clone(),
        files: manifest_files,
        timings_ms: bundle.timings_ms.clone(),
        scene_script: scene_script.clone(),
        render: render.clone(),
    };
    let manifest_path = dest.join(MANIFESTS_DIR).join(format!("{stem}.json"));
    let json = serde_json::to_string_pretty(&manifest)?;
    tokio::fs::write(&manifest_path, json)
        .await
        .map_err(io_err(&manifest_path))?;

    Ok(ExportReport {
        id: bundle.id,
        stem,
        prompt_used: bundle.prompt_used.clone(),
        files,
        manifest: manifest_path,
        scene_script,
        render,
        timings_ms: bundle.timings_ms.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Rusty  Metal Panel!"), "rusty_metal_panel");
        assert_eq!(slugify("  --  "), "asset");
        assert_eq!(slugify("Été à Paris"), "t_paris");
        assert!(slugify(&"long prompt ".repeat(20)).len() <= MAX_SLUG);
    }

    #[test]
    fn test_prepare_layout() {
        let dir = tempfile::TempDir::new().unwrap();
        prepare_layout(dir.path()).unwrap();
        for sub in ["images", "depth", "normal", "3d", "scripts", "renders", "manifests"] {
            assert!(dir.path().join(sub).is_dir(), "{sub} missing");
        }
    }
}
