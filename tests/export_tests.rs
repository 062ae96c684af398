//! Integration tests for exporting bundles into the output tree.

use sha2::{Digest, Sha256};

use promptforge::config::Config;
use promptforge::export::{self, ExportError, ExportOptions, Manifest};
use promptforge::invoker::{BackendKind, InvokerSet};
use promptforge::pipeline::{AssetBundle, Router};
use promptforge::request::{GenerationRequest, ImageSize, OutputKind};

fn offline_router() -> Router {
    let mut config = Config::default();
    config.override_backend(BackendKind::Mock);
    config.backends.normal = BackendKind::Sobel;
    Router::new(InvokerSet::from_config(&config).unwrap())
}

async fn bundle(kinds: impl IntoIterator<Item = OutputKind>) -> AssetBundle {
    let request = GenerationRequest::new("Rusty metal panel")
        .with_kinds(kinds)
        .with_size(ImageSize::square(64))
        .with_seed(Some(7));
    offline_router().route(request).await.unwrap()
}

#[tokio::test]
async fn test_export_layout() {
    let out = tempfile::TempDir::new().unwrap();
    let bundle = bundle(OutputKind::ALL).await;
    let report = export::export(&bundle, out.path(), &ExportOptions::default())
        .await
        .unwrap();

    assert_eq!(report.stem, "rusty_metal_panel_7");
    let root = out.path().canonicalize().unwrap();
    assert_eq!(report.files[&OutputKind::Texture], root.join("images/rusty_metal_panel_7.png"));
    assert_eq!(report.files[&OutputKind::Depth], root.join("depth/rusty_metal_panel_7.png"));
    assert_eq!(report.files[&OutputKind::Normal], root.join("normal/rusty_metal_panel_7.png"));
    assert_eq!(report.files[&OutputKind::Mesh], root.join("3d/rusty_metal_panel_7.glb"));
    for path in report.files.values() {
        assert!(path.is_file());
    }
    assert!(report.scene_script.is_none());
    assert!(report.render.is_none());
}

#[tokio::test]
async fn test_manifest_hashes_match_files() {
    let out = tempfile::TempDir::new().unwrap();
    let bundle = bundle([OutputKind::Texture, OutputKind::Depth]).await;
    let report = export::export(&bundle, out.path(), &ExportOptions::default())
        .await
        .unwrap();

    let manifest: Manifest =
        serde_json::from_str(&std::fs::read_to_string(&report.manifest).unwrap()).unwrap();
    assert_eq!(manifest.id, bundle.id);
    assert_eq!(manifest.prompt, "Rusty metal panel");
    assert_eq!(manifest.seed, Some(7));
    assert_eq!(manifest.size, ImageSize::square(64));
    assert_eq!(manifest.files.len(), 2);

    for (kind, entry) in &manifest.files {
        let data = std::fs::read(&report.files[kind]).unwrap();
        assert_eq!(entry.sha256, format!("{:x}", Sha256::digest(&data)));
        assert_eq!(entry.bytes, data.len() as u64);
    }
}

#[tokio::test]
async fn test_reexport_overwrites() {
    let out = tempfile::TempDir::new().unwrap();
    let bundle = bundle([OutputKind::Texture]).await;
    let first = export::export(&bundle, out.path(), &ExportOptions::default())
        .await
        .unwrap();

    std::fs::write(&first.files[&OutputKind::Texture], b"stale").unwrap();
    let second = export::export(&bundle, out.path(), &ExportOptions::default())
        .await
        .unwrap();

    assert_eq!(first.files, second.files);
    let data = std::fs::read(&second.files[&OutputKind::Texture]).unwrap();
    assert_ne!(data, b"stale");
    assert_eq!(
        std::fs::read_dir(out.path().join("images")).unwrap().count(),
        1
    );
}

#[tokio::test]
async fn test_scene_script_written() {
    let out = tempfile::TempDir::new().unwrap();
    let bundle = bundle([OutputKind::Texture, OutputKind::Depth]).await;
    let options = ExportOptions {
        scene_script: true,
        ..Default::default()
    };
    let report = export::export(&bundle, out.path(), &options).await.unwrap();

    let script_path = report.scene_script.unwrap();
    assert!(script_path.ends_with("scripts/rusty_metal_panel_7_scene.py"));
    let script = std::fs::read_to_string(&script_path).unwrap();
    assert!(script.contains("import bpy"));
    let texture = report.files[&OutputKind::Texture].display().to_string();
    assert!(script.contains(&texture));
    assert!(script.contains("DISPLACE"));
    assert!(!script.contains("write_still"));
}

#[tokio::test]
async fn test_mesh_only_scene_imports_exported_glb() {
    let out = tempfile::TempDir::new().unwrap();
    let bundle = bundle([OutputKind::Mesh]).await;
    assert!(bundle.intermediates.contains_key(&OutputKind::Texture));
    let options = ExportOptions {
        scene_script: true,
        ..Default::default()
    };
    let report = export::export(&bundle, out.path(), &options).await.unwrap();

    assert_eq!(report.files.len(), 1);
    let script = std::fs::read_to_string(report.scene_script.unwrap()).unwrap();
    let glb = report.files[&OutputKind::Mesh].display().to_string();
    assert!(script.contains(&format!("import_scene.gltf(filepath=\"{glb}\")")));
    assert!(!script.contains("primitive_cube_add"));
    assert!(!script.contains("DISPLACE"));

    // The dependency texture is copied beside the script, not into images/.
    let texture = out
        .path()
        .canonicalize()
        .unwrap()
        .join("scripts/rusty_metal_panel_7_texture.png");
    assert!(texture.is_file());
    assert!(script.contains(&format!("bpy.data.images.load(\"{}\")", texture.display())));
    assert_eq!(std::fs::read_dir(out.path().join("images")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_normal_only_scene_uses_dependency_depth() {
    let out = tempfile::TempDir::new().unwrap();
    let bundle = bundle([OutputKind::Normal]).await;
    let options = ExportOptions {
        scene_script: true,
        ..Default::default()
    };
    let report = export::export(&bundle, out.path(), &options).await.unwrap();

    let script = std::fs::read_to_string(report.scene_script.unwrap()).unwrap();
    assert!(script.contains("rusty_metal_panel_7_texture.png"));
    assert!(script.contains("rusty_metal_panel_7_depth.png"));
    assert!(script.contains("type='DISPLACE'"));
    assert!(!script.contains("import_scene"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_render_without_blender_fails() {
    let out = tempfile::TempDir::new().unwrap();
    let bundle = bundle([OutputKind::Texture]).await;
    let mut options = ExportOptions {
        render: true,
        ..Default::default()
    };
    options.blender.executable = "/nonexistent/blender".into();

    let err = export::export(&bundle, out.path(), &options)
        .await
        .unwrap_err();
    assert!(matches!(err, ExportError::Blender(_)));
}
