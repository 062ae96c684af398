//! Integration tests for the full pipeline on the built-in backends.

use std::collections::BTreeMap;

use promptforge::config::Config;
use promptforge::invoker::{BackendKind, InvokerSet};
use promptforge::pipeline::{Router, RouterError};
use promptforge::request::{GenerationRequest, ImageSize, OutputKind};

/// Mock texture/depth/mesh, sobel normals.
fn offline_config() -> Config {
    let mut config = Config::default();
    config.override_backend(BackendKind::Mock);
    config.backends.normal = BackendKind::Sobel;
    config
}

fn offline_router() -> Router {
    Router::new(InvokerSet::from_config(&offline_config()).unwrap())
}

fn request(kinds: impl IntoIterator<Item = OutputKind>) -> GenerationRequest {
    GenerationRequest::new("mossy cobblestone")
        .with_kinds(kinds)
        .with_size(ImageSize::square(64))
        .with_seed(Some(42))
}

#[tokio::test]
async fn test_full_pipeline_produces_every_kind() {
    let router = offline_router();
    let bundle = router.route(request(OutputKind::ALL)).await.unwrap();

    assert!(bundle.is_complete());
    assert_eq!(bundle.files.len(), 4);
    for kind in OutputKind::ALL {
        let path = bundle.file(kind).unwrap();
        assert!(path.is_file(), "{kind} file missing");
        assert!(std::fs::metadata(path).unwrap().len() > 0);
    }

    let texture = image::open(bundle.file(OutputKind::Texture).unwrap()).unwrap();
    assert_eq!((texture.width(), texture.height()), (64, 64));

    let normal = image::open(bundle.file(OutputKind::Normal).unwrap())
        .unwrap()
        .to_rgb8();
    assert_eq!(normal.dimensions(), (64, 64));

    let glb = std::fs::read(bundle.file(OutputKind::Mesh).unwrap()).unwrap();
    assert_eq!(&glb[..4], b"glTF");
}

#[tokio::test]
async fn test_one_file_per_requested_kind() {
    let router = offline_router();
    for kinds in [
        vec![OutputKind::Texture],
        vec![OutputKind::Depth],
        vec![OutputKind::Normal],
        vec![OutputKind::Texture, OutputKind::Mesh],
    ] {
        let bundle = router.route(request(kinds.clone())).await.unwrap();
        let produced: Vec<_> = bundle.files.keys().copied().collect();
        assert_eq!(produced, kinds);
    }
}

#[tokio::test]
async fn test_same_seed_same_bytes() {
    let router = offline_router();
    let first = router.route(request(OutputKind::ALL)).await.unwrap();
    let second = router.route(request(OutputKind::ALL)).await.unwrap();

    for kind in OutputKind::ALL {
        let a = std::fs::read(first.file(kind).unwrap()).unwrap();
        let b = std::fs::read(second.file(kind).unwrap()).unwrap();
        assert_eq!(a, b, "{kind} differs between runs");
    }

    let other = router
        .route(request([OutputKind::Texture]).with_seed(Some(43)))
        .await
        .unwrap();
    assert_ne!(
        std::fs::read(first.file(OutputKind::Texture).unwrap()).unwrap(),
        std::fs::read(other.file(OutputKind::Texture).unwrap()).unwrap()
    );
}

#[tokio::test]
async fn test_unsupported_kind_is_a_distinct_error() {
    // Mock cannot derive normals.
    let mut config = Config::default();
    config.override_backend(BackendKind::Mock);
    config.backends.normal = BackendKind::Mock;
    let router = Router::new(InvokerSet::from_config(&config).unwrap());

    let err = router
        .route(request([OutputKind::Normal]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RouterError::UnsupportedKind {
            kind: OutputKind::Normal,
            backend: BackendKind::Mock
        }
    ));
    assert!(err.is_client_error());
}

#[tokio::test]
async fn test_unconfigured_command_backend_is_unsupported() {
    let mut config = offline_config();
    config.backends.depth = BackendKind::Command;
    let router = Router::new(InvokerSet::from_config(&config).unwrap());

    let err = router
        .route(request([OutputKind::Depth]))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::UnsupportedKind { kind: OutputKind::Depth, .. }));
}

#[tokio::test]
async fn test_process_existing_image() {
    let dir = tempfile::TempDir::new().unwrap();
    let source = dir.path().join("wall.png");
    image::RgbImage::from_fn(32, 32, |x, y| image::Rgb([(x * 8) as u8, (y * 8) as u8, 0]))
        .save(&source)
        .unwrap();

    let router = offline_router();
    let req = GenerationRequest::new("")
        .with_source(&source)
        .with_kinds([OutputKind::Depth, OutputKind::Normal]);
    let bundle = router.route(req).await.unwrap();

    assert_eq!(bundle.files.len(), 2);
    let depth = image::open(bundle.file(OutputKind::Depth).unwrap()).unwrap();
    assert_eq!((depth.width(), depth.height()), (32, 32));
    assert_eq!(bundle.request.label(), "wall");
}

#[tokio::test]
async fn test_missing_source_is_client_error() {
    let router = offline_router();
    let req = GenerationRequest::new("")
        .with_source("/definitely/not/here.png")
        .with_kinds([OutputKind::Depth]);
    let err = router.route(req).await.unwrap_err();
    assert!(matches!(err, RouterError::Source { .. }));
    assert!(err.is_client_error());
}

#[tokio::test]
async fn test_models_bound_per_stage() {
    let router = offline_router();
    let mut req = request([OutputKind::Depth]);
    req.model = Some("sdxl-turbo".into());
    router.route(req).await.unwrap();

    let loaded: BTreeMap<_, _> = router
        .invokers()
        .loaded_models()
        .await
        .into_iter()
        .map(|h| (h.kind, h.model))
        .collect();
    assert_eq!(loaded[&OutputKind::Texture], "sdxl-turbo");
    assert_eq!(loaded[&OutputKind::Depth], "MiDaS_small");
    assert!(!loaded.contains_key(&OutputKind::Normal));
}
