use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::TempDir;
use uuid::Uuid;

use crate::request::{GenerationRequest, OutputKind};

/// Files produced for one request, one per requested kind.
///
/// Paths point into a staging directory that lives as long as the bundle
/// (or any clone of it); the exporter copies them to their final place.
#[derive(Debug, Clone, Serialize)]
pub struct AssetBundle {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub request: GenerationRequest,
    /// Prompt the backends actually received.
    pub prompt_used: String,
    pub files: BTreeMap<OutputKind, PathBuf>,
    /// Outputs of stages that ran only as dependencies. Staged, never exported.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub intermediates: BTreeMap<OutputKind, PathBuf>,
    /// Wall time per executed stage, including dependency-only stages.
    pub timings_ms: BTreeMap<OutputKind, u64>,
    #[serde(skip)]
    staging: Option<Arc<TempDir>>,
}

impl AssetBundle {
    pub fn new(
        request: GenerationRequest,
        prompt_used: String,
        files: BTreeMap<OutputKind, PathBuf>,
        timings_ms: BTreeMap<OutputKind, u64>,
        staging: Option<TempDir>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            request,
            prompt_used,
            files,
            intermediates: BTreeMap::new(),
            timings_ms,
            staging: staging.map(Arc::new),
        }
    }

    pub fn with_intermediates(mut self, intermediates: BTreeMap<OutputKind, PathBuf>) -> Self {
        self.intermediates = intermediates;
        self
    }

    pub fn file(&self, kind: OutputKind) -> Option<&Path> {
        self.files.get(&kind).map(PathBuf::as_path)
    }

    /// Output of any stage that ran, requested or not.
    pub fn stage_file(&self, kind: OutputKind) -> Option<&Path> {
        self.file(kind)
            .or_else(|| self.intermediates.get(&kind).map(PathBuf::as_path))
    }

    /// Requested kinds that have no file.
    pub fn missing(&self) -> Vec<OutputKind> {
        self.request
            .kinds
            .iter()
            .copied()
            .filter(|k| !self.files.contains_key(k))
            .collect()
    }

    /// Every requested kind has a file and nothing else is present.
    pub fn is_complete(&self) -> bool {
        self.missing().is_empty() && self.files.len() == self.request.kinds.len()
    }

    pub fn staging_dir(&self) -> Option<&Path> {
        self.staging.as_deref().map(TempDir::path)
    }

    pub fn total_ms(&self) -> u64 {
        self.timings_ms.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completeness() {
        let request = GenerationRequest::new("x").with_kinds([OutputKind::Texture, OutputKind::Depth]);
        let files = BTreeMap::from([(OutputKind::Texture, PathBuf::from("t.png"))]);
        let bundle = AssetBundle::new(request.clone(), "x".into(), files, BTreeMap::new(), None);
        assert!(!bundle.is_complete());
        assert_eq!(bundle.missing(), vec![OutputKind::Depth]);

        let files = BTreeMap::from([
            (OutputKind::Texture, PathBuf::from("t.png")),
            (OutputKind::Depth, PathBuf::from("d.png")),
        ]);
        let bundle = AssetBundle::new(request, "x".into(), files, BTreeMap::new(), None);
        assert!(bundle.is_complete());
    }

    #[test]
    fn test_stage_file_falls_back_to_intermediates() {
        let request = GenerationRequest::new("x").with_kinds([OutputKind::Mesh]);
        let files = BTreeMap::from([(OutputKind::Mesh, PathBuf::from("m.glb"))]);
        let bundle = AssetBundle::new(request, "x".into(), files, BTreeMap::new(), None)
            .with_intermediates(BTreeMap::from([(OutputKind::Texture, PathBuf::from("t.png"))]));

        assert!(bundle.is_complete());
        assert_eq!(bundle.file(OutputKind::Texture), None);
        assert_eq!(bundle.stage_file(OutputKind::Texture), Some(Path::new("t.png")));
        assert_eq!(bundle.stage_file(OutputKind::Mesh), Some(Path::new("m.glb")));
        assert_eq!(bundle.stage_file(OutputKind::Depth), None);
    }

    #[test]
    fn test_staging_lives_with_clones() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().to_path_buf();
        let bundle = AssetBundle::new(GenerationRequest::new("x"), "x".into(), BTreeMap::new(), BTreeMap::new(), Some(dir));
        let clone = bundle.clone();
        drop(bundle);
        assert!(path.exists());
        assert_eq!(clone.staging_dir(), Some(path.as_path()));
        drop(clone);
        assert!(!path.exists());
    }
}
