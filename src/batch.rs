//! Batch files: many requests run one after another.
//!
//! ```yaml
//! defaults:
//!   kinds: [texture, depth]
//!   size: 512x512
//! requests:
//!   - prompt: weathered oak planks
//!     seed: 11
//!     count: 3          # seeds 11, 12, 13
//!   - source: photos/wall.jpg
//!     kinds: [normal]
//! ```
//!
//! A failing entry is reported and the batch moves on.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::config::GenerationConfig;
use crate::export::{self, ExportOptions, ExportReport};
use crate::pipeline::Router;
use crate::request::{GenerationRequest, ImageSize, OutputKind};

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("cannot read batch file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid batch file {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("batch file {} lists no requests", .0.display())]
    Empty(PathBuf),
}

/// Settings shared by every entry unless the entry overrides them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BatchDefaults {
    pub kinds: Option<Vec<OutputKind>>,
    pub size: Option<ImageSize>,
    pub steps: Option<u32>,
    pub guidance_scale: Option<f32>,
    pub negative_prompt: Option<String>,
    pub model: Option<String>,
    pub count: Option<NonZeroU32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BatchEntry {
    pub prompt: String,
    pub source: Option<PathBuf>,
    pub kinds: Option<Vec<OutputKind>>,
    pub size: Option<ImageSize>,
    pub seed: Option<u64>,
    pub steps: Option<u32>,
    pub guidance_scale: Option<f32>,
    pub negative_prompt: Option<String>,
    pub model: Option<String>,
    pub enhance_prompt: bool,
    pub count: Option<NonZeroU32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchFile {
    #[serde(default)]
    pub defaults: BatchDefaults,
    pub requests: Vec<BatchEntry>,
}

impl BatchFile {
    /// Parse a YAML or JSON batch file (by extension).
    pub fn load(path: &Path) -> Result<Self, BatchError> {
        let data = std::fs::read_to_string(path).map_err(|source| BatchError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let parsed: Result<Self, String> = if is_json {
            serde_json::from_str(&data).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(&data).map_err(|e| e.to_string())
        };
        let file = parsed.map_err(|message| BatchError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        if file.requests.is_empty() {
            return Err(BatchError::Empty(path.to_path_buf()));
        }
        Ok(file)
    }

    /// Flatten into requests. Relative `source` paths resolve against
    /// `base_dir`; `count_override` replaces every per-entry count.
    pub fn requests(
        &self,
        generation: &GenerationConfig,
        base_dir: &Path,
        count_override: Option<NonZeroU32>,
    ) -> Vec<GenerationRequest> {
        let d = &self.defaults;
        let mut out = Vec::new();
        for entry in &self.requests {
            let kinds = entry
                .kinds
                .clone()
                .or_else(|| d.kinds.clone())
                .unwrap_or_else(|| generation.kinds.clone());
            let mut request = GenerationRequest::new(entry.prompt.clone())
                .with_kinds(kinds)
                .with_size(entry.size.or(d.size).unwrap_or(generation.size))
                .with_seed(entry.seed);
            request.steps = entry.steps.or(d.steps).unwrap_or(generation.steps);
            request.guidance_scale = entry
                .guidance_scale
                .or(d.guidance_scale)
                .unwrap_or(generation.guidance_scale);
            request.negative_prompt = entry
                .negative_prompt
                .clone()
                .or_else(|| d.negative_prompt.clone())
                .or_else(|| generation.negative_prompt.clone());
            request.model = entry.model.clone().or_else(|| d.model.clone());
            request.enhance_prompt = entry.enhance_prompt;
            request.source = entry.source.as_ref().map(|s| {
                if s.is_absolute() {
                    s.clone()
                } else {
                    base_dir.join(s)
                }
            });

            let count = count_override
                .or(entry.count)
                .or(d.count)
                .unwrap_or(NonZeroU32::MIN);
            out.extend(repeat_with_seeds(request, count));
        }
        out
    }
}

/// `count` copies of `request` with consecutive seeds. Without a seed, a
/// random base seed is drawn so the copies differ.
pub fn repeat_with_seeds(request: GenerationRequest, count: NonZeroU32) -> Vec<GenerationRequest> {
    if count == NonZeroU32::MIN {
        return vec![request];
    }
    let base = request
        .seed
        .unwrap_or_else(|| u64::from(rand::random::<u32>()));
    (0..u64::from(count.get()))
        .map(|i| request.clone().with_seed(Some(base.wrapping_add(i))))
        .collect()
}

/// Outcome of one batch entry.
#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub index: usize,
    pub prompt: String,
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ExportReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub items: Vec<BatchItem>,
}

impl BatchSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Route and export every request in order, continuing past failures.
pub async fn run(
    router: &Router,
    requests: Vec<GenerationRequest>,
    dest: &Path,
    options: &ExportOptions,
) -> BatchSummary {
    let total = requests.len();
    let mut summary = BatchSummary::default();

    for (index, request) in requests.into_iter().enumerate() {
        let prompt = request.label();
        let seed = request.seed;
        info!(item = index + 1, total, prompt = %prompt, "Batch item");

        let result = match router.route(request).await {
            Ok(bundle) => export::export(&bundle, dest, options)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        let item = match result {
            Ok(report) => {
                summary.succeeded += 1;
                BatchItem {
                    index,
                    prompt,
                    seed,
                    report: Some(report),
                    error: None,
                }
            }
            Err(e) => {
                error!(item = index + 1, error = %e, "Batch item failed");
                summary.failed += 1;
                BatchItem {
                    index,
                    prompt,
                    seed,
                    report: None,
                    error: Some(e),
                }
            }
        };
        summary.items.push(item);
    }

    info!(succeeded = summary.succeeded, failed = summary.failed, "Batch finished");
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    const BATCH: &str = r#"
defaults:
  kinds: [texture, depth]
  size: 256x256
requests:
  - prompt: weathered oak planks
    seed: 11
    count: 3
  - source: photos/wall.jpg
    kinds: [normal]
    steps: 30
"#;

    #[test]
    fn test_load_and_expand() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("batch.yaml");
        std::fs::write(&path, BATCH).unwrap();

        let file = BatchFile::load(&path).unwrap();
        let requests = file.requests(&GenerationConfig::default(), Path::new("/data"), None);
        assert_eq!(requests.len(), 4);

        let seeds: Vec<_> = requests[..3].iter().map(|r| r.seed).collect();
        assert_eq!(seeds, vec![Some(11), Some(12), Some(13)]);
        assert_eq!(requests[0].size, ImageSize::square(256));
        assert!(requests[0].kinds.contains(&OutputKind::Depth));

        let last = &requests[3];
        assert_eq!(last.source.as_deref(), Some(Path::new("/data/photos/wall.jpg")));
        assert_eq!(last.kinds.iter().copied().collect::<Vec<_>>(), vec![OutputKind::Normal]);
        assert_eq!(last.steps, 30);
    }

    #[test]
    fn test_count_override() {
        let file: BatchFile = serde_yaml::from_str(BATCH).unwrap();
        let requests = file.requests(&GenerationConfig::default(), Path::new("."), NonZeroU32::new(1));
        assert_eq!(requests.len(), 2);
    }

    #[test]
    fn test_zero_count_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        for (name, body) in [
            ("entry.yaml", "requests:\n  - prompt: oak\n    count: 0\n"),
            ("defaults.json", r#"{"defaults": {"count": 0}, "requests": [{"prompt": "oak"}]}"#),
        ] {
            let path = dir.path().join(name);
            std::fs::write(&path, body).unwrap();
            match BatchFile::load(&path) {
                Err(BatchError::Parse { message, .. }) => assert!(message.contains("zero"), "{message}"),
                other => panic!("expected Parse for {name}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_repeat_without_seed_gets_consecutive_seeds() {
        let copies = repeat_with_seeds(GenerationRequest::new("x"), NonZeroU32::new(3).unwrap());
        let base = copies[0].seed.unwrap();
        assert_eq!(copies[1].seed, Some(base + 1));
        assert_eq!(copies[2].seed, Some(base + 2));
    }

    #[test]
    fn test_empty_batch_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("batch.json");
        std::fs::write(&path, r#"{"requests": []}"#).unwrap();
        assert!(matches!(BatchFile::load(&path), Err(BatchError::Empty(_))));
    }
}
