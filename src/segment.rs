//! Background segmentation: a foreground mask plus the image with its
//! background removed.
//!
//! The raw mask comes either from a configured command (a segmentation model
//! run out of process, writing a grayscale PNG) or from the built-in border
//! backend, which treats pixels close to the median border colour as
//! background. The mask is then thresholded and cleaned with a morphological
//! close followed by an open over a square kernel.
//!
//! ```text
//! <dest>/segments/<stem>_mask.png   0 background, 255 foreground
//! <dest>/segments/<stem>.png        RGBA, background transparent
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use image::imageops::FilterType;
use image::{GrayImage, Luma, Rgba, RgbaImage, RgbImage};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::SegmentConfig;
use crate::device::Device;
use crate::export::slugify;
use crate::invoker::command::{run_argv, substitute};
use crate::invoker::InvokeError;

pub const SEGMENTS_DIR: &str = "segments";

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("input image not found: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("no segmentation command configured (segment.command is empty)")]
    NoCommand,

    #[error("segmentation command failed: {0}")]
    Command(#[from] InvokeError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("segmentation task failed: {0}")]
    Task(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SegmentError + '_ {
    move |source| SegmentError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Where the raw mask comes from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum MaskBackend {
    /// Distance from the median border colour.
    #[default]
    Border,
    /// `segment.command`, which writes a grayscale mask to `{output}`.
    Command,
}

impl MaskBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            MaskBackend::Border => "border",
            MaskBackend::Command => "command",
        }
    }
}

impl fmt::Display for MaskBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a segmentation wrote.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentReport {
    pub input: PathBuf,
    pub backend: MaskBackend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub width: u32,
    pub height: u32,
    pub mask: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segmented: Option<PathBuf>,
    /// Fraction of pixels kept as foreground.
    pub coverage: f64,
    pub elapsed_ms: u64,
}

/// Segment `input` and write the mask (and masked image) under
/// `<dest>/segments`.
pub async fn segment(
    input: &Path,
    dest: &Path,
    config: &SegmentConfig,
    device: Device,
) -> Result<SegmentReport, SegmentError> {
    if !input.is_file() {
        return Err(SegmentError::MissingInput(input.to_path_buf()));
    }
    let start = Instant::now();
    // The command runs in its own directory.
    let input = tokio::fs::canonicalize(input).await.map_err(io_err(input))?;

    let raw = match config.backend {
        MaskBackend::Border => None,
        MaskBackend::Command => Some(command_mask(&input, config, device).await?),
    };

    let dir = dest.join(SEGMENTS_DIR);
    tokio::fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;
    let stem = input
        .file_stem()
        .map(|s| slugify(&s.to_string_lossy()))
        .unwrap_or_else(|| "asset".to_string());
    let mask_path = dir.join(format!("{stem}_mask.png"));
    let segmented = config
        .remove_background
        .then(|| dir.join(format!("{stem}.png")));

    debug!(input = %input.display(), backend = %config.backend, "Segmenting");
    let job = MaskJob {
        input: input.clone(),
        raw,
        config: config.clone(),
        mask_path: mask_path.clone(),
        segmented: segmented.clone(),
    };
    let (width, height, coverage) = tokio::task::spawn_blocking(move || job.run())
        .await
        .map_err(|e| SegmentError::Task(e.to_string()))??;

    let elapsed_ms = start.elapsed().as_millis() as u64;
    info!(
        input = %input.display(),
        backend = %config.backend,
        coverage,
        elapsed_ms,
        mask = %mask_path.display(),
        "Segmentation complete"
    );
    Ok(SegmentReport {
        input,
        backend: config.backend,
        model: (config.backend == MaskBackend::Command).then(|| config.model.clone()),
        width,
        height,
        mask: mask_path,
        segmented,
        coverage,
        elapsed_ms,
    })
}

/// Run the configured command; returns the mask it wrote and the directory
/// that holds it.
async fn command_mask(
    input: &Path,
    config: &SegmentConfig,
    device: Device,
) -> Result<(TempDir, PathBuf), SegmentError> {
    let work = tempfile::Builder::new()
        .prefix("promptforge-segment-")
        .tempdir()
        .map_err(io_err(&std::env::temp_dir()))?;
    let output = work.path().join("mask.png");
    let path_str = |p: &Path| p.to_string_lossy().into_owned();

    let argv = config
        .command
        .iter()
        .map(|arg| {
            substitute(arg, |name| {
                Ok::<_, InvokeError>(match name {
                    "input" => Some(path_str(input)),
                    "output" => Some(path_str(&output)),
                    "model" => Some(config.model.clone()),
                    "device" => Some(device.to_string()),
                    _ => None,
                })
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let (program, args) = argv.split_first().ok_or(SegmentError::NoCommand)?;

    debug!(program = %program, ?args, "Running segmentation command");
    run_argv(program, args, work.path(), config.timeout_secs, &output).await?;
    Ok((work, output))
}

/// CPU side of a segmentation, run off the async runtime.
struct MaskJob {
    input: PathBuf,
    raw: Option<(TempDir, PathBuf)>,
    config: SegmentConfig,
    mask_path: PathBuf,
    segmented: Option<PathBuf>,
}

impl MaskJob {
    fn run(self) -> Result<(u32, u32, f64), SegmentError> {
        let image = image::open(&self.input)?.to_rgb8();
        let (w, h) = image.dimensions();

        let raw = match &self.raw {
            Some((_dir, path)) => {
                let mask = image::open(path)?.to_luma8();
                if mask.dimensions() == (w, h) {
                    mask
                } else {
                    image::imageops::resize(&mask, w, h, FilterType::Nearest)
                }
            }
            None => border_mask(&image, self.config.tolerance),
        };

        let kernel = self.config.clean.then_some(self.config.kernel);
        let mask = refine_mask(&raw, self.config.threshold, kernel);
        mask.save(&self.mask_path)?;
        if let Some(path) = &self.segmented {
            apply_mask(&image, &mask).save(path)?;
        }
        Ok((w, h, coverage(&mask)))
    }
}

/// Foreground where any channel differs from the median border colour by
/// more than `tolerance`.
pub fn border_mask(image: &RgbImage, tolerance: u8) -> GrayImage {
    let (w, h) = image.dimensions();
    let mut border = [Vec::new(), Vec::new(), Vec::new()];
    for (x, y, p) in image.enumerate_pixels() {
        if x == 0 || y == 0 || x + 1 == w || y + 1 == h {
            for (channel, values) in border.iter_mut().enumerate() {
                values.push(p[channel]);
            }
        }
    }
    let background: Vec<u8> = border
        .iter_mut()
        .map(|values| {
            values.sort_unstable();
            values.get(values.len() / 2).copied().unwrap_or(0)
        })
        .collect();

    GrayImage::from_fn(w, h, |x, y| {
        let p = image.get_pixel(x, y);
        let far = (0..3).any(|c| p[c].abs_diff(background[c]) > tolerance);
        Luma([if far { 255 } else { 0 }])
    })
}

/// Binarize at `threshold`, then close and open with a `kernel`-sized square
/// when one is given.
pub fn refine_mask(raw: &GrayImage, threshold: u8, kernel: Option<u32>) -> GrayImage {
    let mut mask = GrayImage::from_fn(raw.width(), raw.height(), |x, y| {
        Luma([if raw.get_pixel(x, y)[0] >= threshold { 255 } else { 0 }])
    });
    if let Some(kernel) = kernel {
        let radius = kernel / 2;
        if radius > 0 {
            // Close fills pinholes, open drops specks.
            mask = erode(&dilate(&mask, radius), radius);
            mask = dilate(&erode(&mask, radius), radius);
        }
    }
    mask
}

fn dilate(mask: &GrayImage, radius: u32) -> GrayImage {
    morph(mask, radius, u8::max)
}

fn erode(mask: &GrayImage, radius: u32) -> GrayImage {
    morph(mask, radius, u8::min)
}

/// Separable square-window min/max. The window is clipped at the edges.
fn morph(mask: &GrayImage, radius: u32, pick: fn(u8, u8) -> u8) -> GrayImage {
    let (w, h) = mask.dimensions();
    let span = |i: u32, n: u32| i.saturating_sub(radius)..=(i + radius).min(n - 1);

    let rows = GrayImage::from_fn(w, h, |x, y| {
        let v = span(x, w).map(|sx| mask.get_pixel(sx, y)[0]).reduce(pick);
        Luma([v.unwrap_or(0)])
    });
    GrayImage::from_fn(w, h, |x, y| {
        let v = span(y, h).map(|sy| rows.get_pixel(x, sy)[0]).reduce(pick);
        Luma([v.unwrap_or(0)])
    })
}

/// `image` with masked-out pixels cleared to transparent black.
pub fn apply_mask(image: &RgbImage, mask: &GrayImage) -> RgbaImage {
    RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        if mask.get_pixel(x, y)[0] > 0 {
            let [r, g, b] = image.get_pixel(x, y).0;
            Rgba([r, g, b, 255])
        } else {
            Rgba([0, 0, 0, 0])
        }
    })
}

fn coverage(mask: &GrayImage) -> f64 {
    let total = mask.width() as usize * mask.height() as usize;
    if total == 0 {
        return 0.0;
    }
    let kept = mask.pixels().filter(|p| p[0] > 0).count();
    kept as f64 / total as f64
}
