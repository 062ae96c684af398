//! Normal maps derived from depth maps.
//!
//! Depth is read as grayscale in 0.0..=1.0, optionally Gaussian blurred
//! (kernel `2r+1`), differentiated with 3×3 Sobel kernels and turned into
//! `normalize(-gx·s, -gy·s, 1)`, stored as `(n + 1) · 127.5` per channel.
//! Borders reflect without repeating the edge pixel (`dcb|abcd|cba`).

use std::path::PathBuf;

use async_trait::async_trait;
use image::{GrayImage, Rgb, RgbImage};
use tracing::debug;

use super::{BackendKind, InvokeError, Invoker, StageInput};
use crate::config::NormalConfig;
use crate::request::OutputKind;

pub struct SobelInvoker {
    config: NormalConfig,
}

impl SobelInvoker {
    pub fn new(config: NormalConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Invoker for SobelInvoker {
    fn backend(&self) -> BackendKind {
        BackendKind::Sobel
    }

    fn supports(&self, kind: OutputKind) -> bool {
        kind == OutputKind::Normal
    }

    async fn invoke(&self, kind: OutputKind, input: &StageInput<'_>) -> Result<PathBuf, InvokeError> {
        if kind != OutputKind::Normal {
            return Err(InvokeError::Unsupported {
                kind,
                backend: BackendKind::Sobel,
            });
        }
        let depth_path = input.upstream(kind, OutputKind::Depth)?.to_path_buf();
        let output = input.output_path(kind, "png");
        let NormalConfig {
            strength,
            blur_radius,
        } = self.config.clone();

        debug!(strength, blur_radius, depth = %depth_path.display(), "Deriving normal map");
        let target = output.clone();
        tokio::task::spawn_blocking(move || -> Result<(), InvokeError> {
            let depth = image::open(&depth_path)?.to_luma8();
            compute_normal_map(&depth, strength, blur_radius).save(&target)?;
            Ok(())
        })
        .await
        .map_err(|e| InvokeError::Backend(format!("normal map task failed: {e}")))??;

        Ok(output)
    }
}

/// Normal map for a grayscale depth image.
pub fn compute_normal_map(depth: &GrayImage, strength: f32, blur_radius: u32) -> RgbImage {
    let (w, h) = depth.dimensions();
    let mut field = Field {
        w: w as usize,
        h: h as usize,
        data: depth.pixels().map(|p| p[0] as f32 / 255.0).collect(),
    };
    if blur_radius > 0 {
        field = gaussian_blur(&field, 2 * blur_radius as usize + 1);
    }

    RgbImage::from_fn(w, h, |x, y| {
        let (x, y) = (x as isize, y as isize);
        let at = |dx: isize, dy: isize| field.get(x + dx, y + dy);
        let gx = (at(1, -1) + 2.0 * at(1, 0) + at(1, 1)) - (at(-1, -1) + 2.0 * at(-1, 0) + at(-1, 1));
        let gy = (at(-1, 1) + 2.0 * at(0, 1) + at(1, 1)) - (at(-1, -1) + 2.0 * at(0, -1) + at(1, -1));

        let nx = -gx * strength;
        let ny = -gy * strength;
        let len = (nx * nx + ny * ny + 1.0).sqrt();
        let encode = |c: f32| ((c / len + 1.0) * 127.5) as u8;
        Rgb([encode(nx), encode(ny), encode(1.0)])
    })
}

/// Row-major f32 plane with reflect-101 sampling.
struct Field {
    w: usize,
    h: usize,
    data: Vec<f32>,
}

impl Field {
    fn get(&self, x: isize, y: isize) -> f32 {
        self.data[reflect(y, self.h) * self.w + reflect(x, self.w)]
    }
}

fn reflect(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let n = n as isize;
    let period = 2 * (n - 1);
    let mut i = i.rem_euclid(period);
    if i >= n {
        i = period - i;
    }
    i as usize
}

/// Separable blur with the sigma OpenCV derives from a kernel size.
fn gaussian_blur(field: &Field, ksize: usize) -> Field {
    let sigma = 0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let half = (ksize / 2) as isize;
    let mut kernel: Vec<f32> = (-half..=half)
        .map(|i| (-(i * i) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);

    let pass = |src: &Field, horizontal: bool| -> Field {
        let mut data = Vec::with_capacity(src.data.len());
        for y in 0..src.h as isize {
            for x in 0..src.w as isize {
                let acc = kernel.iter().enumerate().fold(0.0, |acc, (k, weight)| {
                    let offset = k as isize - half;
                    let v = if horizontal {
                        src.get(x + offset, y)
                    } else {
                        src.get(x, y + offset)
                    };
                    acc + v * weight
                });
                data.push(acc);
            }
        }
        Field {
            w: src.w,
            h: src.h,
            data,
        }
    };

    pass(&pass(field, true), false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_flat_depth_points_straight_up() {
        let depth = GrayImage::from_pixel(16, 16, Luma([128]));
        let normal = compute_normal_map(&depth, 1.0, 0);
        assert!(normal.pixels().all(|p| *p == Rgb([127, 127, 255])));
    }

    #[test]
    fn test_ramp_tilts_against_gradient() {
        // Depth increases to the right, so the normal leans towards -x.
        let depth = GrayImage::from_fn(16, 16, |x, _| Luma([(x * 16) as u8]));
        let normal = compute_normal_map(&depth, 4.0, 0);
        let p = normal.get_pixel(8, 8);
        assert!(p[0] < 127, "red channel should drop, got {:?}", p);
        assert_eq!(p[1], 127);
        assert!(p[2] < 255);
    }

    #[test]
    fn test_blur_softens_step() {
        let depth = GrayImage::from_fn(32, 8, |x, _| Luma([if x < 16 { 0 } else { 255 }]));
        let sharp = compute_normal_map(&depth, 1.0, 0);
        let soft = compute_normal_map(&depth, 1.0, 3);
        // Far from the step the sharp map is flat, the blurred one is not.
        assert_eq!(sharp.get_pixel(12, 4)[0], 127);
        assert!(soft.get_pixel(13, 4)[0] < 127);
    }

    #[test]
    fn test_reflect_101() {
        assert_eq!(reflect(-1, 5), 1);
        assert_eq!(reflect(5, 5), 3);
        assert_eq!(reflect(2, 5), 2);
        assert_eq!(reflect(-3, 1), 0);
    }
}
