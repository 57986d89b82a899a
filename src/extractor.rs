//! Embedding extractor boundary.
//!
//! Extractors are constructed once per process and shared behind an `Arc`.
//! Failure is `None`, never a sentinel vector and never a panic across the boundary.

use image::imageops::{self, FilterType};
use tracing::debug;

/// Maps encoded image bytes to a fixed-length feature vector.
///
/// Implementations must decode common encodings to RGB before embedding and must
/// return the same dimensionality for every successful call. Anything not safe to
/// call from several threads at once has to serialize itself internally.
pub trait EmbeddingExtractor: Send + Sync {
    fn extract(&self, image: &[u8]) -> Option<Vec<f32>>;
}

impl<F> EmbeddingExtractor for F
where
    F: Fn(&[u8]) -> Option<Vec<f32>> + Send + Sync,
{
    fn extract(&self, image: &[u8]) -> Option<Vec<f32>> {
        self(image)
    }
}

/// Keypoints and their descriptors from a local-feature detector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalFeatures {
    pub locations: Vec<[f32; 2]>,
    pub descriptors: Vec<Vec<f32>>,
}

/// Secondary detector consulted at ingest time only. Matching never reads its output.
pub trait LocalFeatureExtractor: Send + Sync {
    fn extract(&self, image: &[u8]) -> Option<LocalFeatures>;
}

impl<F> LocalFeatureExtractor for F
where
    F: Fn(&[u8]) -> Option<LocalFeatures> + Send + Sync,
{
    fn extract(&self, image: &[u8]) -> Option<LocalFeatures> {
        self(image)
    }
}

pub const INPUT_SIZE: u32 = 224;
const GRID: u32 = 8;
const CELL: u32 = INPUT_SIZE / GRID;
const HIST_BINS: usize = 16;

/// Output length of [`ColorLayoutExtractor`].
pub const COLOR_LAYOUT_DIM: usize = (GRID * GRID * 3) as usize + 3 * HIST_BINS;

// ImageNet channel statistics
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Deterministic pixel-statistics embedding.
///
/// Resizes to 224x224, normalizes each channel with the ImageNet mean/std, then
/// emits per-cell channel means over an 8x8 grid followed by a 16-bin histogram per
/// channel. Used when no learned backbone is plugged in.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColorLayoutExtractor;

impl ColorLayoutExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn dimension(&self) -> usize {
        COLOR_LAYOUT_DIM
    }
}

impl EmbeddingExtractor for ColorLayoutExtractor {
    fn extract(&self, image: &[u8]) -> Option<Vec<f32>> {
        if image.is_empty() {
            return None;
        }
        let decoded = match image::load_from_memory(image) {
            Ok(img) => img,
            Err(e) => {
                debug!("Image decode failed: {}", e);
                return None;
            }
        };
        if decoded.width() == 0 || decoded.height() == 0 {
            return None;
        }

        let rgb = decoded.to_rgb8();
        let resized = imageops::resize(&rgb, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);

        let mut cells = vec![0.0f32; (GRID * GRID * 3) as usize];
        let mut hist = vec![0.0f32; 3 * HIST_BINS];

        for (x, y, pixel) in resized.enumerate_pixels() {
            let cell = ((y / CELL) * GRID + (x / CELL)) as usize;
            for (c, &value) in pixel.0.iter().enumerate() {
                let normalized = (value as f32 / 255.0 - MEAN[c]) / STD[c];
                cells[cell * 3 + c] += normalized;
                hist[c * HIST_BINS + value as usize * HIST_BINS / 256] += 1.0;
            }
        }

        let per_cell = (CELL * CELL) as f32;
        let total = (INPUT_SIZE * INPUT_SIZE) as f32;
        cells.iter_mut().for_each(|v| *v /= per_cell);
        hist.iter_mut().for_each(|v| *v /= total);

        cells.extend(hist);
        Some(cells)
    }
}
