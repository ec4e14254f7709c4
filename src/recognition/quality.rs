use crate::recognition::BBox;
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use serde::Serialize;

/// Side length a face needs for full size credit
const FULL_SIZE_PX: f32 = 112.0;
/// Crops smaller than this are upscaled before measuring sharpness
const MIN_SHARPNESS_SIDE: u32 = 32;
const SHARPNESS_RESAMPLE: u32 = 64;

const SHARPNESS_WEIGHT: f32 = 0.6;
const SIZE_WEIGHT: f32 = 0.25;
const FRAMING_WEIGHT: f32 = 0.15;

/// Usability of a face crop, independent of who it is
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct QualityReport {
    /// Weighted combination in [0, 1]
    pub score: f32,
    /// Variance of the Laplacian of the grey crop
    pub laplacian_variance: f32,
    pub sharpness_score: f32,
    pub size_score: f32,
    /// Share of the detector box that lies inside the frame
    pub framing_score: f32,
    /// Mean luminance in [0, 1]
    pub brightness: f32,
}

impl QualityReport {
    pub fn is_low(&self, threshold: f32) -> bool {
        self.score < threshold
    }
}

/// Score the face at `raw_bbox` (detector coordinates, possibly outside the
/// frame).
pub fn assess(frame: &RgbImage, raw_bbox: &BBox) -> QualityReport {
    let bbox = raw_bbox.clamp(frame.width(), frame.height());
    if bbox.is_empty() {
        return QualityReport::default();
    }

    let crop = imageops::crop_imm(
        frame,
        bbox.x1 as u32,
        bbox.y1 as u32,
        bbox.width() as u32,
        bbox.height() as u32,
    )
    .to_image();
    let mut gray: GrayImage = imageops::grayscale(&crop);

    let brightness = if gray.is_empty() {
        0.0
    } else {
        gray.pixels().map(|p| p[0] as f64).sum::<f64>() as f32
            / (gray.len() as f32 * 255.0)
    };

    if gray.width() < MIN_SHARPNESS_SIDE || gray.height() < MIN_SHARPNESS_SIDE {
        gray = imageops::resize(&gray, SHARPNESS_RESAMPLE, SHARPNESS_RESAMPLE, FilterType::Triangle);
    }
    let laplacian_variance = laplacian_variance(&gray);
    let sharpness_score = normalize_sharpness(laplacian_variance);

    let size_score = (bbox.width().min(bbox.height()) as f32 / FULL_SIZE_PX).min(1.0);

    let raw_area = raw_bbox.area();
    let framing_score = if raw_area > 0 {
        (bbox.area() as f32 / raw_area as f32).min(1.0)
    } else {
        0.0
    };

    let score = (SHARPNESS_WEIGHT * sharpness_score
        + SIZE_WEIGHT * size_score
        + FRAMING_WEIGHT * framing_score)
        .clamp(0.0, 1.0);

    QualityReport {
        score,
        laplacian_variance,
        sharpness_score,
        size_score,
        framing_score,
        brightness,
    }
}

/// Variance of the 4-neighbour Laplacian over interior pixels
pub fn laplacian_variance(gray: &GrayImage) -> f32 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let px = |x: u32, y: u32| gray.get_pixel(x, y)[0] as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut n = 0.0;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            sum += lap;
            sum_sq += lap * lap;
            n += 1.0;
        }
    }

    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0) as f32
}

/// Piecewise mapping of Laplacian variance onto [0, 1]
pub fn normalize_sharpness(variance: f32) -> f32 {
    let score = if variance > 100.0 {
        0.9 + (variance - 100.0).min(200.0) / 200.0 * 0.1
    } else if variance > 30.0 {
        0.5 + (variance - 30.0) / 70.0 * 0.4
    } else if variance > 10.0 {
        0.2 + (variance - 10.0) / 20.0 * 0.3
    } else {
        variance.max(0.0) / 10.0 * 0.2
    };
    score.clamp(0.0, 1.0)
}
