//! Image preprocessing for OCR models
//!
//! Handles image resizing, normalization, and tensor conversion for PaddleOCR models.

use anyhow::{bail, Result};
use image::{imageops, imageops::FilterType, RgbImage};
use ndarray::{s, Array3, Array4, ArrayView3};

/// Preprocessing configuration
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    /// Longest side allowed for the detection input (larger images are scaled down)
    pub det_limit_side_len: u32,
    /// Mean values for detection normalization [R, G, B]
    pub det_mean: [f32; 3],
    /// Std values for detection normalization [R, G, B]
    pub det_std: [f32; 3],
    /// Target height for recognition model
    pub rec_target_height: u32,
    /// Minimum (padded) width for recognition
    pub rec_min_width: u32,
    /// Maximum width for recognition
    pub rec_max_width: u32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            det_limit_side_len: 960,
            // DBNet was trained with ImageNet statistics
            det_mean: [0.485, 0.456, 0.406],
            det_std: [0.229, 0.224, 0.225],
            rec_target_height: 48,
            rec_min_width: 320,
            rec_max_width: 1280,
        }
    }
}

/// Recognition models expect (pixel / 255 - 0.5) / 0.5, i.e. [-1, 1]
const REC_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
const REC_STD: [f32; 3] = [0.5, 0.5, 0.5];

/// Detection model input together with the size it was resized to
#[derive(Debug)]
pub struct DetectionInput {
    /// NCHW tensor
    pub tensor: Array4<f32>,
    /// Resized width
    pub width: u32,
    /// Resized height
    pub height: u32,
}

/// Build an RGB image from an `(H, W, C)` pixel array, dropping alpha
pub fn rgb_from_array(image: ArrayView3<u8>) -> Result<RgbImage> {
    let (height, width, channels) = image.dim();
    if channels != 3 && channels != 4 {
        bail!("Expected an RGB or RGBA array, got {} channels", channels);
    }
    if width == 0 || height == 0 {
        bail!("Invalid image dimensions: {}x{}", width, height);
    }

    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        image::Rgb([image[[y, x, 0]], image[[y, x, 1]], image[[y, x, 2]]])
    }))
}

/// Convert an RGB image to an HWC f32 array in 0-1
pub fn rgb_to_f32(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    let mut rgb = Array3::<f32>::zeros((height as usize, width as usize, 3));

    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            rgb[[y as usize, x as usize, c]] = pixel[c] as f32 / 255.0;
        }
    }

    rgb
}

/// Normalize image with mean and std
pub fn normalize(image: &Array3<f32>, mean: &[f32; 3], std: &[f32; 3]) -> Array3<f32> {
    let mut normalized = image.clone();

    for ((_, _, c), value) in normalized.indexed_iter_mut() {
        *value = (*value - mean[c]) / std[c];
    }

    normalized
}

/// Convert HWC image to NCHW tensor (batch size 1)
pub fn hwc_to_nchw(image: &Array3<f32>) -> Array4<f32> {
    let (h, w, c) = image.dim();
    let mut tensor = Array4::<f32>::zeros((1, c, h, w));

    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                tensor[[0, ch, y, x]] = image[[y, x, ch]];
            }
        }
    }

    tensor
}

/// Size the detection input: longest side capped at `limit`, both sides
/// rounded to a multiple of 32 (required by the model)
pub fn detection_size(width: u32, height: u32, limit: u32) -> (u32, u32) {
    let longest = width.max(height) as f32;
    let ratio = if longest > limit as f32 {
        limit as f32 / longest
    } else {
        1.0
    };

    let round32 = |side: u32| {
        let scaled = (side as f32 * ratio).round();
        (((scaled / 32.0).round() as u32) * 32).max(32)
    };

    (round32(width), round32(height))
}

/// Full preprocessing pipeline for detection
pub fn preprocess_for_detection(image: &RgbImage, config: &PreprocessConfig) -> DetectionInput {
    let (width, height) = image.dimensions();
    let (resize_w, resize_h) = detection_size(width, height, config.det_limit_side_len);

    // 1. Resize to multiples of 32
    let resized = imageops::resize(image, resize_w, resize_h, FilterType::Triangle);

    // 2. Normalize
    let normalized = normalize(&rgb_to_f32(&resized), &config.det_mean, &config.det_std);

    // 3. Convert to NCHW tensor
    DetectionInput {
        tensor: hwc_to_nchw(&normalized),
        width: resize_w,
        height: resize_h,
    }
}

/// Crop the axis-aligned bounds of a polygon, clamped to the image
pub fn crop_polygon(image: &RgbImage, polygon: &[(f32, f32); 4]) -> Option<RgbImage> {
    let (img_w, img_h) = image.dimensions();

    let min_x = polygon.iter().map(|p| p.0).fold(f32::INFINITY, f32::min);
    let min_y = polygon.iter().map(|p| p.1).fold(f32::INFINITY, f32::min);
    let max_x = polygon.iter().map(|p| p.0).fold(f32::NEG_INFINITY, f32::max);
    let max_y = polygon.iter().map(|p| p.1).fold(f32::NEG_INFINITY, f32::max);

    let x1 = min_x.max(0.0) as u32;
    let y1 = min_y.max(0.0) as u32;
    let x2 = (max_x.ceil().max(0.0) as u32).min(img_w);
    let y2 = (max_y.ceil().max(0.0) as u32).min(img_h);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    Some(imageops::crop_imm(image, x1, y1, x2 - x1, y2 - y1).to_image())
}

/// Full preprocessing pipeline for recognition
///
/// Fixed height, width following the aspect ratio, zero-padded on the right
/// up to `rec_min_width`.
pub fn preprocess_for_recognition(image: &RgbImage, config: &PreprocessConfig) -> Array4<f32> {
    let (w, h) = image.dimensions();
    let target_h = config.rec_target_height;

    // 1. Resize to fixed height
    let ratio = w as f32 / h.max(1) as f32;
    let resized_w = ((target_h as f32 * ratio).ceil() as u32).clamp(1, config.rec_max_width);
    let resized = imageops::resize(image, resized_w, target_h, FilterType::Triangle);

    // 2. Normalize
    let normalized = normalize(&rgb_to_f32(&resized), &REC_MEAN, &REC_STD);

    // 3. Pad to the minimum width
    let padded_w = resized_w.max(config.rec_min_width) as usize;
    let mut padded = Array3::<f32>::zeros((target_h as usize, padded_w, 3));
    padded
        .slice_mut(s![.., ..resized_w as usize, ..])
        .assign(&normalized);

    // 4. Convert to NCHW tensor
    hwc_to_nchw(&padded)
}
