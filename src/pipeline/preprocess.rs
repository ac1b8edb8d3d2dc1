//! Photo normalization before vision analysis.
//!
//! Contractor uploads arrive at wildly varying sizes and quality. Each image
//! is decoded, bounded in size, contrast-stretched when flat, and re-encoded
//! as JPEG. Quality problems (blank, dark, low contrast) become warnings on
//! the enhanced copy — the original is never touched.

use std::io::Cursor;

use image::imageops::FilterType;
use image::ImageFormat;

use super::AnalysisError;

/// Reject inputs above this size before decoding. Guards against OOM on
/// corrupt or adversarial files.
const MAX_IMAGE_BYTES: usize = 25 * 1024 * 1024;

/// Smallest plausible encoded image (a valid PNG header alone is ~67 bytes).
const MIN_IMAGE_BYTES: usize = 64;

/// Longest edge after normalization. Vision models downsample anyway;
/// shipping more pixels only burns upload time.
const MAX_DIMENSION: u32 = 1280;

/// Luma spread below which the image is considered flat and stretched.
const LOW_CONTRAST_SPREAD: u8 = 40;

/// Mean luma below which the image is flagged as very dark.
const DARK_MEAN: f32 = 30.0;

/// Mean luma above which the image is flagged as likely blank.
const BLANK_MEAN: f32 = 245.0;

/// A normalized copy of an input image, ready for the vision analyzer.
#[derive(Debug, Clone)]
pub struct EnhancedImage {
    pub data: Vec<u8>,
    pub mime_type: String,
    pub warnings: Vec<String>,
}

/// Decode, normalize, and re-encode an image. Fails only for inputs that
/// cannot be decoded at all; quality problems degrade to warnings.
pub fn preprocess_image(bytes: &[u8]) -> Result<EnhancedImage, AnalysisError> {
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(AnalysisError::Image(format!(
            "image too large: {} bytes (max {MAX_IMAGE_BYTES})",
            bytes.len()
        )));
    }
    if bytes.len() < MIN_IMAGE_BYTES {
        return Err(AnalysisError::Image(format!(
            "image too small to be valid: {} bytes",
            bytes.len()
        )));
    }

    let decoded = image::load_from_memory(bytes)
        .map_err(|e| AnalysisError::Image(format!("failed to decode image: {e}")))?;

    let mut warnings = Vec::new();
    let (mean, min, max) = luma_stats(&decoded);

    if mean <= DARK_MEAN {
        warnings.push("image is very dark; analysis quality may suffer".to_string());
    }
    let spread = max.saturating_sub(min);
    if mean >= BLANK_MEAN && spread < LOW_CONTRAST_SPREAD {
        warnings.push("image appears blank".to_string());
    }

    let mut normalized = if spread < LOW_CONTRAST_SPREAD {
        warnings.push("low contrast; applied contrast stretch".to_string());
        decoded.adjust_contrast(25.0)
    } else {
        decoded
    };

    if normalized.width() > MAX_DIMENSION || normalized.height() > MAX_DIMENSION {
        normalized = normalized.resize(MAX_DIMENSION, MAX_DIMENSION, FilterType::Triangle);
    }

    let mut buf = Cursor::new(Vec::new());
    normalized
        .write_to(&mut buf, ImageFormat::Jpeg)
        .map_err(|e| AnalysisError::Image(format!("failed to encode image: {e}")))?;

    tracing::debug!(
        in_bytes = bytes.len(),
        out_bytes = buf.get_ref().len(),
        width = normalized.width(),
        height = normalized.height(),
        warnings = warnings.len(),
        "image preprocessed"
    );

    Ok(EnhancedImage {
        data: buf.into_inner(),
        mime_type: "image/jpeg".to_string(),
        warnings,
    })
}

/// Mean, min, and max luma over a subsample of pixels.
fn luma_stats(img: &image::DynamicImage) -> (f32, u8, u8) {
    let gray = img.to_luma8();
    let mut sum: u64 = 0;
    let mut min = u8::MAX;
    let mut max = u8::MIN;
    let mut count: u64 = 0;

    // Sampling every 4th pixel is plenty for a quality estimate.
    for (i, p) in gray.pixels().enumerate() {
        if i % 4 != 0 {
            continue;
        }
        let v = p.0[0];
        sum += v as u64;
        min = min.min(v);
        max = max.max(v);
        count += 1;
    }

    if count == 0 {
        return (0.0, 0, 0);
    }
    (sum as f32 / count as f32, min, max)
}
