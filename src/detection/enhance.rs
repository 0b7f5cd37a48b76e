use std::str::FromStr;

use image::{DynamicImage, RgbImage, imageops};
use serde::{Deserialize, Serialize};

use crate::error::{HexError, Result};

/// Named preset of image-quality transform parameters.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum EnhancementLevel {
    Mild,
    Medium,
    #[default]
    Strong,
    Extreme,
}

/// Fixed parameter set behind an [`EnhancementLevel`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnhancementParams {
    /// Contrast multiplier around the mean luminance (1.0 = unchanged).
    pub contrast: f32,
    /// Brightness multiplier applied after contrast (1.0 = unchanged).
    pub brightness: f32,
    /// Gaussian sigma of the unsharp mask.
    pub sharpen_sigma: f32,
    /// Minimum difference (in intensity levels) the unsharp mask acts on.
    pub sharpen_threshold: i32,
    /// Gaussian sigma of the denoising blur, 0 disables it.
    pub denoise_sigma: f32,
}

impl EnhancementLevel {
    pub const ALL: [EnhancementLevel; 4] = [
        EnhancementLevel::Mild,
        EnhancementLevel::Medium,
        EnhancementLevel::Strong,
        EnhancementLevel::Extreme,
    ];

    pub fn params(&self) -> EnhancementParams {
        match self {
            EnhancementLevel::Mild => EnhancementParams {
                contrast: 1.2,
                brightness: 1.0,
                sharpen_sigma: 0.5,
                sharpen_threshold: 2,
                denoise_sigma: 0.0,
            },
            EnhancementLevel::Medium => EnhancementParams {
                contrast: 1.3,
                brightness: 1.05,
                sharpen_sigma: 0.8,
                sharpen_threshold: 2,
                denoise_sigma: 0.0,
            },
            EnhancementLevel::Strong => EnhancementParams {
                contrast: 1.5,
                brightness: 1.1,
                sharpen_sigma: 1.0,
                sharpen_threshold: 1,
                denoise_sigma: 0.4,
            },
            EnhancementLevel::Extreme => EnhancementParams {
                contrast: 2.0,
                brightness: 1.15,
                sharpen_sigma: 1.5,
                sharpen_threshold: 1,
                denoise_sigma: 0.6,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnhancementLevel::Mild => "mild",
            EnhancementLevel::Medium => "medium",
            EnhancementLevel::Strong => "strong",
            EnhancementLevel::Extreme => "extreme",
        }
    }
}

impl std::fmt::Display for EnhancementLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnhancementLevel {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mild" => Ok(EnhancementLevel::Mild),
            "medium" => Ok(EnhancementLevel::Medium),
            "strong" => Ok(EnhancementLevel::Strong),
            "extreme" => Ok(EnhancementLevel::Extreme),
            other => Err(HexError::invalid_parameter(format!(
                "unknown enhancement level '{}' (expected mild, medium, strong or extreme)",
                other
            ))),
        }
    }
}

/// Apply contrast normalization, sharpening and denoising, in that order.
///
/// The output always has the input's dimensions and is RGB8.
pub fn enhance(image: &DynamicImage, level: EnhancementLevel) -> Result<DynamicImage> {
    if image.width() == 0 || image.height() == 0 {
        return Err(HexError::invalid_parameter(format!(
            "cannot enhance an empty image ({}x{})",
            image.width(),
            image.height()
        )));
    }

    let params = level.params();
    let rgb = image.to_rgb8();

    let normalized = adjust_contrast(&rgb, params.contrast, params.brightness);
    let sharpened = imageops::unsharpen(&normalized, params.sharpen_sigma, params.sharpen_threshold);
    let denoised = if params.denoise_sigma > 0.0 {
        imageops::blur(&sharpened, params.denoise_sigma)
    } else {
        sharpened
    };

    Ok(DynamicImage::ImageRgb8(denoised))
}

/// Scale every channel away from the mean luminance by `contrast`, then by `brightness`.
pub fn adjust_contrast(image: &RgbImage, contrast: f32, brightness: f32) -> RgbImage {
    let mean = mean_luminance(image);

    let mut lut = [0u8; 256];
    for (value, slot) in lut.iter_mut().enumerate() {
        let stretched = mean + contrast * (value as f32 - mean);
        *slot = (stretched * brightness).round().clamp(0.0, 255.0) as u8;
    }

    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            *channel = lut[*channel as usize];
        }
    }
    out
}

fn mean_luminance(image: &RgbImage) -> f32 {
    let count = image.width() as u64 * image.height() as u64;
    if count == 0 {
        return 0.0;
    }
    // ITU-R 601-2 luma, as used by the usual L conversion
    let sum: f64 = image
        .pixels()
        .map(|p| 0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64)
        .sum();
    (sum / count as f64) as f32
}
