use image::DynamicImage;
use image::imageops::FilterType;

use crate::error::{HexError, Result};

/// Upper bound on either output dimension.
pub const MAX_UPSCALED_DIMENSION: u32 = 32_768;

/// Resize upward by `factor` with Lanczos interpolation.
///
/// Output dimensions are `round(input × factor)`.
pub fn upscale(image: &DynamicImage, factor: f32) -> Result<DynamicImage> {
    validate_factor(factor)?;

    let (width, height) = scaled_dimensions(image.width(), image.height(), factor)?;
    Ok(image.resize_exact(width, height, FilterType::Lanczos3))
}

pub fn validate_factor(factor: f32) -> Result<()> {
    if !factor.is_finite() || factor <= 1.0 {
        return Err(HexError::invalid_parameter(format!(
            "upscale factor must be greater than 1.0, got {}",
            factor
        )));
    }
    Ok(())
}

pub fn scaled_dimensions(width: u32, height: u32, factor: f32) -> Result<(u32, u32)> {
    let scale = |dim: u32| (dim as f64 * factor as f64).round();
    let (w, h) = (scale(width), scale(height));
    if w > MAX_UPSCALED_DIMENSION as f64 || h > MAX_UPSCALED_DIMENSION as f64 {
        return Err(HexError::invalid_parameter(format!(
            "upscaling {}x{} by {} exceeds the {} pixel limit",
            width, height, factor, MAX_UPSCALED_DIMENSION
        )));
    }
    Ok((w as u32, h as u32))
}
