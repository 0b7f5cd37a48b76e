use image::DynamicImage;
use tracing::debug;

use crate::error::{HexError, Result};
use crate::models::{BoundingBox, Detection, ExtractedHexagon, SkippedExtraction, TierThresholds};

/// Default crop padding: 10 % of the box on each side.
pub const DEFAULT_CROP_PADDING: f32 = 0.1;

/// Crop the detection's box out of `image`.
///
/// Boxes reaching past the image edge are clipped. Only a clipped box with
/// zero area is an error.
pub fn extract(image: &DynamicImage, detection: &Detection) -> Result<DynamicImage> {
    crop_box(image, &detection.bounding_box)
}

/// Like [`extract`], after growing the box by `padding_ratio` of its size per side.
pub fn extract_with_padding(
    image: &DynamicImage,
    detection: &Detection,
    padding_ratio: f32,
) -> Result<DynamicImage> {
    if !padding_ratio.is_finite() || padding_ratio < 0.0 {
        return Err(HexError::invalid_parameter(format!(
            "crop padding must be a non-negative ratio, got {}",
            padding_ratio
        )));
    }
    crop_box(image, &detection.bounding_box.padded(padding_ratio))
}

fn crop_box(image: &DynamicImage, bbox: &BoundingBox) -> Result<DynamicImage> {
    let (x, y, width, height) = bbox.clamp_to(image.width(), image.height()).ok_or_else(|| {
        HexError::EmptyRegion(format!(
            "box at ({}, {}) size {}x{} has no area inside {}x{} image",
            bbox.x,
            bbox.y,
            bbox.width,
            bbox.height,
            image.width(),
            image.height()
        ))
    })?;

    Ok(image.crop_imm(x, y, width, height))
}

/// Crops for every accepted detection.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub hexagons: Vec<ExtractedHexagon>,
    pub skipped: Vec<SkippedExtraction>,
}

/// Extract every accepted detection in order.
///
/// Empty regions are recorded as skipped instead of failing the image.
/// `extraction_index` counts successful crops only, starting at 1.
pub fn extract_all(
    image: &DynamicImage,
    accepted: &[Detection],
    tiers: &TierThresholds,
    padding_ratio: f32,
) -> Result<Extraction> {
    let mut extraction = Extraction::default();

    for detection in accepted {
        match extract_with_padding(image, detection, padding_ratio) {
            Ok(crop) => {
                let extraction_index = extraction.hexagons.len() + 1;
                extraction.hexagons.push(ExtractedHexagon {
                    detection: detection.clone(),
                    image: crop,
                    extraction_index,
                    tier: tiers.tier(detection.confidence),
                });
            }
            Err(HexError::EmptyRegion(reason)) => {
                debug!(
                    detection = detection.index,
                    "skipping extraction: {}", reason
                );
                extraction.skipped.push(SkippedExtraction {
                    detection_index: detection.index,
                    reason,
                });
            }
            Err(err) => return Err(err),
        }
    }

    Ok(extraction)
}
