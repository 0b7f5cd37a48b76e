//! Merges detections, crops and timing into one [`DetectionResult`].
//!
//! The aggregator owns three outputs: an annotated copy of the detector-input
//! image with every box drawn in its tier colour, a copy of the unscaled input
//! with only the accepted boxes mapped back onto it, and the serializable
//! [`DetectionRecord`] that lists every detection, accepted or not.

use std::collections::BTreeMap;
use std::time::Duration;

use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use serde::Serialize;

use crate::detection::enhance::EnhancementLevel;
use crate::detection::extract::Extraction;
use crate::models::{
    BoundingBox, ConfidenceTier, Detection, DetectionResult, SkippedExtraction, StageTiming,
    TierThresholds, hexagon_file_name, serialize_millis,
};

/// Sub-directory (relative to the image's output directory) holding crops.
pub const HEXAGON_DIR: &str = "hexagons";

/// Minimum outline width in pixels.
const MIN_STROKE: u32 = 3;

/// Outline colour of accepted hexagons on the original-space overlay.
pub const MAPPED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

#[derive(Debug, Clone, Default)]
pub struct Timing {
    pub total: Duration,
    pub stages: Vec<StageTiming>,
}

/// Borrowed inputs to [`aggregate`].
pub struct AggregateInput<'a> {
    pub source_image_id: &'a str,
    /// The image the detections' coordinates refer to.
    pub source_image: &'a DynamicImage,
    /// The unscaled input image. `None` when it is `source_image` itself.
    pub original_image: Option<&'a DynamicImage>,
    pub accepted: &'a [Detection],
    pub rejected: &'a [Detection],
    pub extraction: &'a Extraction,
    pub timing: Timing,
    pub enhancement_level: Option<EnhancementLevel>,
    pub confidence_threshold: f32,
    pub tiers: TierThresholds,
    pub coordinate_scale: f32,
}

pub fn aggregate(input: AggregateInput<'_>) -> DetectionResult {
    let mut detections: Vec<Detection> = input
        .accepted
        .iter()
        .chain(input.rejected.iter())
        .cloned()
        .collect();
    detections.sort_by_key(|d| d.index);

    let mut accepted: Vec<usize> = input.accepted.iter().map(|d| d.index).collect();
    accepted.sort_unstable();

    let annotated_image = annotate(
        input.source_image,
        &detections,
        &input.tiers,
        input.coordinate_scale,
    );
    let original_annotated_image = annotate_original(
        input.original_image.unwrap_or(input.source_image),
        input.accepted,
        input.coordinate_scale,
    );

    DetectionResult {
        source_image_id: input.source_image_id.to_string(),
        detections,
        accepted,
        extracted: input.extraction.hexagons.clone(),
        skipped: input.extraction.skipped.clone(),
        annotated_image,
        original_annotated_image,
        processing_duration: input.timing.total,
        stage_timings: input.timing.stages,
        enhancement_level_used: input.enhancement_level,
        confidence_threshold: input.confidence_threshold,
        tiers: input.tiers,
        coordinate_scale: input.coordinate_scale,
        processed_at: now_rfc3339(),
    }
}

/// Draw every detection on an RGB copy of `image`, coloured by tier.
pub fn annotate(
    image: &DynamicImage,
    detections: &[Detection],
    tiers: &TierThresholds,
    coordinate_scale: f32,
) -> DynamicImage {
    let mut canvas: RgbImage = image.to_rgb8();
    let stroke = MIN_STROKE.max((MIN_STROKE as f32 * coordinate_scale) as u32);

    for detection in detections {
        let color = tiers.tier(detection.confidence).color();
        draw_outline(&mut canvas, &detection.bounding_box, stroke, color);
    }

    DynamicImage::ImageRgb8(canvas)
}

/// Draw the accepted detections on an RGB copy of the unscaled input.
///
/// Boxes are mapped from detector space with
/// [`BoundingBox::unscaled`] and outlined in [`MAPPED_COLOR`].
pub fn annotate_original(
    original: &DynamicImage,
    accepted: &[Detection],
    coordinate_scale: f32,
) -> DynamicImage {
    let mut canvas: RgbImage = original.to_rgb8();
    for detection in accepted {
        let bbox = detection.bounding_box.unscaled(coordinate_scale);
        draw_outline(&mut canvas, &bbox, MIN_STROKE, MAPPED_COLOR);
    }
    DynamicImage::ImageRgb8(canvas)
}

/// Outline `bbox` with nested one-pixel rectangles, `stroke` deep.
fn draw_outline(canvas: &mut RgbImage, bbox: &BoundingBox, stroke: u32, color: Rgb<u8>) {
    let Some(bbox) = drawable_box(bbox, canvas, stroke) else {
        return;
    };

    for inset in 0..stroke {
        let width = bbox.width.saturating_sub(2 * inset);
        let height = bbox.height.saturating_sub(2 * inset);
        if width == 0 || height == 0 {
            break;
        }
        let rect = Rect::at(
            bbox.x.saturating_add(inset as i32),
            bbox.y.saturating_add(inset as i32),
        )
        .of_size(width, height);
        draw_hollow_rect_mut(canvas, rect, color);
    }
}

/// Trim `bbox` to the canvas plus a `stroke` margin, so the visible outline is
/// unchanged but every coordinate stays small. `None` when nothing is visible.
fn drawable_box(bbox: &BoundingBox, canvas: &RgbImage, stroke: u32) -> Option<BoundingBox> {
    let margin = stroke as i64;
    let left = (bbox.x as i64).max(-margin);
    let top = (bbox.y as i64).max(-margin);
    let right = bbox.right().min(canvas.width() as i64 + margin);
    let bottom = bbox.bottom().min(canvas.height() as i64 + margin);

    let outside_x = right <= left.max(0) || left >= canvas.width() as i64;
    let outside_y = bottom <= top.max(0) || top >= canvas.height() as i64;
    if outside_x || outside_y {
        return None;
    }
    Some(BoundingBox::new(
        left as i32,
        top as i32,
        (right - left) as u32,
        (bottom - top) as u32,
    ))
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// JSON record written next to the annotated image.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionRecord {
    pub source_image_id: String,
    pub processed_at: String,
    pub enhancement_level: Option<EnhancementLevel>,
    pub confidence_threshold: f32,
    pub tiers: TierThresholds,
    pub coordinate_scale: f32,
    #[serde(rename = "processing_duration_ms", serialize_with = "serialize_millis")]
    pub processing_duration: Duration,
    pub stage_timings: Vec<StageTiming>,
    pub detections: Vec<DetectionEntry>,
    pub skipped_extractions: Vec<SkippedExtraction>,
    pub summary: DetectionSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionEntry {
    pub index: usize,
    pub label: String,
    pub confidence: f32,
    pub tier: ConfidenceTier,
    pub accepted: bool,
    /// Box in the coordinate space of the image sent to the detection service.
    pub bounding_box: BoundingBox,
    /// Same box mapped back to the unscaled input image.
    pub original_bounding_box: BoundingBox,
    pub extraction_index: Option<usize>,
    /// Crop path relative to the image's output directory.
    pub hexagon_file: Option<String>,
    pub raw_response_fragment: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectionSummary {
    pub total: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub extracted: usize,
    pub skipped: usize,
    pub by_label: BTreeMap<String, usize>,
    pub by_tier: BTreeMap<ConfidenceTier, usize>,
    /// Accepted hexagons per label.
    pub instances: BTreeMap<String, usize>,
    /// Labels accepted more than once on the same image, with their count.
    pub duplicates: BTreeMap<String, usize>,
}

impl DetectionResult {
    /// Build the serializable record for this result.
    pub fn record(&self) -> DetectionRecord {
        let detections: Vec<DetectionEntry> = self
            .detections
            .iter()
            .map(|d| {
                let hexagon = self.extracted.iter().find(|h| h.detection.index == d.index);
                let extraction_index = hexagon.map(|h| h.extraction_index);
                DetectionEntry {
                    index: d.index,
                    label: d.label.clone(),
                    confidence: d.confidence,
                    tier: self.tiers.tier(d.confidence),
                    accepted: self.is_accepted(d.index),
                    bounding_box: d.bounding_box,
                    original_bounding_box: d.bounding_box.unscaled(self.coordinate_scale),
                    extraction_index,
                    hexagon_file: extraction_index.map(|idx| {
                        format!("{}/{}", HEXAGON_DIR, hexagon_file_name(idx, d.confidence))
                    }),
                    raw_response_fragment: d.raw_response_fragment.clone(),
                }
            })
            .collect();

        let mut summary = DetectionSummary {
            total: self.detections.len(),
            accepted: self.accepted.len(),
            rejected: self.rejected_count(),
            extracted: self.extracted.len(),
            skipped: self.skipped.len(),
            ..Default::default()
        };
        for entry in &detections {
            *summary.by_label.entry(entry.label.clone()).or_insert(0) += 1;
            *summary.by_tier.entry(entry.tier).or_insert(0) += 1;
            if entry.accepted {
                *summary.instances.entry(entry.label.clone()).or_insert(0) += 1;
            }
        }
        summary.duplicates = summary
            .instances
            .iter()
            .filter(|&(_, &count)| count > 1)
            .map(|(label, &count)| (label.clone(), count))
            .collect();

        DetectionRecord {
            source_image_id: self.source_image_id.clone(),
            processed_at: self.processed_at.clone(),
            enhancement_level: self.enhancement_level_used,
            confidence_threshold: self.confidence_threshold,
            tiers: self.tiers,
            coordinate_scale: self.coordinate_scale,
            processing_duration: self.processing_duration,
            stage_timings: self.stage_timings.clone(),
            detections,
            skipped_extractions: self.skipped.clone(),
            summary,
        }
    }
}
