use std::collections::BTreeMap;
use std::time::Duration;

use image::{DynamicImage, Rgb};
use serde::Serialize;

use crate::detection::enhance::EnhancementLevel;
use crate::error::{ErrorKind, HexError, Stage};

/// Axis-aligned box in pixel coordinates.
///
/// The origin is signed so a box reported partly outside the image can be
/// represented as-is and clipped later by the extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Clip against an image of the given size.
    ///
    /// Returns `(x, y, width, height)` of the visible part, or `None` when
    /// nothing of the box lies inside the image.
    pub fn clamp_to(&self, img_width: u32, img_height: u32) -> Option<(u32, u32, u32, u32)> {
        let left = (self.x as i64).clamp(0, img_width as i64);
        let top = (self.y as i64).clamp(0, img_height as i64);
        let right = self.right().clamp(0, img_width as i64);
        let bottom = self.bottom().clamp(0, img_height as i64);

        if right <= left || bottom <= top {
            return None;
        }

        Some((
            left as u32,
            top as u32,
            (right - left) as u32,
            (bottom - top) as u32,
        ))
    }

    /// Grow the box on every side by `ratio` of its own width/height.
    pub fn padded(&self, ratio: f32) -> Self {
        let pad_x = (self.width as f32 * ratio) as i64;
        let pad_y = (self.height as f32 * ratio) as i64;
        Self {
            x: (self.x as i64 - pad_x).clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            y: (self.y as i64 - pad_y).clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            width: (self.width as i64 + 2 * pad_x).min(u32::MAX as i64) as u32,
            height: (self.height as i64 + 2 * pad_y).min(u32::MAX as i64) as u32,
        }
    }

    /// Map a box from a resized image back by dividing through `scale`.
    pub fn unscaled(&self, scale: f32) -> Self {
        if scale <= 0.0 || (scale - 1.0).abs() < f32::EPSILON {
            return *self;
        }
        Self {
            x: (self.x as f32 / scale).floor() as i32,
            y: (self.y as f32 / scale).floor() as i32,
            width: (self.width as f32 / scale).round() as u32,
            height: (self.height as f32 / scale).round() as u32,
        }
    }
}

/// One candidate hexagon reported by the detection service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    /// Position of this prediction in the service response.
    pub index: usize,
    pub bounding_box: BoundingBox,
    pub confidence: f32,
    pub label: String,
    /// The prediction object exactly as the service returned it.
    pub raw_response_fragment: serde_json::Value,
}

/// Confidence bucket used for overlay colouring and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
}

impl ConfidenceTier {
    /// Tier under the default 0.70 / 0.50 boundaries.
    pub fn from_confidence(confidence: f32) -> Self {
        TierThresholds::default().tier(confidence)
    }

    pub fn color(&self) -> Rgb<u8> {
        match self {
            ConfidenceTier::High => Rgb([0, 255, 0]),
            ConfidenceTier::Medium => Rgb([255, 255, 0]),
            ConfidenceTier::Low => Rgb([255, 0, 0]),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceTier::High => "high",
            ConfidenceTier::Medium => "medium",
            ConfidenceTier::Low => "low",
        }
    }
}

/// Tier boundaries. Both are inclusive lower bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TierThresholds {
    pub high: f32,
    pub medium: f32,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            high: 0.70,
            medium: 0.50,
        }
    }
}

impl TierThresholds {
    pub fn validate(&self) -> Result<(), HexError> {
        let in_range = |v: f32| (0.0..=1.0).contains(&v);
        if !in_range(self.high) || !in_range(self.medium) {
            return Err(HexError::invalid_parameter(format!(
                "tier thresholds must lie in [0, 1], got high={} medium={}",
                self.high, self.medium
            )));
        }
        if self.medium > self.high {
            return Err(HexError::invalid_parameter(format!(
                "medium tier threshold {} exceeds high tier threshold {}",
                self.medium, self.high
            )));
        }
        Ok(())
    }

    pub fn tier(&self, confidence: f32) -> ConfidenceTier {
        if confidence >= self.high {
            ConfidenceTier::High
        } else if confidence >= self.medium {
            ConfidenceTier::Medium
        } else {
            ConfidenceTier::Low
        }
    }
}

/// A cropped hexagon produced from one accepted detection.
#[derive(Debug, Clone)]
pub struct ExtractedHexagon {
    pub detection: Detection,
    pub image: DynamicImage,
    /// 1-based ordinal within the source image.
    pub extraction_index: usize,
    pub tier: ConfidenceTier,
}

impl ExtractedHexagon {
    /// File name used when the crop is written out, e.g. `hexagon_003_conf_87%.png`.
    pub fn file_name(&self) -> String {
        hexagon_file_name(self.extraction_index, self.detection.confidence)
    }
}

pub fn hexagon_file_name(extraction_index: usize, confidence: f32) -> String {
    format!(
        "hexagon_{:03}_conf_{:.0}%.png",
        extraction_index,
        confidence * 100.0
    )
}

/// An accepted detection whose crop was degenerate.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedExtraction {
    pub detection_index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    #[serde(rename = "duration_ms")]
    #[serde(serialize_with = "serialize_millis")]
    pub duration: Duration,
}

pub(crate) fn serialize_millis<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

/// Everything produced for one processed image.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub source_image_id: String,
    /// Every detection the service returned, in response order.
    pub detections: Vec<Detection>,
    /// Indices (into `detections`) of detections at or above the threshold.
    pub accepted: Vec<usize>,
    pub extracted: Vec<ExtractedHexagon>,
    pub skipped: Vec<SkippedExtraction>,
    pub annotated_image: DynamicImage,
    /// The unscaled input with the accepted boxes mapped back onto it.
    pub original_annotated_image: DynamicImage,
    pub processing_duration: Duration,
    pub stage_timings: Vec<StageTiming>,
    pub enhancement_level_used: Option<EnhancementLevel>,
    pub confidence_threshold: f32,
    pub tiers: TierThresholds,
    /// Detector-space size divided by original size.
    pub coordinate_scale: f32,
    /// RFC 3339 timestamp.
    pub processed_at: String,
}

impl DetectionResult {
    pub fn is_accepted(&self, detection_index: usize) -> bool {
        self.accepted.contains(&detection_index)
    }

    pub fn rejected_count(&self) -> usize {
        self.detections.len() - self.accepted.len()
    }
}

/// Why an image produced no result.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub image_id: String,
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
}

impl FailureRecord {
    pub fn new(image_id: impl Into<String>, stage: Stage, error: &HexError) -> Self {
        Self {
            image_id: image_id.into(),
            stage,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl std::fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "image '{}' failed at stage '{}' ({}): {}",
            self.image_id, self.stage, self.kind, self.message
        )
    }
}

#[derive(Debug, Clone)]
pub enum BatchEntry {
    Success(Box<DetectionResult>),
    Failure(FailureRecord),
}

impl BatchEntry {
    pub fn as_success(&self) -> Option<&DetectionResult> {
        match self {
            BatchEntry::Success(result) => Some(result),
            BatchEntry::Failure(_) => None,
        }
    }

    pub fn as_failure(&self) -> Option<&FailureRecord> {
        match self {
            BatchEntry::Success(_) => None,
            BatchEntry::Failure(record) => Some(record),
        }
    }
}

/// Per-image outcomes of one batch run, keyed by image id.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub run_id: uuid::Uuid,
    entries: Vec<(String, BatchEntry)>,
}

impl BatchResult {
    pub fn new(run_id: uuid::Uuid) -> Self {
        Self {
            run_id,
            entries: Vec::new(),
        }
    }

    /// Append an entry. An id can only be recorded once.
    pub fn insert(&mut self, image_id: impl Into<String>, entry: BatchEntry) -> Result<(), HexError> {
        let image_id = image_id.into();
        if self.contains(&image_id) {
            return Err(HexError::invalid_parameter(format!(
                "image '{}' already has a batch entry",
                image_id
            )));
        }
        self.entries.push((image_id, entry));
        Ok(())
    }

    pub fn contains(&self, image_id: &str) -> bool {
        self.entries.iter().any(|(id, _)| id == image_id)
    }

    pub fn get(&self, image_id: &str) -> Option<&BatchEntry> {
        self.entries
            .iter()
            .find(|(id, _)| id == image_id)
            .map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BatchEntry)> {
        self.entries.iter().map(|(id, entry)| (id.as_str(), entry))
    }

    pub fn successes(&self) -> impl Iterator<Item = &DetectionResult> {
        self.entries.iter().filter_map(|(_, entry)| entry.as_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &FailureRecord> {
        self.entries.iter().filter_map(|(_, entry)| entry.as_failure())
    }

    /// Failure counts grouped by error kind.
    pub fn failure_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for failure in self.failures() {
            *counts.entry(failure.kind.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Reorder entries to follow `order`; ids not listed keep their relative order at the end.
    pub(crate) fn sort_by_input_order(&mut self, order: &[String]) {
        self.entries.sort_by_key(|(id, _)| {
            order.iter().position(|o| o == id).unwrap_or(usize::MAX)
        });
    }
}
