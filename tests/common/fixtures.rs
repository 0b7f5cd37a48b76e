use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use hexdetect::{
    ApiCredentials, BoundingBox, Detection, DetectionService, ErrorKind, HexError, PipelineConfig,
};
use image::{DynamicImage, ImageBuffer, Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;

pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
pub const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

/// White canvas of the given size.
pub fn blank_image(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(ImageBuffer::from_pixel(width, height, WHITE))
}

/// Thin black hexagon outline centred at (`cx`, `cy`).
pub fn draw_hexagon(image: &mut RgbImage, cx: f32, cy: f32, radius: f32) {
    let corners: Vec<(f32, f32)> = (0..6)
        .map(|i| {
            let angle = std::f32::consts::PI / 3.0 * i as f32;
            (cx + radius * angle.cos(), cy + radius * angle.sin())
        })
        .collect();
    for i in 0..6 {
        draw_line_segment_mut(image, corners[i], corners[(i + 1) % 6], BLACK);
    }
}

/// Scanned-drawing stand-in: a white sheet with two thin hexagons.
pub fn line_art_image(width: u32, height: u32) -> DynamicImage {
    let mut canvas = ImageBuffer::from_pixel(width, height, WHITE);
    let radius = (width.min(height) as f32) / 6.0;
    draw_hexagon(&mut canvas, width as f32 * 0.3, height as f32 * 0.5, radius);
    draw_hexagon(&mut canvas, width as f32 * 0.7, height as f32 * 0.5, radius);
    DynamicImage::ImageRgb8(canvas)
}

pub fn detection(index: usize, bbox: (i32, i32, u32, u32), confidence: f32) -> Detection {
    Detection {
        index,
        bounding_box: BoundingBox::new(bbox.0, bbox.1, bbox.2, bbox.3),
        confidence,
        label: "hexagon".to_string(),
        raw_response_fragment: serde_json::json!({ "probability": confidence }),
    }
}

pub fn test_credentials() -> ApiCredentials {
    ApiCredentials {
        prediction_key: "test-key".to_string(),
        endpoint: "http://127.0.0.1:9".to_string(),
        project_id: "test-project".to_string(),
        model_name: "DCNE_lowres".to_string(),
    }
}

/// Defaults with fast preprocessing for tests.
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::new(test_credentials());
    config.enhancement_level = None;
    config.thicken = false;
    config
}

#[derive(Debug, Clone)]
pub enum Script {
    Detections(Vec<Detection>),
    Fail(ErrorKind),
}

/// Detection service that answers from a script keyed on image width.
///
/// Widths without a script get an empty detection list.
#[derive(Debug, Clone, Default)]
pub struct ScriptedService {
    scripts: HashMap<u32, Script>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_width(mut self, width: u32, script: Script) -> Self {
        self.scripts.insert(width, script);
        self
    }

    /// Shared call counter, still readable after the service is moved.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl DetectionService for ScriptedService {
    async fn detect(
        &self,
        image: &DynamicImage,
        _credentials: &ApiCredentials,
    ) -> hexdetect::error::Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.scripts.get(&image.width()) {
            Some(Script::Detections(detections)) => Ok(detections.clone()),
            Some(Script::Fail(kind)) => Err(error_of_kind(*kind)),
            None => Ok(Vec::new()),
        }
    }
}

fn error_of_kind(kind: ErrorKind) -> HexError {
    let msg = "scripted failure".to_string();
    match kind {
        ErrorKind::Authentication => HexError::Authentication(msg),
        ErrorKind::ServiceUnavailable => HexError::ServiceUnavailable(msg),
        ErrorKind::InvalidResponse => HexError::InvalidResponse(msg),
        ErrorKind::EmptyRegion => HexError::EmptyRegion(msg),
        ErrorKind::Cancelled => HexError::Cancelled,
        _ => HexError::InvalidParameter(msg),
    }
}
