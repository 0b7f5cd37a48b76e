//! Runs the full pipeline on a generated drawing with a local stand-in for
//! the detection service, then writes the usual output files.
//!
//! cargo run --example offline_pipeline -- [OUTPUT_DIR]

use std::path::PathBuf;

use hexdetect::{
    ApiCredentials, BoundingBox, CancellationFlag, Detection, DetectionService, ImageInput,
    LogProgress, Orchestrator, PipelineConfig, logging, output,
};
use image::{DynamicImage, ImageBuffer, Rgb};
use imageproc::drawing::draw_line_segment_mut;

/// Centres and radius of the hexagons drawn on the sheet.
const HEXAGONS: [(f32, f32); 3] = [(120.0, 120.0), (320.0, 140.0), (220.0, 300.0)];
const RADIUS: f32 = 50.0;

/// Reports a box around each drawn hexagon plus one low-confidence false hit.
struct KnownShapes;

impl DetectionService for KnownShapes {
    async fn detect(
        &self,
        image: &DynamicImage,
        _credentials: &ApiCredentials,
    ) -> hexdetect::error::Result<Vec<Detection>> {
        let scale = image.width() as f32 / 440.0;
        let mut detections: Vec<Detection> = HEXAGONS
            .iter()
            .enumerate()
            .map(|(index, &(cx, cy))| {
                let size = (2.0 * RADIUS * scale) as u32;
                Detection {
                    index,
                    bounding_box: BoundingBox::new(
                        ((cx - RADIUS) * scale) as i32,
                        ((cy - RADIUS) * scale) as i32,
                        size,
                        size,
                    ),
                    confidence: 0.95 - 0.2 * index as f32,
                    label: "hexagon".to_string(),
                    raw_response_fragment: serde_json::Value::Null,
                }
            })
            .collect();
        detections.push(Detection {
            index: detections.len(),
            bounding_box: BoundingBox::new(0, 0, (60.0 * scale) as u32, (40.0 * scale) as u32),
            confidence: 0.2,
            label: "hexagon".to_string(),
            raw_response_fragment: serde_json::Value::Null,
        });
        Ok(detections)
    }
}

fn drawing() -> DynamicImage {
    let mut canvas = ImageBuffer::from_pixel(440, 400, Rgb([250u8, 250, 245]));
    for &(cx, cy) in &HEXAGONS {
        let corners: Vec<(f32, f32)> = (0..6)
            .map(|i| {
                let angle = std::f32::consts::FRAC_PI_3 * i as f32;
                (cx + RADIUS * angle.cos(), cy + RADIUS * angle.sin())
            })
            .collect();
        for i in 0..6 {
            draw_line_segment_mut(&mut canvas, corners[i], corners[(i + 1) % 6], Rgb([40, 40, 40]));
        }
    }
    DynamicImage::ImageRgb8(canvas)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing(false);

    let output_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("hexdetect-demo"));

    let credentials = ApiCredentials {
        prediction_key: "offline".to_string(),
        endpoint: "http://localhost".to_string(),
        project_id: "demo".to_string(),
        model_name: "DCNE_lowres".to_string(),
    };
    let mut config = PipelineConfig::new(credentials);
    config.upscale_factor = Some(1.5);

    let orchestrator = Orchestrator::new(KnownShapes, config)?.with_progress(LogProgress);
    let batch = orchestrator
        .run_batch(
            vec![ImageInput::from_image("demo-sheet", drawing())],
            &CancellationFlag::new(),
        )
        .await?;

    for result in batch.successes() {
        let written = output::write_result(&output_dir, result)?;
        println!(
            "{}: {} detections, {} hexagons saved to {} (overlay on the original: {})",
            result.source_image_id,
            result.detections.len(),
            written.hexagons.len(),
            written.directory.display(),
            written.original_mapped.display()
        );
    }
    output::write_batch_summary(&output_dir, &batch)?;
    Ok(())
}
