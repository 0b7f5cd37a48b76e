//! Writing results to disk and collecting input files.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::Context;
use image::codecs::jpeg::JpegEncoder;
use serde::Serialize;
use tracing::{debug, info};

use crate::detection::aggregate::HEXAGON_DIR;
use crate::models::{BatchResult, DetectionResult, FailureRecord};
use crate::orchestrator::ImageInput;

/// File extensions treated as images when scanning a directory.
pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "tiff", "tif"];

const JPEG_QUALITY: u8 = 95;

/// Paths written for one image.
#[derive(Debug, Clone)]
pub struct WrittenResult {
    pub directory: PathBuf,
    pub annotated: PathBuf,
    /// Accepted hexagons drawn on the unscaled input.
    pub original_mapped: PathBuf,
    pub record: PathBuf,
    pub hexagons: Vec<PathBuf>,
}

/// Write the annotated image, the original-space overlay, the crops and the
/// JSON record under `<output_root>/<image_id>/`.
pub fn write_result(output_root: &Path, result: &DetectionResult) -> anyhow::Result<WrittenResult> {
    let id = &result.source_image_id;
    let directory = output_root.join(id);
    let hexagon_dir = directory.join(HEXAGON_DIR);
    std::fs::create_dir_all(&hexagon_dir)
        .with_context(|| format!("Failed to create {}", hexagon_dir.display()))?;

    let annotated = directory.join(format!("annotated_{}.jpg", id));
    write_jpeg(&annotated, &result.annotated_image)?;
    let original_mapped = directory.join(format!("{}_original_mapped.jpg", id));
    write_jpeg(&original_mapped, &result.original_annotated_image)?;

    let mut hexagons = Vec::with_capacity(result.extracted.len());
    for hexagon in &result.extracted {
        let path = hexagon_dir.join(hexagon.file_name());
        hexagon
            .image
            .save(&path)
            .with_context(|| format!("Failed to save {}", path.display()))?;
        hexagons.push(path);
    }

    let record = directory.join(format!("{}_detections.json", id));
    write_json(&record, &result.record())?;

    debug!(image = %id, crops = hexagons.len(), "results written to {}", directory.display());
    Ok(WrittenResult {
        directory,
        annotated,
        original_mapped,
        record,
        hexagons,
    })
}

fn write_jpeg(path: &Path, image: &image::DynamicImage) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let encoder = JpegEncoder::new_with_quality(BufWriter::new(file), JPEG_QUALITY);
    image
        .to_rgb8()
        .write_with_encoder(encoder)
        .with_context(|| format!("Failed to encode {}", path.display()))
}

#[derive(Debug, Serialize)]
struct BatchSummary<'a> {
    run_id: String,
    total: usize,
    successes: Vec<SuccessSummary<'a>>,
    failures: Vec<&'a FailureRecord>,
    failures_by_kind: std::collections::BTreeMap<String, usize>,
}

#[derive(Debug, Serialize)]
struct SuccessSummary<'a> {
    image_id: &'a str,
    detections: usize,
    accepted: usize,
    extracted: usize,
    skipped: usize,
    processing_duration_ms: f64,
}

/// Write `<output_root>/batch_summary.json`.
pub fn write_batch_summary(output_root: &Path, batch: &BatchResult) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(output_root)
        .with_context(|| format!("Failed to create {}", output_root.display()))?;

    let summary = BatchSummary {
        run_id: batch.run_id.to_string(),
        total: batch.len(),
        successes: batch
            .successes()
            .map(|r| SuccessSummary {
                image_id: &r.source_image_id,
                detections: r.detections.len(),
                accepted: r.accepted.len(),
                extracted: r.extracted.len(),
                skipped: r.skipped.len(),
                processing_duration_ms: r.processing_duration.as_secs_f64() * 1000.0,
            })
            .collect(),
        failures: batch.failures().collect(),
        failures_by_kind: batch.failure_counts(),
    };

    let path = output_root.join("batch_summary.json");
    write_json(&path, &summary)?;
    info!("batch summary written to {}", path.display());
    Ok(path)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Expand files, directories and URLs into image inputs.
///
/// Directories are scanned (not recursively) for image extensions and sorted
/// by name. URLs follow the paths in the order given. Repeated ids get the
/// first free numeric suffix (`a`, `a_2`, `a_3`, ...) so ids stay unique.
pub fn collect_inputs(paths: &[PathBuf], urls: &[String]) -> anyhow::Result<Vec<ImageInput>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = std::fs::read_dir(path)
                .with_context(|| format!("Failed to read directory {}", path.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && has_image_extension(p))
                .collect();
            found.sort();
            if found.is_empty() {
                tracing::warn!("no images found in {}", path.display());
            }
            files.extend(found);
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            anyhow::bail!("Input not found: {}", path.display());
        }
    }

    let inputs = files
        .into_iter()
        .map(ImageInput::from_path)
        .chain(urls.iter().map(ImageInput::from_url));
    Ok(unique_ids(inputs))
}

/// Rename inputs whose id is already taken to `<id>_<n>`, using the smallest
/// `n >= 2` that is free among every id handed out so far.
pub fn unique_ids(inputs: impl IntoIterator<Item = ImageInput>) -> Vec<ImageInput> {
    let mut used: HashSet<String> = HashSet::new();
    inputs
        .into_iter()
        .map(|input| {
            if used.insert(input.id().to_string()) {
                return input;
            }
            let mut suffix = 2;
            let id = loop {
                let candidate = format!("{}_{}", input.id(), suffix);
                if used.insert(candidate.clone()) {
                    break candidate;
                }
                suffix += 1;
            };
            input.with_id(id)
        })
        .collect()
}
