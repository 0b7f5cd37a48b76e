use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{AtStage, HexError, Stage, StageError};

/// Data that flows through the preprocessing pipeline
#[derive(Clone)]
pub struct PipelineData {
    /// Identifier of the source image (used for debug file names and logs)
    pub image_id: String,

    /// The current image, replaced by each step
    pub image: DynamicImage,

    /// The image as loaded, before any step ran (shared efficiently via Arc)
    pub original: Arc<DynamicImage>,
}

impl PipelineData {
    pub fn from_image(image_id: impl Into<String>, image: DynamicImage) -> Self {
        let original = Arc::new(image.clone());
        Self {
            image_id: image_id.into(),
            image,
            original,
        }
    }

    /// Width of the current image relative to the original one.
    pub fn coordinate_scale(&self) -> f32 {
        if self.original.width() == 0 {
            return 1.0;
        }
        self.image.width() as f32 / self.original.width() as f32
    }
}

/// Debug configuration for pipeline execution
#[derive(Clone, Debug)]
pub struct DebugConfig {
    /// Root directory for debug outputs
    pub output_dir: PathBuf,
}

impl DebugConfig {
    /// Save `image` as `<NN>_<step>/<image_id>.png`.
    fn save(&self, step_index: usize, step_name: &str, image_id: &str, image: &DynamicImage) -> Result<(), HexError> {
        let step_dir_name = format!(
            "{:02}_{}",
            step_index,
            step_name.to_lowercase().replace(' ', "_")
        );
        let step_dir = self.output_dir.join(&step_dir_name);
        std::fs::create_dir_all(&step_dir)?;

        let filename = format!("{}.png", sanitize_id(image_id));
        image.save(step_dir.join(&filename))?;
        debug!("debug output saved to {}/{}", step_dir_name, filename);
        Ok(())
    }
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Context available to all pipeline steps
#[derive(Clone, Default)]
pub struct PipelineContext {
    pub debug: Option<DebugConfig>,
}

/// Trait that all preprocessing steps implement
///
/// A step takes the current image and returns a new one; it never mutates its input.
pub trait PipelineStep: Send + Sync {
    fn process(&self, image: &DynamicImage, context: &PipelineContext) -> Result<DynamicImage, HexError>;

    /// Human-readable name for this step (used in logs and debug directories)
    fn name(&self) -> &str;

    /// Stage reported in failures and timings
    fn stage(&self) -> Stage;
}

/// Composable preprocessing pipeline
#[derive(Clone, Default)]
pub struct Pipeline {
    steps: Vec<Arc<dyn PipelineStep>>,
    context: PipelineContext,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable debug mode with output directory
    /// The directory must be empty or non-existent
    pub fn with_debug(mut self, output_dir: PathBuf) -> Result<Self, HexError> {
        prepare_debug_dir(&output_dir)?;
        self.context.debug = Some(DebugConfig { output_dir });
        Ok(self)
    }

    /// Add a processing step to the pipeline
    pub fn add_step(mut self, step: Arc<dyn PipelineStep>) -> Self {
        self.steps.push(step);
        self
    }

    /// Helper method to add a step from a Box (for convenience)
    pub fn add_step_boxed(mut self, step: Box<dyn PipelineStep>) -> Self {
        self.steps.push(Arc::from(step));
        self
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order.
    ///
    /// `on_step` is called after each step with its stage and elapsed time.
    pub fn run(
        &self,
        mut data: PipelineData,
        mut on_step: impl FnMut(Stage, Duration),
    ) -> Result<PipelineData, StageError> {
        if let Some(debug_config) = &self.context.debug {
            debug_config
                .save(0, "input", &data.image_id, &data.image)
                .at_stage(Stage::Load)?;
        }

        for (step_idx, step) in self.steps.iter().enumerate() {
            debug!(image = %data.image_id, "running step: {}", step.name());

            let started = Instant::now();
            data.image = step
                .process(&data.image, &self.context)
                .at_stage(step.stage())?;
            on_step(step.stage(), started.elapsed());

            if let Some(debug_config) = &self.context.debug {
                debug_config
                    .save(step_idx + 1, step.name(), &data.image_id, &data.image)
                    .at_stage(step.stage())?;
            }
        }

        Ok(data)
    }
}

fn prepare_debug_dir(output_dir: &Path) -> Result<(), HexError> {
    if output_dir.exists() {
        let entries = std::fs::read_dir(output_dir)?;
        if entries.count() > 0 {
            return Err(HexError::invalid_parameter(format!(
                "debug directory is not empty: {}",
                output_dir.display()
            )));
        }
    } else {
        std::fs::create_dir_all(output_dir)?;
    }
    Ok(())
}
