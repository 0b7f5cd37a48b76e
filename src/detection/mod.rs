pub mod aggregate;
pub mod classify;
pub mod enhance;
pub mod extract;
pub mod morphology;
pub mod steps;
pub mod upscale;

use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::pipeline::Pipeline;

pub use aggregate::{AggregateInput, DetectionRecord, Timing, aggregate};
pub use classify::{Classification, classify};
pub use enhance::{EnhancementLevel, enhance};
pub use extract::{Extraction, extract, extract_all, extract_with_padding};
pub use morphology::thicken;
pub use upscale::upscale;

/// Build the preprocessing pipeline (enhance, thicken, upscale) a config asks for
pub fn build_preprocessing_pipeline(config: &PipelineConfig) -> Pipeline {
    use steps::*;

    let mut pipeline = Pipeline::new();

    if let Some(level) = config.enhancement_level {
        pipeline = pipeline.add_step(Arc::new(EnhanceStep { level }));
    }
    if config.thicken {
        pipeline = pipeline.add_step(Arc::new(ThickenStep {
            kernel_size: config.kernel_size,
        }));
    }
    if let Some(factor) = config.upscale_factor {
        pipeline = pipeline.add_step(Arc::new(UpscaleStep { factor }));
    }

    pipeline
}
