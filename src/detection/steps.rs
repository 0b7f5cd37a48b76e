use crate::detection::{enhance, morphology, upscale};
use crate::detection::enhance::EnhancementLevel;
use crate::error::{HexError, Stage};
use crate::pipeline::{PipelineContext, PipelineStep};
use image::DynamicImage;

/// Contrast, sharpening and denoising at a fixed level
pub struct EnhanceStep {
    pub level: EnhancementLevel,
}

impl PipelineStep for EnhanceStep {
    fn process(&self, image: &DynamicImage, _context: &PipelineContext) -> Result<DynamicImage, HexError> {
        enhance::enhance(image, self.level)
    }

    fn name(&self) -> &str {
        "Enhance"
    }

    fn stage(&self) -> Stage {
        Stage::Enhance
    }
}

/// Dilate thin strokes so the detector sees them
pub struct ThickenStep {
    pub kernel_size: u32,
}

impl PipelineStep for ThickenStep {
    fn process(&self, image: &DynamicImage, _context: &PipelineContext) -> Result<DynamicImage, HexError> {
        morphology::thicken(image, self.kernel_size)
    }

    fn name(&self) -> &str {
        "Thicken Lines"
    }

    fn stage(&self) -> Stage {
        Stage::Thicken
    }
}

/// Upscale by a fixed factor
pub struct UpscaleStep {
    pub factor: f32,
}

impl PipelineStep for UpscaleStep {
    fn process(&self, image: &DynamicImage, _context: &PipelineContext) -> Result<DynamicImage, HexError> {
        upscale::upscale(image, self.factor)
    }

    fn name(&self) -> &str {
        "Upscale"
    }

    fn stage(&self) -> Stage {
        Stage::Upscale
    }
}
