//! Configuration values threaded through the pipeline.
//!
//! Nothing here is global: the CLI resolves a [`PipelineConfig`] once and
//! hands it to the [`Orchestrator`](crate::orchestrator::Orchestrator).

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::detection::enhance::EnhancementLevel;
use crate::detection::extract::DEFAULT_CROP_PADDING;
use crate::detection::{classify, morphology, upscale};
use crate::error::HexError;
use crate::models::TierThresholds;

pub const DEFAULT_MODEL_NAME: &str = "DCNE_lowres";
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.70;
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Resolved credentials for the detection service.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredentials {
    pub prediction_key: String,
    pub endpoint: String,
    pub project_id: String,
    pub model_name: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("prediction_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("project_id", &self.project_id)
            .field("model_name", &self.model_name)
            .finish()
    }
}

impl ApiCredentials {
    pub fn validate(&self) -> Result<(), HexError> {
        for (name, value) in [
            ("prediction key", &self.prediction_key),
            ("prediction endpoint", &self.endpoint),
            ("project id", &self.project_id),
            ("model name", &self.model_name),
        ] {
            if value.trim().is_empty() {
                return Err(HexError::invalid_parameter(format!("{} is not set", name)));
            }
        }
        Ok(())
    }
}

/// On-disk service configuration (`config.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub prediction_key: String,
    #[serde(default)]
    pub prediction_endpoint: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default = "default_model_name")]
    pub model_name: String,
}

fn default_model_name() -> String {
    DEFAULT_MODEL_NAME.to_string()
}

impl ServiceConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Write a placeholder config for the user to fill in. Refuses to overwrite.
    pub fn write_sample<P: AsRef<Path>>(path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        if path.exists() {
            anyhow::bail!("Config file already exists: {}", path.display());
        }
        let sample = ServiceConfig {
            prediction_key: "your_prediction_key_here".to_string(),
            prediction_endpoint: "https://your-resource-name.cognitiveservices.azure.com/".to_string(),
            project_id: "your_project_id_here".to_string(),
            model_name: DEFAULT_MODEL_NAME.to_string(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&sample)?)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn credentials(&self) -> ApiCredentials {
        ApiCredentials {
            prediction_key: self.prediction_key.clone(),
            endpoint: self.prediction_endpoint.clone(),
            project_id: self.project_id.clone(),
            model_name: self.model_name.clone(),
        }
    }
}

/// Options for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// `None` skips enhancement.
    pub enhancement_level: Option<EnhancementLevel>,
    pub thicken: bool,
    pub kernel_size: u32,
    /// `None` skips upscaling.
    pub upscale_factor: Option<f32>,
    pub confidence_threshold: f32,
    pub tiers: TierThresholds,
    /// Fraction of each box added on every side before cropping.
    pub crop_padding: f32,
    /// Maximum number of images processed at once.
    pub concurrency: usize,
    pub credentials: ApiCredentials,
}

impl PipelineConfig {
    pub fn new(credentials: ApiCredentials) -> Self {
        Self {
            enhancement_level: Some(EnhancementLevel::default()),
            thicken: true,
            kernel_size: morphology::DEFAULT_KERNEL_SIZE,
            upscale_factor: None,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            tiers: TierThresholds::default(),
            crop_padding: DEFAULT_CROP_PADDING,
            concurrency: DEFAULT_CONCURRENCY,
            credentials,
        }
    }

    /// Check every option before any image is touched.
    pub fn validate(&self) -> Result<(), HexError> {
        classify::validate_threshold(self.confidence_threshold)?;
        self.tiers.validate()?;
        if self.thicken {
            morphology::validate_kernel_size(self.kernel_size)?;
        }
        if let Some(factor) = self.upscale_factor {
            upscale::validate_factor(factor)?;
        }
        if !self.crop_padding.is_finite() || !(0.0..=1.0).contains(&self.crop_padding) {
            return Err(HexError::invalid_parameter(format!(
                "crop padding must lie in [0, 1], got {}",
                self.crop_padding
            )));
        }
        if self.concurrency == 0 {
            return Err(HexError::invalid_parameter("concurrency must be at least 1"));
        }
        self.credentials.validate()
    }
}
