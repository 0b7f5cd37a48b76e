use crate::error::{HexError, Result};
use crate::models::{ConfidenceTier, Detection, TierThresholds};

/// Detections split by a confidence threshold, each side in input order.
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub accepted: Vec<Detection>,
    pub rejected: Vec<Detection>,
}

impl Classification {
    pub fn len(&self) -> usize {
        self.accepted.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn validate_threshold(threshold: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(HexError::invalid_parameter(format!(
            "confidence threshold must lie in [0, 1], got {}",
            threshold
        )));
    }
    Ok(())
}

/// Accept every detection with `confidence >= threshold`, reject the rest.
pub fn classify(detections: &[Detection], threshold: f32) -> Result<Classification> {
    validate_threshold(threshold)?;

    let (accepted, rejected) = detections
        .iter()
        .cloned()
        .partition(|d| d.confidence >= threshold);

    Ok(Classification { accepted, rejected })
}

/// Tier of each detection, in the same order.
pub fn assign_tiers(detections: &[Detection], tiers: &TierThresholds) -> Vec<ConfidenceTier> {
    detections.iter().map(|d| tiers.tier(d.confidence)).collect()
}
