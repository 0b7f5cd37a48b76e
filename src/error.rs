//! Error taxonomy for the detection pipeline.
//!
//! Every stage reports failures as a [`HexError`]. The orchestrator pairs the
//! error with the [`Stage`] it came from and the image identifier to build a
//! [`FailureRecord`](crate::models::FailureRecord).

use serde::Serialize;
use thiserror::Error;

/// Pipeline stage an error or progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Load,
    Enhance,
    Thicken,
    Upscale,
    Detect,
    Classify,
    Extract,
    Aggregate,
    Batch,
}

impl Stage {
    /// Stages of a single image's pipeline, in execution order.
    pub const PIPELINE: [Stage; 8] = [
        Stage::Load,
        Stage::Enhance,
        Stage::Thicken,
        Stage::Upscale,
        Stage::Detect,
        Stage::Classify,
        Stage::Extract,
        Stage::Aggregate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Load => "load",
            Stage::Enhance => "enhance",
            Stage::Thicken => "thicken",
            Stage::Upscale => "upscale",
            Stage::Detect => "detect",
            Stage::Classify => "classify",
            Stage::Extract => "extract",
            Stage::Aggregate => "aggregate",
            Stage::Batch => "batch",
        }
    }

    /// Fraction of a single image's pipeline that is done once this stage completes.
    pub fn completed_fraction(&self) -> f32 {
        match Stage::PIPELINE.iter().position(|s| s == self) {
            Some(idx) => (idx + 1) as f32 / Stage::PIPELINE.len() as f32,
            None => 1.0,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse error category, used in failure records and for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidParameter,
    Authentication,
    ServiceUnavailable,
    InvalidResponse,
    EmptyRegion,
    Image,
    Io,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::InvalidParameter => "invalid_parameter",
            ErrorKind::Authentication => "authentication",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::EmptyRegion => "empty_region",
            ErrorKind::Image => "image",
            ErrorKind::Io => "io",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum HexError {
    /// Caller misuse. Never retried.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The detection service rejected the credentials. Fatal for the whole run.
    #[error("authentication rejected by detection service: {0}")]
    Authentication(String),

    /// Transient network or service failure, including timeouts. Also used
    /// for image downloads that may succeed on a later attempt.
    #[error("remote service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The service answered with something that is not a detection list.
    #[error("invalid response from detection service: {0}")]
    InvalidResponse(String),

    /// The clamped crop region has zero area.
    #[error("empty region: {0}")]
    EmptyRegion(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled before processing started")]
    Cancelled,
}

impl HexError {
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        HexError::InvalidParameter(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HexError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            HexError::Authentication(_) => ErrorKind::Authentication,
            HexError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            HexError::InvalidResponse(_) => ErrorKind::InvalidResponse,
            HexError::EmptyRegion(_) => ErrorKind::EmptyRegion,
            HexError::Image(_) => ErrorKind::Image,
            HexError::Io(_) => ErrorKind::Io,
            HexError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Only transient service failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HexError::ServiceUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, HexError>;

/// A [`HexError`] tagged with the stage that raised it.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: HexError,
}

impl StageError {
    pub fn new(stage: Stage, source: HexError) -> Self {
        Self { stage, source }
    }
}

/// Attach a stage to a fallible result.
pub trait AtStage<T> {
    fn at_stage(self, stage: Stage) -> std::result::Result<T, StageError>;
}

impl<T> AtStage<T> for Result<T> {
    fn at_stage(self, stage: Stage) -> std::result::Result<T, StageError> {
        self.map_err(|source| StageError::new(stage, source))
    }
}
