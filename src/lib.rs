pub mod client;
pub mod config;
pub mod detection;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod output;
pub mod pipeline;

pub use client::{
    CustomVisionClient, DetectionService, ImageFetcher, RetryPolicy, retry_with_backoff,
};
pub use config::{ApiCredentials, PipelineConfig, ServiceConfig};
pub use detection::{EnhancementLevel, build_preprocessing_pipeline};
pub use error::{ErrorKind, HexError, Stage, StageError};
pub use models::{
    BatchEntry, BatchResult, BoundingBox, ConfidenceTier, Detection, DetectionResult,
    ExtractedHexagon, FailureRecord, TierThresholds,
};
pub use orchestrator::{
    CancellationFlag, ImageInput, LogProgress, Orchestrator, ProgressEvent, ProgressSink,
    RunInput, RunOutput,
};
pub use pipeline::{DebugConfig, Pipeline, PipelineContext, PipelineData, PipelineStep};
