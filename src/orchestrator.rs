//! Runs the detection pipeline over one image or a batch.
//!
//! Per image the stages run in order: load, enhance, thicken, upscale,
//! detect, classify, extract, aggregate. Pixel work happens on tokio's
//! blocking pool; the network awaits are the detection call and, for URL
//! inputs, the download in the load stage. A batch schedules images on a
//! [`JoinSet`] bounded by a semaphore, so one slow image never holds up the
//! others.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::DynamicImage;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::fetch::id_from_url;
use crate::client::{DetectionService, ImageFetcher};
use crate::config::PipelineConfig;
use crate::detection::{self, AggregateInput, Timing, build_preprocessing_pipeline};
use crate::error::{AtStage, ErrorKind, HexError, Stage, StageError};
use crate::models::{BatchEntry, BatchResult, DetectionResult, FailureRecord, StageTiming};
use crate::pipeline::{Pipeline, PipelineData};

#[derive(Debug, Clone)]
enum ImageSource {
    Path(PathBuf),
    Url(String),
    Memory(Arc<DynamicImage>),
}

/// An image to process together with its identifier.
#[derive(Debug, Clone)]
pub struct ImageInput {
    id: String,
    source: ImageSource,
}

impl ImageInput {
    /// Image on disk, identified by its file stem.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            id,
            source: ImageSource::Path(path),
        }
    }

    /// Image downloaded over HTTP(S) when its pipeline starts, identified by
    /// the stem of the URL's last path segment.
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: id_from_url(&url),
            source: ImageSource::Url(url),
        }
    }

    pub fn from_image(id: impl Into<String>, image: DynamicImage) -> Self {
        Self {
            id: id.into(),
            source: ImageSource::Memory(Arc::new(image)),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            ImageSource::Path(path) => Some(path),
            _ => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match &self.source {
            ImageSource::Url(url) => Some(url),
            _ => None,
        }
    }

    /// Decode the image. Empty images are rejected.
    ///
    /// URL inputs have to be downloaded first and decoded with
    /// [`ImageInput::decode`].
    pub fn load(&self) -> Result<DynamicImage, HexError> {
        let image = match &self.source {
            ImageSource::Path(path) => image::open(path)?,
            ImageSource::Memory(image) => image.as_ref().clone(),
            ImageSource::Url(url) => {
                return Err(HexError::invalid_parameter(format!(
                    "image '{}' must be downloaded from {} before decoding",
                    self.id, url
                )));
            }
        };
        self.non_empty(image)
    }

    /// Decode downloaded image bytes. Empty images are rejected.
    pub fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, HexError> {
        let image = image::load_from_memory(bytes)?;
        self.non_empty(image)
    }

    fn non_empty(&self, image: DynamicImage) -> Result<DynamicImage, HexError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(HexError::invalid_parameter(format!(
                "image '{}' has no pixels",
                self.id
            )));
        }
        Ok(image)
    }
}

/// Progress notification for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub image_id: String,
    pub stage: Stage,
    /// Fraction of work done, in `[0, 1]`. For [`Stage::Batch`] events this is
    /// the fraction of the batch that has finished.
    pub fraction: f32,
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn report(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, event: ProgressEvent) {
        if event.stage == Stage::Batch {
            info!(
                image = %event.image_id,
                "batch progress: {:.0}%",
                event.fraction * 100.0
            );
        } else {
            debug!(
                image = %event.image_id,
                stage = %event.stage,
                "{:.0}% done",
                event.fraction * 100.0
            );
        }
    }
}

/// Shared flag that stops a batch from scheduling further images.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Collects batch entries from concurrent pipelines.
#[derive(Debug)]
pub struct BatchAccumulator {
    inner: Mutex<BatchResult>,
}

impl BatchAccumulator {
    pub fn new(run_id: uuid::Uuid) -> Self {
        Self {
            inner: Mutex::new(BatchResult::new(run_id)),
        }
    }

    /// Publish one image's outcome. Each id may be published once.
    pub fn record(&self, image_id: &str, entry: BatchEntry) -> Result<(), HexError> {
        let mut batch = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        batch.insert(image_id, entry)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_inner(self) -> BatchResult {
        self.inner
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub enum RunInput {
    Single(ImageInput),
    Batch(Vec<ImageInput>),
}

#[derive(Debug)]
pub enum RunOutput {
    Single(BatchEntry),
    Batch(BatchResult),
}

/// Drives images through the pipeline with a fixed configuration.
pub struct Orchestrator<S> {
    service: Arc<S>,
    config: Arc<PipelineConfig>,
    pipeline: Arc<Pipeline>,
    progress: Arc<dyn ProgressSink>,
    fetcher: Arc<ImageFetcher>,
}

impl<S> Clone for Orchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            config: Arc::clone(&self.config),
            pipeline: Arc::clone(&self.pipeline),
            progress: Arc::clone(&self.progress),
            fetcher: Arc::clone(&self.fetcher),
        }
    }
}

impl<S: DetectionService> Orchestrator<S> {
    /// Validates `config` up front; nothing is processed with bad options.
    pub fn new(service: S, config: PipelineConfig) -> Result<Self, HexError> {
        config.validate()?;
        let pipeline = build_preprocessing_pipeline(&config);
        info!(steps = ?pipeline.step_names(), "preprocessing pipeline ready");
        Ok(Self {
            service: Arc::new(service),
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
            progress: Arc::new(NoopProgress),
            fetcher: Arc::new(ImageFetcher::with_defaults()?),
        })
    }

    /// Downloader used for [`ImageInput::from_url`] inputs.
    pub fn with_fetcher(mut self, fetcher: ImageFetcher) -> Self {
        self.fetcher = Arc::new(fetcher);
        self
    }

    pub fn with_progress(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.progress = Arc::new(sink);
        self
    }

    /// Save every preprocessing stage's output under `dir`.
    pub fn with_debug(mut self, dir: PathBuf) -> Result<Self, HexError> {
        let pipeline = self.pipeline.as_ref().clone().with_debug(dir)?;
        self.pipeline = Arc::new(pipeline);
        Ok(self)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub async fn run(&self, input: RunInput, cancel: &CancellationFlag) -> Result<RunOutput, HexError> {
        match input {
            RunInput::Single(image) => {
                if cancel.is_cancelled() {
                    let record = FailureRecord::new(image.id(), Stage::Batch, &HexError::Cancelled);
                    return Ok(RunOutput::Single(BatchEntry::Failure(record)));
                }
                match self.run_image(&image).await {
                    Ok(result) => Ok(RunOutput::Single(BatchEntry::Success(Box::new(result)))),
                    Err(record) if record.kind == ErrorKind::Authentication => {
                        Err(HexError::Authentication(record.message))
                    }
                    Err(record) => Ok(RunOutput::Single(BatchEntry::Failure(record))),
                }
            }
            RunInput::Batch(images) => self.run_batch(images, cancel).await.map(RunOutput::Batch),
        }
    }

    /// Process one image end to end.
    pub async fn run_image(&self, input: &ImageInput) -> Result<DetectionResult, FailureRecord> {
        let image_id = input.id().to_string();
        self.process(input)
            .await
            .map_err(|err| {
                let record = FailureRecord::new(&image_id, err.stage, &err.source);
                warn!("{}", record);
                record
            })
    }

    async fn process(&self, input: &ImageInput) -> Result<DetectionResult, StageError> {
        let started = Instant::now();
        let image_id = input.id().to_string();
        let mut timings = Vec::new();

        // Load
        let stage_start = Instant::now();
        let loader = input.clone();
        let image = match input.url() {
            Some(url) => {
                let bytes = self.fetcher.fetch(url).await.at_stage(Stage::Load)?;
                blocking(Stage::Load, move || loader.decode(&bytes).at_stage(Stage::Load)).await?
            }
            None => blocking(Stage::Load, move || loader.load().at_stage(Stage::Load)).await?,
        };
        timings.push(timing(Stage::Load, stage_start.elapsed()));
        self.report(&image_id, Stage::Load);
        debug!(image = %image_id, width = image.width(), height = image.height(), "image loaded");

        // Enhance, thicken, upscale
        let pipeline = Arc::clone(&self.pipeline);
        let progress = Arc::clone(&self.progress);
        let id = image_id.clone();
        let data = PipelineData::from_image(image_id.clone(), image);
        let (data, step_timings) = blocking(Stage::Enhance, move || {
            let mut step_timings = Vec::new();
            let data = pipeline.run(data, |stage, duration| {
                step_timings.push(timing(stage, duration));
                progress.report(ProgressEvent {
                    image_id: id.clone(),
                    stage,
                    fraction: stage.completed_fraction(),
                });
            })?;
            Ok((data, step_timings))
        })
        .await?;
        timings.extend(step_timings);
        let coordinate_scale = data.coordinate_scale();

        // Detect
        let stage_start = Instant::now();
        let detections = self
            .service
            .detect(&data.image, &self.config.credentials)
            .await
            .at_stage(Stage::Detect)?;
        timings.push(timing(Stage::Detect, stage_start.elapsed()));
        self.report(&image_id, Stage::Detect);
        info!(image = %image_id, count = detections.len(), "detections received");

        // Classify
        let stage_start = Instant::now();
        let classification = detection::classify(&detections, self.config.confidence_threshold)
            .at_stage(Stage::Classify)?;
        timings.push(timing(Stage::Classify, stage_start.elapsed()));
        self.report(&image_id, Stage::Classify);
        debug!(
            image = %image_id,
            accepted = classification.accepted.len(),
            rejected = classification.rejected.len(),
            "detections classified"
        );

        // Extract and aggregate
        let config = Arc::clone(&self.config);
        let progress = Arc::clone(&self.progress);
        let id = image_id.clone();
        let mut result = blocking(Stage::Extract, move || {
            let stage_start = Instant::now();
            let extraction = detection::extract_all(
                &data.image,
                &classification.accepted,
                &config.tiers,
                config.crop_padding,
            )
            .at_stage(Stage::Extract)?;
            timings.push(timing(Stage::Extract, stage_start.elapsed()));
            progress.report(ProgressEvent {
                image_id: id.clone(),
                stage: Stage::Extract,
                fraction: Stage::Extract.completed_fraction(),
            });

            let stage_start = Instant::now();
            let mut result = detection::aggregate(AggregateInput {
                source_image_id: &id,
                source_image: &data.image,
                original_image: Some(data.original.as_ref()),
                accepted: &classification.accepted,
                rejected: &classification.rejected,
                extraction: &extraction,
                timing: Timing {
                    total: started.elapsed(),
                    stages: timings,
                },
                enhancement_level: config.enhancement_level,
                confidence_threshold: config.confidence_threshold,
                tiers: config.tiers,
                coordinate_scale,
            });
            result
                .stage_timings
                .push(timing(Stage::Aggregate, stage_start.elapsed()));
            Ok(result)
        })
        .await?;

        result.processing_duration = started.elapsed();
        self.report(&image_id, Stage::Aggregate);
        info!(
            image = %image_id,
            extracted = result.extracted.len(),
            skipped = result.skipped.len(),
            elapsed_ms = result.processing_duration.as_millis() as u64,
            "image processed"
        );
        Ok(result)
    }

    /// Process every input independently.
    ///
    /// Per-image failures are recorded and the batch continues. An
    /// authentication failure cancels the batch and is returned as the error.
    pub async fn run_batch(
        &self,
        inputs: Vec<ImageInput>,
        cancel: &CancellationFlag,
    ) -> Result<BatchResult, HexError> {
        let order: Vec<String> = inputs.iter().map(|i| i.id().to_string()).collect();
        let mut seen = HashSet::new();
        for id in &order {
            if !seen.insert(id.as_str()) {
                return Err(HexError::invalid_parameter(format!(
                    "duplicate image id '{}' in batch",
                    id
                )));
            }
        }

        let run_id = uuid::Uuid::new_v4();
        let total = inputs.len();
        info!(%run_id, images = total, concurrency = self.config.concurrency, "starting batch");

        let accumulator = Arc::new(BatchAccumulator::new(run_id));
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks = JoinSet::new();
        let mut task_ids = HashMap::new();

        for input in inputs {
            if cancel.is_cancelled() {
                record_cancelled(&accumulator, input.id())?;
                continue;
            }
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|_| HexError::Cancelled)?;
            // Cancellation may have happened while waiting for a permit.
            if cancel.is_cancelled() {
                record_cancelled(&accumulator, input.id())?;
                continue;
            }

            let orchestrator = self.clone();
            let accumulator = Arc::clone(&accumulator);
            let cancel = cancel.clone();
            let image_id = input.id().to_string();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                let entry = match orchestrator.run_image(&input).await {
                    Ok(result) => BatchEntry::Success(Box::new(result)),
                    Err(record) => {
                        if record.kind == ErrorKind::Authentication {
                            cancel.cancel();
                        }
                        BatchEntry::Failure(record)
                    }
                };
                let auth_failure = entry
                    .as_failure()
                    .filter(|r| r.kind == ErrorKind::Authentication)
                    .map(|r| r.message.clone());
                accumulator.record(input.id(), entry)?;
                Ok::<_, HexError>(auth_failure)
            });
            task_ids.insert(handle.id(), image_id);
        }

        let mut auth_failure = None;
        let mut finished = 0;
        while let Some(joined) = tasks.join_next().await {
            finished += 1;
            match joined {
                Ok(Ok(Some(message))) => {
                    auth_failure.get_or_insert(message);
                }
                Ok(Ok(None)) => {}
                Ok(Err(err)) => return Err(err),
                Err(join_err) => {
                    let image_id = task_ids
                        .get(&join_err.id())
                        .cloned()
                        .unwrap_or_else(|| "<unknown>".to_string());
                    let err = HexError::Io(std::io::Error::other(format!(
                        "pipeline task failed: {}",
                        join_err
                    )));
                    let record = FailureRecord::new(&image_id, Stage::Batch, &err);
                    warn!("{}", record);
                    accumulator.record(&image_id, BatchEntry::Failure(record))?;
                }
            }
            self.progress.report(ProgressEvent {
                image_id: run_id.to_string(),
                stage: Stage::Batch,
                fraction: finished as f32 / total.max(1) as f32,
            });
        }

        if let Some(message) = auth_failure {
            warn!(%run_id, "batch aborted: detection service rejected the credentials");
            return Err(HexError::Authentication(message));
        }

        let accumulator = Arc::try_unwrap(accumulator).map_err(|_| {
            HexError::Io(std::io::Error::other("batch accumulator still shared after all tasks finished"))
        })?;
        let mut batch = accumulator.into_inner();
        batch.sort_by_input_order(&order);

        info!(
            %run_id,
            successes = batch.successes().count(),
            failures = batch.failures().count(),
            "batch finished"
        );
        Ok(batch)
    }

    fn report(&self, image_id: &str, stage: Stage) {
        self.progress.report(ProgressEvent {
            image_id: image_id.to_string(),
            stage,
            fraction: stage.completed_fraction(),
        });
    }
}

fn record_cancelled(accumulator: &BatchAccumulator, image_id: &str) -> Result<(), HexError> {
    let record = FailureRecord::new(image_id, Stage::Batch, &HexError::Cancelled);
    debug!("{}", record);
    accumulator.record(image_id, BatchEntry::Failure(record))
}

fn timing(stage: Stage, duration: Duration) -> StageTiming {
    StageTiming { stage, duration }
}

/// Run CPU-bound work on the blocking pool.
async fn blocking<T, F>(stage: Stage, work: F) -> Result<T, StageError>
where
    F: FnOnce() -> Result<T, StageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|e| {
        StageError::new(
            stage,
            HexError::Io(std::io::Error::other(format!("worker task failed: {}", e))),
        )
    })?
}
