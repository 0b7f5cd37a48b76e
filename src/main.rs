use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use hexdetect::client::DEFAULT_REQUEST_TIMEOUT;
use hexdetect::config::DEFAULT_CONCURRENCY;
use hexdetect::detection::extract::DEFAULT_CROP_PADDING;
use hexdetect::detection::morphology::DEFAULT_KERNEL_SIZE;
use hexdetect::{
    CancellationFlag, CustomVisionClient, EnhancementLevel, ImageFetcher, LogProgress,
    Orchestrator, PipelineConfig, RetryPolicy, ServiceConfig, logging, output,
};

#[derive(Parser)]
#[command(name = "hexdetect")]
#[command(about = "Detect and extract hexagon symbols from scanned technical drawings")]
struct Cli {
    /// Image files or directories of images
    #[arg(value_name = "INPUT", required_unless_present_any = ["create_config", "url"])]
    inputs: Vec<PathBuf>,

    /// Image URL to download and process (repeatable)
    #[arg(short, long, value_name = "URL")]
    url: Vec<String>,

    /// Output directory
    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// Service configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Write a sample configuration file to --config and exit
    #[arg(long)]
    create_config: bool,

    /// Minimum confidence for a detection to be extracted
    #[arg(short, long, default_value_t = 0.70)]
    threshold: f32,

    /// Enhancement level
    #[arg(short, long, value_enum, default_value_t = EnhancementLevel::Strong)]
    level: EnhancementLevel,

    /// Skip image enhancement
    #[arg(long)]
    no_enhance: bool,

    /// Skip line thickening
    #[arg(long)]
    no_thicken: bool,

    /// Line thickening kernel size (odd)
    #[arg(long, default_value_t = DEFAULT_KERNEL_SIZE)]
    kernel_size: u32,

    /// Upscale factor applied before detection
    #[arg(long, value_name = "FACTOR")]
    upscale: Option<f32>,

    /// Crop padding as a fraction of the box size
    #[arg(long, default_value_t = DEFAULT_CROP_PADDING)]
    padding: f32,

    /// Images processed at once
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Detection request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT.as_secs())]
    timeout_secs: u64,

    /// Attempts per detection request, including the first
    #[arg(long, default_value_t = RetryPolicy::default().max_attempts)]
    max_attempts: u32,

    /// Save preprocessing stages to directory (must be empty)
    #[arg(long, value_name = "DIR")]
    debug_out: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[arg(long, env = "HEXDETECT_PREDICTION_KEY", hide_env_values = true)]
    prediction_key: Option<String>,

    #[arg(long, env = "HEXDETECT_PREDICTION_ENDPOINT")]
    endpoint: Option<String>,

    #[arg(long, env = "HEXDETECT_PROJECT_ID")]
    project_id: Option<String>,

    #[arg(long, env = "HEXDETECT_MODEL_NAME")]
    model_name: Option<String>,
}

impl Cli {
    fn service_config(&self) -> anyhow::Result<ServiceConfig> {
        let mut service = if self.config.exists() {
            ServiceConfig::load(&self.config)?
        } else {
            ServiceConfig::default()
        };
        if let Some(key) = &self.prediction_key {
            service.prediction_key = key.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            service.prediction_endpoint = endpoint.clone();
        }
        if let Some(project_id) = &self.project_id {
            service.project_id = project_id.clone();
        }
        if let Some(model_name) = &self.model_name {
            service.model_name = model_name.clone();
        }
        if service.model_name.is_empty() {
            service.model_name = hexdetect::config::DEFAULT_MODEL_NAME.to_string();
        }
        Ok(service)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            ..RetryPolicy::default()
        }
    }

    fn pipeline_config(&self, service: &ServiceConfig) -> PipelineConfig {
        let mut config = PipelineConfig::new(service.credentials());
        config.enhancement_level = (!self.no_enhance).then_some(self.level);
        config.thicken = !self.no_thicken;
        config.kernel_size = self.kernel_size;
        config.upscale_factor = self.upscale;
        config.confidence_threshold = self.threshold;
        config.crop_padding = self.padding;
        config.concurrency = self.concurrency;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    logging::init_tracing(args.verbose);

    if args.create_config {
        ServiceConfig::write_sample(&args.config)?;
        info!("sample configuration written to {}", args.config.display());
        return Ok(());
    }

    let service_config = args.service_config()?;
    let config = args.pipeline_config(&service_config);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("{} (see --create-config for a sample config file)", e))?;

    let timeout = Duration::from_secs(args.timeout_secs);
    let client = CustomVisionClient::new(timeout, args.retry_policy())?;
    let fetcher = ImageFetcher::new(timeout, args.retry_policy())?;

    let mut orchestrator = Orchestrator::new(client, config)?
        .with_fetcher(fetcher)
        .with_progress(LogProgress);
    if let Some(debug_dir) = args.debug_out.clone() {
        orchestrator = orchestrator.with_debug(debug_dir)?;
    }

    let inputs = output::collect_inputs(&args.inputs, &args.url)?;
    if inputs.is_empty() {
        anyhow::bail!("No images to process");
    }
    info!("processing {} image(s)", inputs.len());

    let cancel = CancellationFlag::new();
    let batch = orchestrator.run_batch(inputs, &cancel).await?;

    for result in batch.successes() {
        let written = output::write_result(&args.output, result)?;
        let summary = result.record().summary;
        info!(
            image = %result.source_image_id,
            total = summary.total,
            accepted = summary.accepted,
            extracted = summary.extracted,
            skipped = summary.skipped,
            "results saved to {}",
            written.directory.display()
        );
    }
    for failure in batch.failures() {
        warn!("{}", failure);
    }
    output::write_batch_summary(&args.output, &batch)?;

    let failures = batch.failure_counts();
    info!(
        successes = batch.successes().count(),
        failures = ?failures,
        "done"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_attempts_counts_the_first_request() {
        let args = Cli::try_parse_from(["hexdetect", "--max-attempts", "1", "sheet.png"]).unwrap();
        assert_eq!(args.retry_policy().max_attempts, 1);

        let args = Cli::try_parse_from(["hexdetect", "--max-attempts", "0", "sheet.png"]).unwrap();
        assert_eq!(args.retry_policy().max_attempts, 1);

        let args = Cli::try_parse_from(["hexdetect", "sheet.png"]).unwrap();
        assert_eq!(args.retry_policy(), RetryPolicy::default());

        assert!(Cli::try_parse_from(["hexdetect", "--max-retries", "2", "sheet.png"]).is_err());
    }

    #[test]
    fn urls_stand_in_for_paths() {
        let args = Cli::try_parse_from([
            "hexdetect",
            "--url",
            "https://host.example/a.png",
            "-u",
            "https://host.example/b.png",
        ])
        .unwrap();
        assert!(args.inputs.is_empty());
        assert_eq!(args.url.len(), 2);

        assert!(Cli::try_parse_from(["hexdetect"]).is_err());
    }
}
