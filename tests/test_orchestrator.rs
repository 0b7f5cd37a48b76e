mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use hexdetect::{
    ApiCredentials, BatchEntry, CancellationFlag, Detection, DetectionService, ErrorKind,
    HexError, ImageFetcher, ImageInput, Orchestrator, ProgressEvent, RetryPolicy, RunInput,
    RunOutput, Stage, output,
};
use image::{DynamicImage, ImageFormat};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn sheet_detections() -> Vec<Detection> {
    vec![
        detection(0, (10, 10, 30, 30), 0.92),
        detection(1, (50, 10, 30, 30), 0.40),
        detection(2, (10, 50, 30, 30), 0.75),
    ]
}

fn three_sheets() -> Vec<ImageInput> {
    vec![
        ImageInput::from_image("sheet-a", line_art_image(100, 100)),
        ImageInput::from_image("sheet-b", line_art_image(110, 100)),
        ImageInput::from_image("sheet-c", line_art_image(120, 100)),
    ]
}

#[tokio::test]
async fn test_batch_continues_past_failed_image() -> anyhow::Result<()> {
    let service = ScriptedService::new()
        .on_width(100, Script::Detections(sheet_detections()))
        .on_width(110, Script::Fail(ErrorKind::InvalidResponse))
        .on_width(120, Script::Detections(vec![detection(0, (5, 5, 20, 20), 0.8)]));
    let orchestrator = Orchestrator::new(service, test_config())?;

    let batch = orchestrator
        .run_batch(three_sheets(), &CancellationFlag::new())
        .await?;

    assert_eq!(batch.len(), 3);
    assert_eq!(batch.successes().count(), 2);
    assert_eq!(batch.failures().count(), 1);

    let ids: Vec<&str> = batch.iter().map(|(id, _)| id).collect();
    assert_eq!(ids, vec!["sheet-a", "sheet-b", "sheet-c"]);

    let failure = batch.get("sheet-b").and_then(|e| e.as_failure()).expect("sheet-b failed");
    assert_eq!(failure.stage, Stage::Detect);
    assert_eq!(failure.kind, ErrorKind::InvalidResponse);
    assert_eq!(failure.image_id, "sheet-b");

    let first = batch.get("sheet-a").and_then(|e| e.as_success()).expect("sheet-a succeeded");
    assert_eq!(first.detections.len(), 3);
    assert_eq!(first.accepted, vec![0, 2]);
    assert_eq!(first.extracted.len(), 2);
    assert_eq!(first.extracted[1].detection.index, 2);
    assert_eq!(batch.failure_counts().get("invalid_response"), Some(&1));
    Ok(())
}

#[tokio::test]
async fn test_authentication_failure_aborts_batch() -> anyhow::Result<()> {
    let service = ScriptedService::new().on_width(100, Script::Fail(ErrorKind::Authentication));
    let calls = service.calls();
    let mut config = test_config();
    config.concurrency = 1;
    let orchestrator = Orchestrator::new(service, config)?;

    let cancel = CancellationFlag::new();
    let result = orchestrator.run_batch(three_sheets(), &cancel).await;

    assert!(matches!(result, Err(HexError::Authentication(_))));
    assert!(cancel.is_cancelled());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_batch_records_unstarted_images() -> anyhow::Result<()> {
    let service = ScriptedService::new();
    let calls = service.calls();
    let orchestrator = Orchestrator::new(service, test_config())?;

    let cancel = CancellationFlag::new();
    cancel.cancel();
    let batch = orchestrator.run_batch(three_sheets(), &cancel).await?;

    assert_eq!(batch.len(), 3);
    assert!(batch.failures().all(|f| f.kind == ErrorKind::Cancelled));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_ids_rejected_before_processing() -> anyhow::Result<()> {
    let service = ScriptedService::new();
    let calls = service.calls();
    let orchestrator = Orchestrator::new(service, test_config())?;

    let inputs = vec![
        ImageInput::from_image("same", blank_image(10, 10)),
        ImageInput::from_image("same", blank_image(12, 10)),
    ];
    let result = orchestrator.run_batch(inputs, &CancellationFlag::new()).await;

    assert!(matches!(result, Err(HexError::InvalidParameter(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_empty_batch() -> anyhow::Result<()> {
    let orchestrator = Orchestrator::new(ScriptedService::new(), test_config())?;
    let batch = orchestrator.run_batch(Vec::new(), &CancellationFlag::new()).await?;
    assert!(batch.is_empty());
    Ok(())
}

#[test]
fn test_invalid_config_fails_fast() {
    let mut config = test_config();
    config.confidence_threshold = 1.5;
    assert!(matches!(
        Orchestrator::new(ScriptedService::new(), config),
        Err(HexError::InvalidParameter(_))
    ));

    let mut config = test_config();
    config.thicken = true;
    config.kernel_size = 4;
    assert!(Orchestrator::new(ScriptedService::new(), config).is_err());

    let mut config = test_config();
    config.credentials.prediction_key = String::new();
    assert!(Orchestrator::new(ScriptedService::new(), config).is_err());

    let mut config = test_config();
    config.concurrency = 0;
    assert!(Orchestrator::new(ScriptedService::new(), config).is_err());
}

#[tokio::test]
async fn test_missing_file_fails_at_load() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let orchestrator = Orchestrator::new(ScriptedService::new(), test_config())?;

    let input = ImageInput::from_path(dir.path().join("missing.png"));
    assert_eq!(input.id(), "missing");
    let failure = orchestrator.run_image(&input).await.unwrap_err();

    assert_eq!(failure.stage, Stage::Load);
    assert_eq!(failure.kind, ErrorKind::Image);
    Ok(())
}

#[tokio::test]
async fn test_progress_events_reach_every_stage() -> anyhow::Result<()> {
    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);

    let mut config = test_config();
    config.thicken = true;
    let service = ScriptedService::new().on_width(100, Script::Detections(sheet_detections()));
    let orchestrator = Orchestrator::new(service, config)?
        .with_progress(move |event: ProgressEvent| sink.lock().unwrap().push(event));

    orchestrator
        .run_image(&ImageInput::from_image("sheet", line_art_image(100, 100)))
        .await
        .map_err(|f| anyhow::anyhow!("{}", f))?;

    let events = events.lock().unwrap();
    let stages: Vec<Stage> = events.iter().map(|e| e.stage).collect();
    assert_eq!(
        stages,
        vec![
            Stage::Load,
            Stage::Thicken,
            Stage::Detect,
            Stage::Classify,
            Stage::Extract,
            Stage::Aggregate
        ]
    );
    assert!(events.iter().all(|e| e.image_id == "sheet"));
    assert!(events.windows(2).all(|w| w[0].fraction <= w[1].fraction));
    assert_eq!(events.last().map(|e| e.fraction), Some(1.0));
    Ok(())
}

#[tokio::test]
async fn test_upscaled_detections_use_detector_space() -> anyhow::Result<()> {
    let mut config = test_config();
    config.upscale_factor = Some(2.0);
    config.crop_padding = 0.0;
    // the service sees the 100 px wide upscaled image
    let service = ScriptedService::new()
        .on_width(100, Script::Detections(vec![detection(0, (20, 20, 40, 40), 0.9)]));
    let orchestrator = Orchestrator::new(service, config)?;

    let result = orchestrator
        .run_image(&ImageInput::from_image("small", line_art_image(50, 50)))
        .await
        .map_err(|f| anyhow::anyhow!("{}", f))?;

    assert!((result.coordinate_scale - 2.0).abs() < 1e-6);
    assert_eq!(result.annotated_image.width(), 100);
    assert_eq!(result.original_annotated_image.width(), 50);
    assert_eq!(result.extracted[0].image.width(), 40);

    let entry = &result.record().detections[0];
    assert_eq!(entry.original_bounding_box.x, 10);
    assert_eq!(entry.original_bounding_box.width, 20);
    Ok(())
}

#[tokio::test]
async fn test_run_single_and_batch() -> anyhow::Result<()> {
    let service = ScriptedService::new().on_width(100, Script::Detections(sheet_detections()));
    let orchestrator = Orchestrator::new(service, test_config())?;
    let cancel = CancellationFlag::new();

    let single = orchestrator
        .run(
            RunInput::Single(ImageInput::from_image("one", line_art_image(100, 100))),
            &cancel,
        )
        .await?;
    match single {
        RunOutput::Single(BatchEntry::Success(result)) => assert_eq!(result.source_image_id, "one"),
        other => panic!("unexpected output: {:?}", other),
    }

    let batch = orchestrator.run(RunInput::Batch(three_sheets()), &cancel).await?;
    match batch {
        RunOutput::Batch(batch) => assert_eq!(batch.len(), 3),
        other => panic!("unexpected output: {:?}", other),
    }
    Ok(())
}

/// Service that tracks how many calls overlap.
#[derive(Default)]
struct SlowService {
    in_flight: AtomicUsize,
    max_in_flight: Arc<AtomicUsize>,
}

impl DetectionService for SlowService {
    async fn detect(
        &self,
        _image: &DynamicImage,
        _credentials: &ApiCredentials,
    ) -> hexdetect::error::Result<Vec<Detection>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_is_bounded() -> anyhow::Result<()> {
    let service = SlowService::default();
    let max_in_flight = Arc::clone(&service.max_in_flight);
    let mut config = test_config();
    config.concurrency = 2;
    let orchestrator = Orchestrator::new(service, config)?;

    let inputs = (0..6)
        .map(|i| ImageInput::from_image(format!("img-{}", i), blank_image(10, 10)))
        .collect();
    let batch = orchestrator.run_batch(inputs, &CancellationFlag::new()).await?;

    assert_eq!(batch.successes().count(), 6);
    let max = max_in_flight.load(Ordering::SeqCst);
    assert!(max >= 1 && max <= 2, "max in flight was {}", max);
    Ok(())
}

#[tokio::test]
async fn test_results_written_to_disk() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let service = ScriptedService::new()
        .on_width(100, Script::Detections(sheet_detections()))
        .on_width(110, Script::Fail(ErrorKind::ServiceUnavailable));
    let orchestrator = Orchestrator::new(service, test_config())?;

    let batch = orchestrator
        .run_batch(three_sheets(), &CancellationFlag::new())
        .await?;
    let result = batch.get("sheet-a").and_then(|e| e.as_success()).expect("sheet-a succeeded");

    let written = output::write_result(dir.path(), result)?;
    let sheet_dir = dir.path().join("sheet-a");
    assert_eq!(written.directory, sheet_dir);
    assert!(sheet_dir.join("annotated_sheet-a.jpg").exists());
    assert_eq!(written.original_mapped, sheet_dir.join("sheet-a_original_mapped.jpg"));
    assert!(written.original_mapped.exists());
    assert!(sheet_dir.join("hexagons").join("hexagon_001_conf_92%.png").exists());
    assert!(sheet_dir.join("hexagons").join("hexagon_002_conf_75%.png").exists());
    assert_eq!(written.hexagons.len(), 2);

    let record: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(sheet_dir.join("sheet-a_detections.json"))?)?;
    assert_eq!(record["source_image_id"], "sheet-a");
    assert_eq!(record["detections"].as_array().map(|d| d.len()), Some(3));
    assert_eq!(record["detections"][1]["accepted"], false);
    assert_eq!(record["summary"]["extracted"], 2);

    let summary_path = output::write_batch_summary(dir.path(), &batch)?;
    let summary: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(summary_path)?)?;
    assert_eq!(summary["total"], 3);
    assert_eq!(summary["successes"].as_array().map(|s| s.len()), Some(2));
    assert_eq!(summary["failures"][0]["image_id"], "sheet-b");
    assert_eq!(summary["failures"][0]["kind"], "service_unavailable");
    assert_eq!(summary["failures"][0]["stage"], "detect");
    Ok(())
}

#[test]
fn test_collect_inputs_scans_directories() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let nested = dir.path().join("more");
    std::fs::create_dir(&nested)?;

    blank_image(4, 4).save(dir.path().join("b.png"))?;
    blank_image(4, 4).save(dir.path().join("a.JPG"))?;
    blank_image(4, 4).save(nested.join("a.png"))?;
    std::fs::write(dir.path().join("notes.txt"), "ignore me")?;

    let inputs = output::collect_inputs(&[dir.path().to_path_buf(), nested.join("a.png")], &[])?;
    let ids: Vec<&str> = inputs.iter().map(|i| i.id()).collect();
    assert_eq!(ids, vec!["a", "b", "a_2"]);

    assert!(output::collect_inputs(&[dir.path().join("nope")], &[]).is_err());
    Ok(())
}

#[test]
fn test_collect_inputs_suffixes_never_collide() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    blank_image(4, 4).save(dir.path().join("a.png"))?;
    blank_image(4, 4).save(dir.path().join("a.jpg"))?;
    blank_image(4, 4).save(dir.path().join("a_2.png"))?;

    let urls = vec!["https://host.example/scans/a.png".to_string()];
    let inputs = output::collect_inputs(&[dir.path().to_path_buf()], &urls)?;

    let ids: Vec<&str> = inputs.iter().map(|i| i.id()).collect();
    assert_eq!(ids, vec!["a", "a_2", "a_2_2", "a_3"]);
    assert_eq!(inputs[3].url(), Some("https://host.example/scans/a.png"));
    Ok(())
}

#[test]
fn test_unique_ids_keeps_first_occurrence() {
    let inputs = output::unique_ids(vec![
        ImageInput::from_image("x_2", blank_image(2, 2)),
        ImageInput::from_image("x", blank_image(2, 2)),
        ImageInput::from_image("x", blank_image(2, 2)),
        ImageInput::from_image("x", blank_image(2, 2)),
    ]);
    let ids: Vec<&str> = inputs.iter().map(|i| i.id()).collect();
    assert_eq!(ids, vec!["x_2", "x", "x_3", "x_4"]);
}

/// Serve `body` as a PNG for paths ending in `.png` and 404 for anything else.
async fn image_server(body: Vec<u8>) -> anyhow::Result<(String, Arc<AtomicUsize>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let base = format!("http://{}", listener.local_addr()?);
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&requests);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
            let head = String::from_utf8_lossy(&buf).to_string();
            let target = head.split_whitespace().nth(1).unwrap_or("/");
            let path = target.split('?').next().unwrap_or(target);

            let (status, payload) = if path.ends_with(".png") {
                ("200 OK", body.as_slice())
            } else {
                ("404 Not Found", &b"missing"[..])
            };
            let header = format!(
                "HTTP/1.1 {}\r\nContent-Type: image/png\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                payload.len()
            );
            let _ = socket.write_all(header.as_bytes()).await;
            let _ = socket.write_all(payload).await;
            let _ = socket.shutdown().await;
        }
    });

    Ok((base, requests))
}

fn png_bytes(image: &DynamicImage) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image.write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

#[tokio::test]
async fn test_url_input_is_downloaded_and_processed() -> anyhow::Result<()> {
    let (base, requests) = image_server(png_bytes(&line_art_image(100, 100))?).await?;
    let service = ScriptedService::new().on_width(100, Script::Detections(sheet_detections()));
    let orchestrator = Orchestrator::new(service, test_config())?
        .with_fetcher(ImageFetcher::new(Duration::from_secs(5), RetryPolicy::no_retry())?);

    let input = ImageInput::from_url(format!("{}/scans/sheet-u.png?sig=1", base));
    assert_eq!(input.id(), "sheet-u");
    assert!(input.path().is_none());

    let result = orchestrator
        .run_image(&input)
        .await
        .map_err(|f| anyhow::anyhow!("{}", f))?;

    assert_eq!(result.source_image_id, "sheet-u");
    assert_eq!(result.detections.len(), 3);
    assert_eq!(result.accepted, vec![0, 2]);
    assert_eq!(result.original_annotated_image.width(), 100);
    assert_eq!(requests.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_url_download_failures_stop_at_load() -> anyhow::Result<()> {
    let (base, _requests) = image_server(png_bytes(&line_art_image(100, 100))?).await?;
    let service = ScriptedService::new();
    let calls = service.calls();
    let orchestrator = Orchestrator::new(service, test_config())?
        .with_fetcher(ImageFetcher::new(Duration::from_secs(5), RetryPolicy::no_retry())?);

    let missing = orchestrator
        .run_image(&ImageInput::from_url(format!("{}/scans/gone.tif", base)))
        .await
        .unwrap_err();
    assert_eq!(missing.stage, Stage::Load);
    assert_eq!(missing.kind, ErrorKind::Io);

    let bad_scheme = orchestrator
        .run_image(&ImageInput::from_url("ftp://host.example/sheet.png"))
        .await
        .unwrap_err();
    assert_eq!(bad_scheme.stage, Stage::Load);
    assert_eq!(bad_scheme.kind, ErrorKind::InvalidParameter);

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn test_url_input_needs_download_before_load() {
    let input = ImageInput::from_url("https://host.example/sheet.png");
    assert!(matches!(input.load(), Err(HexError::InvalidParameter(_))));
    assert!(matches!(input.decode(b"not an image"), Err(HexError::Image(_))));
}
