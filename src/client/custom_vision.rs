//! Azure Custom Vision object-detection client.

use std::io::Cursor;
use std::time::Duration;

use image::{DynamicImage, ImageFormat};
use serde::Deserialize;
use tracing::debug;

use super::{DEFAULT_REQUEST_TIMEOUT, DetectionService, RetryPolicy, retry_with_backoff};
use crate::config::ApiCredentials;
use crate::error::{HexError, Result};
use crate::models::{BoundingBox, Detection};

/// Slack allowed on `left + width` and `top + height` past the image edge.
const BOX_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Deserialize)]
struct PredictionResponse {
    predictions: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    probability: f64,
    tag_name: String,
    bounding_box: NormalizedBox,
}

/// Box with every value relative to the image size.
#[derive(Debug, Deserialize)]
struct NormalizedBox {
    left: f64,
    top: f64,
    width: f64,
    height: f64,
}

#[derive(Debug, Clone)]
pub struct CustomVisionClient {
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl CustomVisionClient {
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HexError::invalid_parameter(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { http, retry })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(DEFAULT_REQUEST_TIMEOUT, RetryPolicy::default())
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn prediction_url(credentials: &ApiCredentials) -> String {
        format!(
            "{}/customvision/v3.0/Prediction/{}/detect/iterations/{}/image",
            credentials.endpoint.trim_end_matches('/'),
            credentials.project_id,
            credentials.model_name
        )
    }

    async fn post_image(&self, url: &str, key: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        let response = self
            .http
            .post(url)
            .header("Prediction-Key", key)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(error_for_status(status.as_u16(), &message));
        }

        let bytes = response.bytes().await.map_err(map_transport_error)?;
        Ok(bytes.to_vec())
    }
}

impl DetectionService for CustomVisionClient {
    async fn detect(&self, image: &DynamicImage, credentials: &ApiCredentials) -> Result<Vec<Detection>> {
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Err(HexError::invalid_parameter("cannot send an empty image for detection"));
        }

        let mut png = Vec::new();
        image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

        let url = Self::prediction_url(credentials);
        debug!(%url, bytes = png.len(), "sending image for detection");

        let body = retry_with_backoff(&self.retry, "detection request", || {
            self.post_image(&url, &credentials.prediction_key, png.clone())
        })
        .await?;

        parse_predictions(&body, width, height)
    }
}

pub(crate) fn map_transport_error(err: reqwest::Error) -> HexError {
    if err.is_timeout() {
        HexError::ServiceUnavailable(format!("request timed out: {}", err))
    } else if err.is_connect() {
        HexError::ServiceUnavailable(format!("connection failed: {}", err))
    } else if err.is_decode() {
        HexError::InvalidResponse(err.to_string())
    } else {
        HexError::ServiceUnavailable(err.to_string())
    }
}

/// Map a non-success HTTP status to an error.
pub fn error_for_status(status: u16, message: &str) -> HexError {
    let detail = format!("status {}: {}", status, message.trim());
    match status {
        401 | 403 => HexError::Authentication(detail),
        408 | 429 | 500..=599 => HexError::ServiceUnavailable(detail),
        _ => HexError::InvalidResponse(detail),
    }
}

/// Parse a prediction response for an image of `width` x `height` pixels.
///
/// Normalized box values are converted to pixels by flooring. Predictions
/// keep their response order, which becomes [`Detection::index`].
pub fn parse_predictions(body: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
    let response: PredictionResponse = serde_json::from_slice(body)
        .map_err(|e| HexError::InvalidResponse(format!("malformed prediction response: {}", e)))?;

    response
        .predictions
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            let prediction: Prediction = serde_json::from_value(raw.clone()).map_err(|e| {
                HexError::InvalidResponse(format!("prediction {} is malformed: {}", index, e))
            })?;
            to_detection(index, prediction, raw, width, height)
        })
        .collect()
}

fn to_detection(
    index: usize,
    prediction: Prediction,
    raw: serde_json::Value,
    width: u32,
    height: u32,
) -> Result<Detection> {
    let invalid = |what: String| HexError::InvalidResponse(format!("prediction {}: {}", index, what));

    if !prediction.probability.is_finite() || !(0.0..=1.0).contains(&prediction.probability) {
        return Err(invalid(format!(
            "probability {} outside [0, 1]",
            prediction.probability
        )));
    }

    let b = &prediction.bounding_box;
    if [b.left, b.top, b.width, b.height].iter().any(|v| !v.is_finite()) {
        return Err(invalid("bounding box contains a non-finite value".to_string()));
    }
    if b.width < 0.0 || b.height < 0.0 {
        return Err(invalid(format!(
            "bounding box has negative size {}x{}",
            b.width, b.height
        )));
    }
    if [b.left, b.top, b.width, b.height].iter().any(|v| !(0.0..=1.0).contains(v))
        || b.left + b.width > 1.0 + BOX_TOLERANCE
        || b.top + b.height > 1.0 + BOX_TOLERANCE
    {
        return Err(invalid(format!(
            "bounding box ({}, {}, {}, {}) is not normalized to the image",
            b.left, b.top, b.width, b.height
        )));
    }

    let to_px = |v: f64, dim: u32| (v * dim as f64).floor();
    let bounding_box = BoundingBox::new(
        to_px(b.left, width) as i32,
        to_px(b.top, height) as i32,
        to_px(b.width, width) as u32,
        to_px(b.height, height) as u32,
    );

    Ok(Detection {
        index,
        bounding_box,
        confidence: prediction.probability as f32,
        label: prediction.tag_name,
        raw_response_fragment: raw,
    })
}
