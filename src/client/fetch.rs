//! Downloads source images given by URL.

use std::time::Duration;

use tracing::debug;

use super::custom_vision::map_transport_error;
use super::{DEFAULT_REQUEST_TIMEOUT, RetryPolicy, retry_with_backoff};
use crate::error::{HexError, Result};

/// HTTP(S) image downloader sharing the detection client's retry rules.
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl ImageFetcher {
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

    /// Fetch the raw bytes behind `url`.
    ///
    /// Only `http` and `https` URLs are accepted. Timeouts, connection
    /// failures and 408/429/5xx answers are retried; any other non-success
    /// status fails straight away as an I/O error.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| HexError::invalid_parameter(format!("invalid image URL '{}': {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(HexError::invalid_parameter(format!(
                "unsupported URL scheme '{}' in '{}'",
                parsed.scheme(),
                url
            )));
        }

        let bytes = retry_with_backoff(&self.retry, "image download", || self.get(parsed.clone())).await?;
        debug!(%url, bytes = bytes.len(), "image downloaded");
        Ok(bytes)
    }

    async fn get(&self, url: reqwest::Url) -> Result<Vec<u8>> {
        let response = self.http.get(url.clone()).send().await.map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let detail = format!("download of {} failed with status {}", url, code);
            return Err(match code {
                408 | 429 | 500..=599 => HexError::ServiceUnavailable(detail),
                _ => HexError::Io(std::io::Error::other(detail)),
            });
        }

        let bytes = response.bytes().await.map_err(map_transport_error)?;
        Ok(bytes.to_vec())
    }
}

/// Identifier for an image fetched from `url`: the stem of the last non-empty
/// path segment, or the host when the path is empty.
pub fn id_from_url(url: &str) -> String {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return "url_image".to_string();
    };
    let segment = parsed
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .map(|s| match s.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => s.to_string(),
        });
    segment
        .or_else(|| parsed.host_str().map(str::to_string))
        .unwrap_or_else(|| "url_image".to_string())
}
