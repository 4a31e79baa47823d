use crate::config::ConfigError;
use crate::domain::event::RequestEvent;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Connect and total timeout applied to every ingestion request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Statuses worth retrying; everything else non-2xx goes straight to disk.
const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

const BODY_EXCERPT_BYTES: usize = 1024;

/// Invoked with each surfaced delivery failure. Must not block; panics are
/// contained.
pub type ErrorCallback = Arc<dyn Fn(&SendError) + Send + Sync>;

#[derive(Error, Debug)]
pub enum SendError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("ingest returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

impl SendError {
    /// Transport faults and throttling/server statuses warrant a retry;
    /// other statuses mean the batch will never be accepted as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            SendError::Network(_) => true,
            SendError::Status { status, .. } => RETRYABLE_STATUSES.contains(status),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            SendError::Network(e) => e.status().map(|s| s.as_u16()),
            SendError::Status { status, .. } => Some(*status),
        }
    }
}

/// Posts event batches to the ingestion endpoint.
#[derive(Debug, Clone)]
pub struct HttpSender {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSender {
    pub(crate) fn new(endpoint: &str, api_key: &str) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_str(api_key).map_err(|_| ConfigError::InvalidApiKey)?,
        );
        headers.insert(
            HeaderName::from_static("x-apilens-sdk"),
            HeaderValue::from_str(&format!("rust/{}", crate::VERSION))
                .map_err(|e| ConfigError::HttpClient(e.to_string()))?,
        );

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }

    /// Sends one batch as a JSON array. Exactly one of these runs at a time
    /// per client; the scheduler guarantees it via the in-flight flag.
    pub(crate) async fn send_batch(&self, batch: &[RequestEvent]) -> Result<(), SendError> {
        let response = self.client.post(&self.endpoint).json(&batch).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = excerpt(response.text().await.unwrap_or_default());
        Err(SendError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn excerpt(mut body: String) -> String {
    if body.len() > BODY_EXCERPT_BYTES {
        let mut end = BODY_EXCERPT_BYTES;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_status_set() {
        for status in [429, 500, 502, 503, 504] {
            let err = SendError::Status {
                status,
                body: String::new(),
            };
            assert!(err.is_retryable(), "{status} should be retryable");
        }
        for status in [400, 401, 403, 404, 413, 422, 501] {
            let err = SendError::Status {
                status,
                body: String::new(),
            };
            assert!(!err.is_retryable(), "{status} should not be retryable");
        }
    }

    #[test]
    fn excerpt_caps_body_on_char_boundary() {
        let body = "é".repeat(1024);
        let cut = excerpt(body);
        assert!(cut.len() <= BODY_EXCERPT_BYTES);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
