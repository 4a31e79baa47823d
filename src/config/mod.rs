pub mod endpoint;

use crate::domain::consumer::IdentifyConsumerFn;
use crate::sender::ErrorCallback;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Ingestion endpoint used when none is configured.
pub const DEFAULT_ENDPOINT: &str = "https://ingest.apilens.dev/v1/events";

/// Environment variables read by [`Options::from_env`].
pub const ENV_API_KEY: &str = "APILENS_API_KEY";
pub const ENV_ENDPOINT: &str = "APILENS_ENDPOINT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("api_key is required")]
    MissingApiKey,
    #[error("api_key must not contain control characters")]
    InvalidApiKey,
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Retry policy for transient delivery failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Consecutive failures after which the batch is written to disk.
    pub max_attempts: u32,
    /// Base of the exponential backoff window.
    pub base_backoff: Duration,
    /// Multiply each backoff by uniform(0.5, 1.0).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            jitter: true,
        }
    }
}

/// Client configuration.
///
/// Everything except `api_key` has a production default. The endpoint is
/// validated at construction and immutable afterwards.
#[derive(Clone)]
pub struct Options {
    /// Credential forwarded as the `x-api-key` header. Required.
    pub api_key: String,
    /// Ingestion URL. Screened against private address ranges; `http` is
    /// only accepted for localhost targets.
    pub endpoint: String,
    /// Maximum time between flushes.
    pub flush_interval: Duration,
    /// Events per POST; reaching this count also wakes the worker.
    pub batch_size: usize,
    /// Hard cap on buffered events.
    pub max_buffer_size: usize,
    /// Hard cap on the on-disk overflow file, in bytes.
    pub max_storage_bytes: u64,
    /// Serialized per-event ceiling, in bytes.
    pub max_event_bytes: usize,
    /// Overflow file location. Defaults to the system temp directory with a
    /// file name derived from the endpoint.
    pub storage_path: Option<PathBuf>,
    /// Override for consumer-ID derivation from request headers.
    pub identify_consumer: Option<IdentifyConsumerFn>,
    /// Include the sorted query string in the event `path`.
    pub collect_query_string: bool,
    /// Invoked with each surfaced delivery failure.
    pub on_error: Option<ErrorCallback>,
    /// Mirror diagnostics to stderr, for hosts without a tracing subscriber.
    pub debug: bool,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            flush_interval: Duration::from_secs(15),
            batch_size: 250,
            max_buffer_size: 10_000,
            max_storage_bytes: 5 * 1024 * 1024,
            max_event_bytes: 64 * 1024,
            storage_path: None,
            identify_consumer: None,
            collect_query_string: false,
            on_error: None,
            debug: false,
            retry: RetryConfig::default(),
        }
    }
}

impl Options {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Builds options from `APILENS_API_KEY` and `APILENS_ENDPOINT`.
    ///
    /// Returns `None` unless both variables are set and non-empty, so hosts
    /// can auto-wire the client only when explicitly configured.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var(ENV_API_KEY).ok().filter(|v| !v.is_empty())?;
        let endpoint = std::env::var(ENV_ENDPOINT).ok().filter(|v| !v.is_empty())?;

        Some(Self {
            api_key,
            endpoint,
            ..Self::default()
        })
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.is_empty() {
            return Err(ConfigError::MissingApiKey);
        }

        if self.api_key.bytes().any(|b| b < 0x20 || b == 0x7f) {
            return Err(ConfigError::InvalidApiKey);
        }

        endpoint::validate_endpoint(&self.endpoint)?;

        if self.batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.max_buffer_size < self.batch_size {
            return Err(ConfigError::InvalidConfig(format!(
                "max_buffer_size ({}) must be at least as large as batch_size ({})",
                self.max_buffer_size, self.batch_size
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "retry max_attempts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("api_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("flush_interval", &self.flush_interval)
            .field("batch_size", &self.batch_size)
            .field("max_buffer_size", &self.max_buffer_size)
            .field("max_storage_bytes", &self.max_storage_bytes)
            .field("max_event_bytes", &self.max_event_bytes)
            .field("storage_path", &self.storage_path)
            .field("identify_consumer", &self.identify_consumer.as_ref().map(|_| ".."))
            .field("collect_query_string", &self.collect_query_string)
            .field("on_error", &self.on_error.as_ref().map(|_| ".."))
            .field("debug", &self.debug)
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_production_values() {
        let opts = Options::default();
        assert_eq!(opts.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(opts.flush_interval, Duration::from_secs(15));
        assert_eq!(opts.batch_size, 250);
        assert_eq!(opts.max_buffer_size, 10_000);
        assert_eq!(opts.max_storage_bytes, 5 * 1024 * 1024);
        assert_eq!(opts.max_event_bytes, 64 * 1024);
    }

    #[test]
    fn rejects_missing_api_key() {
        let opts = Options::default();
        assert!(matches!(opts.validate(), Err(ConfigError::MissingApiKey)));
    }

    #[test]
    fn rejects_control_characters_in_api_key() {
        for key in ["bad\x00key", "bad\nkey", "bad\x7fkey", "\x1b[0m"] {
            let opts = Options::new(key);
            assert!(
                matches!(opts.validate(), Err(ConfigError::InvalidApiKey)),
                "{key:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_batch_size_larger_than_buffer() {
        let opts = Options {
            batch_size: 100,
            max_buffer_size: 50,
            ..Options::new("ak_live_abc123")
        };
        assert!(matches!(opts.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn accepts_valid_options() {
        let opts = Options::new("ak_live_abc123");
        assert!(opts.validate().is_ok());
    }
}
