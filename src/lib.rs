#![warn(rust_2018_idioms)]

//! In-process API analytics SDK.
//!
//! Observes HTTP requests flowing through a host application and ships
//! per-request telemetry events to an ingestion endpoint in batches, from a
//! single background task. The client never blocks the host: `track` is a
//! synchronous buffer insert, all network and disk I/O happens on the worker.
//! Undeliverable batches spill to a line-delimited overflow file and are
//! recovered on restart.

pub mod buffer;
pub mod client;
pub mod config;
pub mod domain;
pub mod middleware;
pub mod sender;
pub mod storage;
mod worker;

// Re-export main types for easy access
pub use client::ApilensClient;
pub use config::endpoint::{is_private_address, validate_endpoint};
pub use config::{ConfigError, DEFAULT_ENDPOINT, Options, RetryConfig};
pub use domain::consumer::{IdentifyConsumerFn, default_identify_consumer, hash_consumer_id};
pub use domain::event::RequestEvent;
pub use middleware::{RequestInfo, ResponseInfo, build_event};
pub use sender::{ErrorCallback, SendError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
