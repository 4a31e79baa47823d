mod signals;

use crate::buffer::{EventBuffer, Wake};
use crate::config::{ConfigError, Options};
use crate::domain::event::{self, RequestEvent};
use crate::sender::HttpSender;
use crate::storage::DiskStore;
use crate::worker::{self, FlushContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const WAKE_CHANNEL_CAPACITY: usize = 8;

/// The analytics client.
///
/// Construction validates the credential and endpoint, then spawns the
/// background flush worker; it must therefore run inside a Tokio runtime.
/// After that, `track` is a cheap synchronous call safe on any thread and
/// every failure mode is absorbed internally: the host application never
/// sees an error from telemetry.
///
/// ```no_run
/// # async fn wiring() -> Result<(), apilens::ConfigError> {
/// use apilens::{ApilensClient, Options, RequestEvent};
///
/// let client = ApilensClient::new(Options::new("ak_live_abc123"))?;
/// client.track(RequestEvent {
///     method: "GET".into(),
///     path: "/api/users".into(),
///     status_code: 200,
///     response_time_ms: 12.5,
///     ..RequestEvent::default()
/// });
/// # Ok(())
/// # }
/// ```
pub struct ApilensClient {
    options: Options,
    buffer: Arc<EventBuffer>,
    ctx: Arc<FlushContext>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown_started: AtomicBool,
}

impl ApilensClient {
    pub fn new(options: Options) -> Result<Self, ConfigError> {
        options.validate()?;

        let sender = HttpSender::new(&options.endpoint, &options.api_key)?;
        let (wake_tx, wake_rx) = mpsc::channel(WAKE_CHANNEL_CAPACITY);
        let buffer = Arc::new(EventBuffer::new(
            options.max_buffer_size,
            options.batch_size,
            wake_tx,
        ));

        let storage_path = options
            .storage_path
            .clone()
            .unwrap_or_else(|| DiskStore::default_path(&options.endpoint));
        let store = DiskStore::new(storage_path, options.max_storage_bytes);

        let ctx = Arc::new(FlushContext {
            buffer: buffer.clone(),
            store,
            sender,
            retry: options.retry.clone(),
            capacity: options.max_buffer_size,
            on_error: options.on_error.clone(),
            debug: options.debug,
        });

        let worker = tokio::spawn(worker::run(ctx.clone(), wake_rx, options.flush_interval));

        debug!(endpoint = %options.endpoint, "analytics client started");
        Ok(Self {
            options,
            buffer,
            ctx,
            worker: Mutex::new(Some(worker)),
            shutdown_started: AtomicBool::new(false),
        })
    }

    /// Auto-wiring entry point: builds a client from `APILENS_API_KEY` and
    /// `APILENS_ENDPOINT`. Returns `Ok(None)` when either is unset or
    /// empty, so hosts can make telemetry strictly opt-in.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        match Options::from_env() {
            Some(options) => Self::new(options).map(Some),
            None => Ok(None),
        }
    }

    /// The validated ingestion endpoint. Immutable for the client's life.
    pub fn endpoint(&self) -> &str {
        &self.options.endpoint
    }

    /// Events currently buffered in memory.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Submits one request observation.
    ///
    /// Sanitizes and buffers the event; performs no I/O, never blocks on
    /// the network and never errors. Oversized events and events submitted
    /// after shutdown are silently discarded.
    pub fn track(&self, event: RequestEvent) {
        if self.buffer.is_done() {
            return;
        }

        match event::sanitize(event, self.options.max_event_bytes) {
            Some(event) => {
                self.buffer.push(event);
            }
            None => {
                debug!("dropping event over the per-event byte ceiling");
                if self.options.debug {
                    eprintln!("apilens: dropping oversized event");
                }
            }
        }
    }

    /// Drains and sends buffered events until the buffer is empty or an
    /// attempt fails. Failures are reported through `on_error` and the
    /// usual diagnostics, never returned.
    pub async fn flush(&self) {
        loop {
            let batch = self.buffer.drain_batch();
            if batch.is_empty() {
                break;
            }
            if !self.ctx.flush_batch(batch).await {
                break;
            }
        }
    }

    /// Graceful shutdown: stops the worker, attempts a final flush, and
    /// spills anything still buffered to the overflow file. Idempotent; a
    /// second call returns immediately.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("shutting down analytics client");

        self.buffer.set_done();
        self.buffer.wake(Wake::Stop);

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!("flush worker did not stop in time, aborting it");
                handle.abort();
            }
        }

        self.flush().await;
        self.persist_residual();
    }

    /// Fast-path shutdown for process-exit contexts: no worker join, no
    /// network; the residual buffer goes straight to disk. Also runs on
    /// `Drop` as a last resort.
    pub fn shutdown_sync(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("synchronous shutdown, persisting residual buffer");

        self.buffer.set_done();
        self.buffer.wake(Wake::Stop);
        self.persist_residual();
    }

    /// Spawns a listener that runs graceful shutdown on SIGTERM or SIGINT.
    /// The listener holds only a weak reference, so dropping the client
    /// still tears everything down.
    pub fn install_signal_handlers(self: &Arc<Self>) {
        signals::spawn_signal_listener(Arc::downgrade(self));
    }

    fn persist_residual(&self) {
        let leftover = self.buffer.take_all();
        if leftover.is_empty() {
            return;
        }
        // Keep the one-line-per-batch disk shape.
        for chunk in leftover.chunks(self.options.batch_size) {
            self.ctx.persist_batch(chunk);
        }
    }
}

impl Drop for ApilensClient {
    fn drop(&mut self) {
        self.shutdown_sync();
    }
}

impl std::fmt::Debug for ApilensClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApilensClient")
            .field("endpoint", &self.options.endpoint)
            .field("pending", &self.buffer.len())
            .field("shutdown_started", &self.shutdown_started.load(Ordering::SeqCst))
            .finish()
    }
}
