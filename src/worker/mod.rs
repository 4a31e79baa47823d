use crate::buffer::{EventBuffer, RetryOutcome, Wake};
use crate::config::RetryConfig;
use crate::domain::event::RequestEvent;
use crate::sender::{ErrorCallback, HttpSender, SendError};
use crate::storage::DiskStore;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

/// How often the scheduler probes the overflow file for persisted events.
pub(crate) const DISK_RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Everything a flush needs; shared between the background worker and the
/// client's explicit `flush`/`shutdown` paths so both run the same retry
/// state machine.
pub(crate) struct FlushContext {
    pub buffer: Arc<EventBuffer>,
    pub store: DiskStore,
    pub sender: HttpSender,
    pub retry: RetryConfig,
    pub capacity: usize,
    pub on_error: Option<ErrorCallback>,
    pub debug: bool,
}

impl FlushContext {
    /// Runs one flush attempt to completion. Returns true on delivery.
    pub(crate) async fn flush_batch(&self, batch: Vec<RequestEvent>) -> bool {
        let count = batch.len();

        match self.sender.send_batch(&batch).await {
            Ok(()) => {
                if let Some(path) = self.buffer.flush_succeeded() {
                    match std::fs::remove_file(&path) {
                        Ok(()) => debug!(path = %path.display(), "deleted recovery file"),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => warn!(path = %path.display(), error = %e, "failed to delete recovery file"),
                    }
                }
                debug!(count, "batch delivered");
                true
            }
            Err(error) if error.is_retryable() => {
                match self.buffer.record_retryable_failure(batch, &self.retry) {
                    RetryOutcome::Backoff {
                        attempt,
                        delay,
                        dropped,
                    } => {
                        warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            dropped,
                            error = %error,
                            "delivery failed, batch requeued"
                        );
                    }
                    RetryOutcome::GaveUp { batch } => {
                        warn!(
                            attempts = self.retry.max_attempts,
                            error = %error,
                            "retry budget exhausted, spilling batch to disk"
                        );
                        self.persist_batch(&batch);
                    }
                }
                self.report_error(&error);
                false
            }
            Err(error) => {
                self.buffer.flush_failed_nonretryable();
                warn!(error = %error, count, "delivery rejected, spilling batch to disk");
                self.persist_batch(&batch);
                self.report_error(&error);
                false
            }
        }
    }

    /// Loads persisted events behind the live buffer, remembering the
    /// snapshot file for deletion after the next successful flush. Skipped
    /// while an earlier snapshot is still awaiting confirmation.
    pub(crate) fn recover_from_disk(&self) {
        if self.buffer.has_pending_recovery() {
            return;
        }

        let space = self.capacity.saturating_sub(self.buffer.len());
        match self.store.recover(space) {
            Ok(Some(recovered)) => {
                self.buffer.set_recovering_path(recovered.recovering_path);
                let count = self.buffer.extend_back(recovered.events);
                debug!(count, "reloaded persisted events into buffer");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "disk recovery failed");
                if self.debug {
                    eprintln!("apilens: disk recovery failed: {e}");
                }
            }
        }
    }

    /// Best-effort write to the overflow file; a refused write means the
    /// events are gone, which is reported but never propagated.
    pub(crate) fn persist_batch(&self, batch: &[RequestEvent]) {
        match self.store.persist_batch(batch) {
            Ok(()) => {
                if self.debug {
                    eprintln!(
                        "apilens: persisted {} events to {}",
                        batch.len(),
                        self.store.path().display()
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, count = batch.len(), "dropping batch, overflow write refused");
                if self.debug {
                    eprintln!("apilens: dropping {} events: {e}", batch.len());
                }
            }
        }
    }

    fn report_error(&self, error: &SendError) {
        if self.debug {
            eprintln!("apilens: delivery failed: {error}");
        }
        if let Some(on_error) = &self.on_error {
            // The callback is host code; whatever it does must not take the
            // worker down with it.
            let _ = catch_unwind(AssertUnwindSafe(|| on_error(error)));
        }
    }
}

/// The flush scheduler: a single long-lived task that waits on the wake
/// channel with the flush interval as its timeout, drains at most one batch
/// per cycle, and periodically reloads spilled events from disk.
pub(crate) async fn run(
    ctx: Arc<FlushContext>,
    mut wake_rx: mpsc::Receiver<Wake>,
    flush_interval: Duration,
) {
    debug!("flush worker started");

    ctx.recover_from_disk();
    let mut last_recovery = Instant::now();

    loop {
        let wake = timeout(flush_interval, wake_rx.recv()).await;
        if matches!(wake, Ok(Some(Wake::Stop)) | Ok(None)) || ctx.buffer.is_done() {
            break;
        }

        let batch = ctx.buffer.drain_batch();
        if !batch.is_empty() {
            ctx.flush_batch(batch).await;
        }

        if last_recovery.elapsed() >= DISK_RECOVERY_INTERVAL {
            ctx.recover_from_disk();
            last_recovery = Instant::now();
        }
    }

    debug!("flush worker stopped");
}
