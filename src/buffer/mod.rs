use crate::config::RetryConfig;
use crate::domain::event::RequestEvent;
use rand::Rng;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Tokens carried on the worker wake channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Flush,
    Stop,
}

/// Outcome of a retryable delivery failure.
pub(crate) enum RetryOutcome {
    /// Batch re-inserted at the head; draining is paused until the backoff
    /// window passes. `dropped` is the tail that no longer fit.
    Backoff {
        attempt: u32,
        delay: Duration,
        dropped: usize,
    },
    /// The retry budget is exhausted; the batch is handed back for
    /// persistence and the failure counter starts over.
    GaveUp { batch: Vec<RequestEvent> },
}

/// Flush bookkeeping shared between caller threads and the worker.
///
/// Everything the retry state machine touches lives under the one mutex:
/// the queue, the in-flight flag, the failure counter, the backoff deadline
/// and the pending recovery-file pointer.
struct FlushState {
    queue: VecDeque<RequestEvent>,
    in_flight: bool,
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
    recovering_path: Option<PathBuf>,
}

/// Thread-safe bounded FIFO of sanitized events.
pub struct EventBuffer {
    state: Mutex<FlushState>,
    capacity: usize,
    batch_size: usize,
    wake_tx: mpsc::Sender<Wake>,
    done: AtomicBool,
    dropped: AtomicU64,
}

impl EventBuffer {
    pub(crate) fn new(capacity: usize, batch_size: usize, wake_tx: mpsc::Sender<Wake>) -> Self {
        Self {
            state: Mutex::new(FlushState {
                queue: VecDeque::new(),
                in_flight: false,
                consecutive_failures: 0,
                backoff_until: None,
                recovering_path: None,
            }),
            capacity,
            batch_size,
            wake_tx,
            done: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, FlushState> {
        // A poisoned lock means a panic elsewhere; the queue itself is still
        // coherent, and dropping telemetry is worse than continuing.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().queue.is_empty()
    }

    /// Total events dropped at admission since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn set_done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Non-blocking wake; a full channel means the worker already has
    /// pending wakeups, which is just as good.
    pub(crate) fn wake(&self, token: Wake) {
        let _ = self.wake_tx.try_send(token);
    }

    /// Appends an event, or drops it when the buffer is at capacity or the
    /// client is shutting down. A full buffer wakes the worker instead of
    /// growing.
    pub(crate) fn push(&self, event: RequestEvent) -> bool {
        if self.is_done() {
            return false;
        }

        let len = {
            let mut state = self.state();
            if state.queue.len() >= self.capacity {
                drop(state);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.wake(Wake::Flush);
                tracing::debug!(capacity = self.capacity, "event buffer full, dropping event");
                return false;
            }
            state.queue.push_back(event);
            state.queue.len()
        };

        if len == self.batch_size {
            self.wake(Wake::Flush);
        }
        true
    }

    /// Removes up to `batch_size` leading events and marks a send in
    /// flight. Returns an empty batch while another send is outstanding,
    /// during a backoff window, or when there is nothing to send.
    pub(crate) fn drain_batch(&self) -> Vec<RequestEvent> {
        let mut state = self.state();

        if state.queue.is_empty() || state.in_flight {
            return Vec::new();
        }
        if let Some(until) = state.backoff_until {
            if Instant::now() < until {
                return Vec::new();
            }
            state.backoff_until = None;
        }

        let take = self.batch_size.min(state.queue.len());
        let batch: Vec<RequestEvent> = state.queue.drain(..take).collect();
        state.in_flight = true;
        batch
    }

    /// Terminal path: delivery succeeded. Resets the failure state and
    /// hands back the recovery file awaiting deletion, if any.
    pub(crate) fn flush_succeeded(&self) -> Option<PathBuf> {
        let mut state = self.state();
        state.in_flight = false;
        state.consecutive_failures = 0;
        state.backoff_until = None;
        state.recovering_path.take()
    }

    /// Terminal path: the endpoint rejected the batch outright. The caller
    /// persists it; only the in-flight flag needs clearing.
    pub(crate) fn flush_failed_nonretryable(&self) {
        self.state().in_flight = false;
    }

    /// Terminal path: transient failure. Re-inserts the prefix that fits at
    /// the head and opens a backoff window, or gives the batch up for
    /// persistence once the retry budget is spent.
    pub(crate) fn record_retryable_failure(
        &self,
        mut batch: Vec<RequestEvent>,
        retry: &RetryConfig,
    ) -> RetryOutcome {
        let mut state = self.state();
        state.in_flight = false;
        state.consecutive_failures += 1;
        let attempt = state.consecutive_failures;

        if attempt >= retry.max_attempts {
            state.consecutive_failures = 0;
            return RetryOutcome::GaveUp { batch };
        }

        // Re-prepend so older events keep their place ahead of anything
        // admitted during the failed send; the tail that no longer fits is
        // dropped to keep the cap.
        let space = self.capacity - state.queue.len();
        let dropped = batch.len().saturating_sub(space);
        batch.truncate(batch.len() - dropped);
        for event in batch.into_iter().rev() {
            state.queue.push_front(event);
        }
        self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);

        let delay = backoff_delay(retry, attempt);
        state.backoff_until = Some(Instant::now() + delay);

        RetryOutcome::Backoff {
            attempt,
            delay,
            dropped,
        }
    }

    /// Appends recovered events at the tail, stopping at capacity. Returns
    /// how many were admitted.
    pub(crate) fn extend_back(&self, events: Vec<RequestEvent>) -> usize {
        let (before, after) = {
            let mut state = self.state();
            let before = state.queue.len();
            let space = self.capacity - before;
            for event in events.into_iter().take(space) {
                state.queue.push_back(event);
            }
            (before, state.queue.len())
        };

        if before < self.batch_size && after >= self.batch_size {
            self.wake(Wake::Flush);
        }
        after - before
    }

    /// Empties the queue regardless of flush state; used by shutdown to
    /// persist whatever is left.
    pub(crate) fn take_all(&self) -> Vec<RequestEvent> {
        self.state().queue.drain(..).collect()
    }

    pub(crate) fn set_recovering_path(&self, path: PathBuf) {
        self.state().recovering_path = Some(path);
    }

    /// True while a recovery file has been loaded but not yet confirmed by
    /// a successful flush; recovery passes skip the disk meanwhile so the
    /// same events are not loaded twice.
    pub(crate) fn has_pending_recovery(&self) -> bool {
        self.state().recovering_path.is_some()
    }
}

fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = retry.base_backoff * 2u32.pow(exponent);
    if retry.jitter {
        base.mul_f64(rand::rng().random_range(0.5..1.0))
    } else {
        base
    }
}

impl std::fmt::Debug for EventBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("EventBuffer")
            .field("capacity", &self.capacity)
            .field("batch_size", &self.batch_size)
            .field("len", &state.queue.len())
            .field("in_flight", &state.in_flight)
            .field("consecutive_failures", &state.consecutive_failures)
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}
