//! Progress handles for prebuffered ranges and the channel-level transfer
//! rate estimate that feeds the adaptive scheduler.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::errors::ChunkError;

const WINDOW_CAPACITY: usize = 32;

/// Caller-visible progress of one prebuffered range. The work unit is one
/// chunk; [`Progress::bytes_per_unit`] converts to bytes.
#[derive(Clone, Debug)]
pub struct Progress {
    inner: Arc<ProgressInner>,
}

#[derive(Debug)]
struct ProgressInner {
    total_chunks: u64,
    chunk_size: u64,
    done: AtomicU64,
    settled: AtomicU64,
    failures: Mutex<Vec<ChunkError>>,
    window: Mutex<VecDeque<(Instant, u64)>>,
    complete: watch::Sender<bool>,
}

impl Progress {
    pub(crate) fn new(total_chunks: u64, chunk_size: u64) -> Self {
        let (complete, _) = watch::channel(total_chunks == 0);

        Self {
            inner: Arc::new(ProgressInner {
                total_chunks,
                chunk_size,
                done: AtomicU64::new(0),
                settled: AtomicU64::new(0),
                failures: Mutex::new(Vec::new()),
                window: Mutex::new(VecDeque::with_capacity(WINDOW_CAPACITY)),
                complete,
            }),
        }
    }

    #[must_use]
    pub fn current_work(&self) -> f64 {
        self.inner.done.load(Ordering::Acquire) as f64
    }

    #[must_use]
    pub fn total_work(&self) -> f64 {
        self.inner.total_chunks as f64
    }

    #[must_use]
    pub fn bytes_per_unit(&self) -> f64 {
        self.inner.chunk_size as f64
    }

    #[must_use]
    pub fn fraction_complete(&self) -> f64 {
        if self.inner.total_chunks == 0 {
            return 1.0;
        }

        self.current_work() / self.total_work()
    }

    /// Verified throughput over the sample window, in Mbit/s. `None` until
    /// two samples exist.
    #[must_use]
    pub fn rate_mbit_per_sec(&self) -> Option<f64> {
        self.rate_bytes_per_sec().map(|rate| rate * 8.0 / 1e6)
    }

    /// Estimated seconds until the range is fully verified.
    #[must_use]
    pub fn eta_seconds(&self) -> Option<f64> {
        let rate = self.rate_bytes_per_sec()?;
        if rate <= 0.0 {
            return None;
        }

        let remaining_chunks = self
            .inner
            .total_chunks
            .saturating_sub(self.inner.done.load(Ordering::Acquire));

        Some(remaining_chunks as f64 * self.inner.chunk_size as f64 / rate)
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        *self.inner.complete.borrow()
    }

    /// Chunk failures observed so far (terminal per chunk).
    #[must_use]
    pub fn failures(&self) -> Vec<ChunkError> {
        self.inner.failures.lock().clone()
    }

    /// Wait until every chunk in the range has settled, successfully or
    /// not. Check [`Self::failures`] afterwards.
    pub async fn wait(&self) {
        let mut rx = self.inner.complete.subscribe();

        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn rate_bytes_per_sec(&self) -> Option<f64> {
        let window = self.inner.window.lock();
        let (first_at, first_done) = window.front()?;
        let (last_at, last_done) = window.back()?;

        let elapsed = last_at.duration_since(*first_at).as_secs_f64();
        if elapsed <= 0.0 || last_done <= first_done {
            return None;
        }

        Some((last_done - first_done) as f64 * self.inner.chunk_size as f64 / elapsed)
    }

    pub(crate) fn record_verified(&self) {
        let done = self.inner.done.fetch_add(1, Ordering::AcqRel) + 1;

        let mut window = self.inner.window.lock();
        if window.len() == WINDOW_CAPACITY {
            let _ = window.pop_front();
        }
        window.push_back((Instant::now(), done));
        drop(window);

        self.settle();
    }

    pub(crate) fn record_failure(&self, error: ChunkError) {
        self.inner.failures.lock().push(error);
        self.settle();
    }

    /// Count chunks that were already valid when the prebuffer started.
    pub(crate) fn record_already_valid(&self, count: u64) {
        let _ = self.inner.done.fetch_add(count, Ordering::AcqRel);
        let _ = self.inner.settled.fetch_add(count, Ordering::AcqRel);
        self.maybe_complete();
    }

    fn settle(&self) {
        let _ = self.inner.settled.fetch_add(1, Ordering::AcqRel);
        self.maybe_complete();
    }

    fn maybe_complete(&self) {
        if self.inner.settled.load(Ordering::Acquire) >= self.inner.total_chunks {
            let _ = self.inner.complete.send(true);
        }
    }
}

/// Channel-wide rolling throughput estimate, fed by the executor as chunks
/// verify and read by the adaptive scheduling policy.
#[derive(Debug, Default)]
pub struct RateWindow {
    samples: Mutex<VecDeque<(Instant, u64)>>,
    total_bytes: AtomicU64,
}

impl RateWindow {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, bytes: u64) {
        let total = self.total_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;

        let mut samples = self.samples.lock();
        if samples.len() == WINDOW_CAPACITY {
            let _ = samples.pop_front();
        }
        samples.push_back((Instant::now(), total));
    }

    #[must_use]
    pub fn bytes_per_sec(&self) -> Option<f64> {
        let samples = self.samples.lock();
        let (first_at, first_total) = samples.front()?;
        let (last_at, last_total) = samples.back()?;

        let elapsed = last_at.duration_since(*first_at).as_secs_f64();
        if elapsed <= 0.0 || last_total <= first_total {
            return None;
        }

        Some((last_total - first_total) as f64 / elapsed)
    }
}
