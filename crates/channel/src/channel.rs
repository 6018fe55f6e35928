//! The public façade: a seekable, asynchronous, content-verifying view of
//! a remote (or local) immutable file.
//!
//! Every read determines the chunks covering the requested window, lets
//! the active scheduling policy arrange downloads for the missing ones,
//! awaits their shared futures, and then serves the bytes from the local
//! cache. Reads overlapping on a chunk share one fetch; reads over
//! disjoint chunks proceed independently.

use core::mem;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use vecdata_merkle::{chunk_digest, MerkleRef, MerkleShape, MerkleState};
use vecdata_transport::Transport;

use crate::cache::CacheFile;
use crate::config::ChannelConfig;
use crate::errors::{ChannelError, ChannelResult, ChunkError};
use crate::executor::{spawn_workers, ExecutorShared};
use crate::inflight::InFlightMap;
use crate::progress::{Progress, RateWindow};
use crate::scheduler::{ChunkScheduler, DefaultScheduler, ScheduleContext, TaskSender};

/// How to bind a channel to its on-disk companions.
#[derive(Debug)]
pub struct ChannelOptions {
    pub reference_path: PathBuf,
    pub cache_path: PathBuf,
    /// Defaults to `<cache_path>.mrkl`.
    pub state_path: Option<PathBuf>,
    pub config: ChannelConfig,
    pub scheduler: Option<Arc<dyn ChunkScheduler>>,
}

impl ChannelOptions {
    pub fn new(reference_path: impl Into<PathBuf>, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            reference_path: reference_path.into(),
            cache_path: cache_path.into(),
            state_path: None,
            config: ChannelConfig::default(),
            scheduler: None,
        }
    }
}

#[derive(Debug)]
pub struct MerkleChannel {
    shared: Arc<ExecutorShared>,
    scheduler: Arc<RwLock<Arc<dyn ChunkScheduler>>>,
    queue: Mutex<Option<TaskSender>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MerkleChannel {
    /// Open a channel over `transport`. Loads and validates the reference,
    /// resumes (or creates) the state sidecar, sizes the sparse cache, and
    /// starts the worker pool.
    pub async fn open(
        transport: Arc<dyn Transport>,
        options: ChannelOptions,
    ) -> ChannelResult<Self> {
        let reference = Arc::new(MerkleRef::load(&options.reference_path)?);
        let shape = *reference.shape();

        let state_path = options.state_path.unwrap_or_else(|| {
            let mut os = options.cache_path.clone().into_os_string();
            os.push(".mrkl");
            PathBuf::from(os)
        });
        let state = Arc::new(MerkleState::open_or_create(&state_path, &reference)?);

        let cache = Arc::new(CacheFile::open_or_create(&options.cache_path, shape.file_size()).await?);

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(ExecutorShared {
            shape,
            reference,
            state,
            transport,
            cache,
            inflight: Arc::new(InFlightMap::new()),
            rate: Arc::new(RateWindow::new()),
            degraded: Arc::new(AtomicBool::new(false)),
            config: options.config,
        });

        let workers = spawn_workers(Arc::clone(&shared), queue_rx);

        info!(
            source = %shared.transport.locator(),
            file_size = shape.file_size(),
            chunk_size = shape.chunk_size(),
            chunks = shape.chunk_count(),
            workers = workers.len(),
            "opened merkle channel"
        );

        Ok(Self {
            shared,
            scheduler: Arc::new(RwLock::new(
                options
                    .scheduler
                    .unwrap_or_else(|| Arc::new(DefaultScheduler)),
            )),
            queue: Mutex::new(Some(queue_tx)),
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
        })
    }

    /// Total size of the underlying file in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.shared.shape.file_size()
    }

    #[must_use]
    pub fn shape(&self) -> &MerkleShape {
        &self.shared.shape
    }

    /// The verified-chunk state backing this channel.
    #[must_use]
    pub fn state(&self) -> &MerkleState {
        &self.shared.state
    }

    /// Outstanding chunk fetches, for diagnostics.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.shared.inflight.len()
    }

    /// True once a state persist failure has demoted this channel to
    /// in-memory state tracking.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.load(Ordering::Acquire)
    }

    /// Swap the scheduling policy. Work already in flight is unaffected;
    /// decisions made after this call use the new policy.
    pub fn set_scheduler(&self, scheduler: Arc<dyn ChunkScheduler>) {
        *self.scheduler.write() = scheduler;
    }

    /// Read up to `buf.len()` bytes starting at `position`, fetching and
    /// verifying any chunks the window still needs. Returns the byte
    /// count, short only at end of file. Dropping the returned future
    /// detaches this caller; downstream fetches continue and still
    /// populate the cache.
    pub async fn read_at(&self, buf: &mut [u8], position: u64) -> ChannelResult<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }

        let file_size = self.shared.shape.file_size();
        if position >= file_size || buf.is_empty() {
            return Ok(0);
        }

        let len = (buf.len() as u64).min(file_size - position);
        self.ensure_valid(position, len).await?;

        let window = &mut buf[..len as usize];
        self.shared.cache.read_range(position, window).await?;

        Ok(window.len())
    }

    /// Trigger fetches for `[offset, offset + length)` and return a
    /// progress handle. Shares in-flight work with reads and other
    /// prebuffers; never duplicates a fetch.
    #[must_use]
    pub fn prebuffer(&self, offset: u64, length: u64) -> Progress {
        let shape = self.shared.shape;
        let Some(chunks) = shape.chunks_covering(offset, length) else {
            return Progress::new(0, shape.chunk_size());
        };

        let total = chunks.end() - chunks.start() + 1;
        let progress = Progress::new(total, shape.chunk_size());

        let missing = self
            .shared
            .state
            .missing_chunks_in_range(*chunks.start(), *chunks.end());
        progress.record_already_valid(total - missing.len() as u64);

        if missing.is_empty() {
            return progress;
        }

        let shared = Arc::clone(&self.shared);
        let scheduler = Arc::clone(&self.scheduler);
        let queue = self.queue.lock().clone();
        let watcher = progress.clone();

        drop(tokio::spawn(async move {
            let Some(queue) = queue else { return };
            let mut failed: HashSet<u64> = HashSet::new();

            loop {
                let missing = shared
                    .state
                    .missing_chunks_in_range(*chunks.start(), *chunks.end());
                if missing.iter().all(|chunk| failed.contains(chunk)) {
                    break;
                }

                let futures = {
                    let policy = Arc::clone(&scheduler.read());
                    let ctx = ScheduleContext {
                        shape: &shared.shape,
                        state: &shared.state,
                        inflight: &shared.inflight,
                        queue: &queue,
                        rate_bytes_per_sec: shared.rate.bytes_per_sec(),
                    };
                    policy.schedule(&ctx, offset, length)
                };

                if futures.is_empty() {
                    tokio::task::yield_now().await;
                    continue;
                }

                let mut settling: FuturesUnordered<_> = futures.into_iter().collect();
                while let Some(result) = settling.next().await {
                    match result {
                        Ok(()) => watcher.record_verified(),
                        Err(err) => {
                            if failed.insert(err.chunk()) {
                                watcher.record_failure(err);
                            }
                        }
                    }
                }
            }
        }));

        progress
    }

    /// Prebuffer a range and wait for it. Fails if any covering chunk
    /// settles with an error.
    pub async fn await_prebuffer(&self, offset: u64, length: u64) -> ChannelResult<()> {
        let progress = self.prebuffer(offset, length);
        progress.wait().await;

        let failures = progress.failures();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ChannelError::ChunksFailed { failures })
        }
    }

    /// Re-hash every currently valid chunk against the reference and clear
    /// the state bit of any chunk whose cached bytes no longer match.
    /// Returns the cleared chunk indices.
    pub async fn reverify(&self) -> ChannelResult<Vec<u64>> {
        let shape = self.shared.shape;
        let mut cleared = Vec::new();

        for chunk in 0..shape.chunk_count() {
            if !self.shared.state.is_valid(chunk) {
                continue;
            }

            let range = self.shared.shape.byte_range_of_chunk(chunk)?;
            let mut buf = vec![0_u8; (range.end - range.start) as usize];
            self.shared.cache.read_range(range.start, &mut buf).await?;

            if chunk_digest(&buf) != self.shared.reference.chunk_hash(chunk)? {
                warn!(chunk, "cached bytes no longer match reference, clearing");
                self.shared.state.clear_valid(chunk)?;
                cleared.push(chunk);
            }
        }

        Ok(cleared)
    }

    /// Stop accepting work, wait for in-flight tasks to drain (bounded by
    /// the configured drain timeout), then release the workers. Abandoned
    /// tasks resolve their futures as failed; verified chunks stay in the
    /// cache and state.
    pub async fn close(&self) -> ChannelResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        drop(self.queue.lock().take());

        let mut workers = { mem::take(&mut *self.workers.lock()) };
        let drained = tokio::time::timeout(self.shared.config.drain_timeout, async {
            for handle in &mut workers {
                let _ = handle.await;
            }
        })
        .await;

        if drained.is_err() {
            let remaining = workers.iter().filter(|handle| !handle.is_finished()).count();
            for handle in &workers {
                handle.abort();
            }
            return Err(ChannelError::DrainTimeout { remaining });
        }

        info!(
            valid = self.shared.state.count_valid(),
            chunks = self.shared.shape.chunk_count(),
            "closed merkle channel"
        );

        Ok(())
    }

    async fn ensure_valid(&self, offset: u64, length: u64) -> ChannelResult<()> {
        loop {
            let Some(chunks) = self.shared.shape.chunks_covering(offset, length) else {
                return Ok(());
            };

            let missing = self
                .shared
                .state
                .missing_chunks_in_range(*chunks.start(), *chunks.end());
            if missing.is_empty() {
                return Ok(());
            }

            let futures = {
                let queue = self.queue.lock();
                let Some(queue) = queue.as_ref() else {
                    return Err(ChannelError::Closed);
                };

                let policy = Arc::clone(&self.scheduler.read());
                let ctx = ScheduleContext {
                    shape: &self.shared.shape,
                    state: &self.shared.state,
                    inflight: &self.shared.inflight,
                    queue,
                    rate_bytes_per_sec: self.shared.rate.bytes_per_sec(),
                };
                policy.schedule(&ctx, offset, length)
            };

            if futures.is_empty() {
                // State advanced between the missing check and scheduling.
                tokio::task::yield_now().await;
                continue;
            }

            let results = futures_util::future::join_all(futures).await;
            let failures: Vec<ChunkError> =
                results.into_iter().filter_map(Result::err).collect();

            if !failures.is_empty() {
                return Err(ChannelError::ChunksFailed { failures });
            }
        }
    }
}
