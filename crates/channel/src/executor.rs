//! Worker pool that materializes download tasks: fetch the span, hash
//! each chunk, compare against the reference, commit matching bytes to
//! the cache, persist the state bit, resolve the chunk's future.
//!
//! Transport errors are retried with bounded exponential backoff. Hash
//! mismatches are terminal for the chunk: a corrupt reference or a
//! hostile origin does not get better by asking again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};
use vecdata_merkle::{chunk_digest, MerkleRef, MerkleShape, MerkleState};
use vecdata_transport::{Transport, TransportError};

use crate::cache::CacheFile;
use crate::config::ChannelConfig;
use crate::errors::ChunkError;
use crate::inflight::{ChunkCommit, InFlightMap};
use crate::progress::RateWindow;
use crate::scheduler::{FetchTask, TaskReceiver};

/// Everything a worker needs, shared across the pool.
#[derive(Debug)]
pub(crate) struct ExecutorShared {
    pub shape: MerkleShape,
    pub reference: Arc<MerkleRef>,
    pub state: Arc<MerkleState>,
    pub transport: Arc<dyn Transport>,
    pub cache: Arc<CacheFile>,
    pub inflight: Arc<InFlightMap>,
    pub rate: Arc<RateWindow>,
    pub degraded: Arc<AtomicBool>,
    pub config: ChannelConfig,
}

pub(crate) fn spawn_workers(
    shared: Arc<ExecutorShared>,
    queue: TaskReceiver,
) -> Vec<JoinHandle<()>> {
    let queue = Arc::new(Mutex::new(queue));

    (0..shared.config.workers.max(1))
        .map(|worker| {
            let shared = Arc::clone(&shared);
            let queue = Arc::clone(&queue);

            tokio::spawn(async move {
                loop {
                    let task = { queue.lock().await.recv().await };
                    let Some(task) = task else { break };

                    process_task(&shared, task).await;
                }

                trace!(worker, "download worker drained");
            })
        })
        .collect()
}

async fn process_task(shared: &ExecutorShared, task: FetchTask) {
    let Ok(range) = shared
        .shape
        .byte_range_of_span(task.first_chunk, task.last_chunk)
    else {
        // A task outside the tree can only come from a defective policy;
        // dropping the commits resolves its futures as abandoned.
        warn!(
            first_chunk = task.first_chunk,
            last_chunk = task.last_chunk,
            "dropping task outside the chunk range"
        );
        return;
    };

    let offset = range.start;
    let expected = range.end - range.start;

    match fetch_with_retry(shared, offset, expected).await {
        Ok(body) => commit_chunks(shared, task, offset, &body).await,
        Err((attempts, reason)) => {
            warn!(
                first_chunk = task.first_chunk,
                last_chunk = task.last_chunk,
                attempts,
                %reason,
                "task failed after retries"
            );

            for commit in task.commits {
                let chunk = commit.chunk();
                shared.inflight.remove(chunk);
                commit.complete(Err(ChunkError::TransportFailure {
                    chunk,
                    attempts,
                    reason: reason.clone(),
                }));
            }
        }
    }
}

/// Fetch `[offset, offset + expected)` into memory, retrying transport
/// failures (including per-attempt timeouts) with doubling delays.
async fn fetch_with_retry(
    shared: &ExecutorShared,
    offset: u64,
    expected: u64,
) -> Result<Vec<u8>, (u32, String)> {
    let attempts = shared.config.retry_attempts.max(1);

    let mut attempt = 0;
    loop {
        attempt += 1;

        let outcome = tokio::time::timeout(
            shared.config.transport_timeout,
            fetch_once(shared, offset, expected),
        )
        .await;

        let reason = match outcome {
            Ok(Ok(body)) => return Ok(body),
            Ok(Err(reason)) => reason,
            Err(_) => format!(
                "fetch timed out after {:?}",
                shared.config.transport_timeout
            ),
        };

        if attempt >= attempts {
            return Err((attempt, reason));
        }

        let delay = shared.config.retry_base_delay * (1 << (attempt - 1));
        warn!(offset, expected, attempt, %reason, "fetch failed, backing off");
        tokio::time::sleep(delay).await;
    }
}

async fn fetch_once(shared: &ExecutorShared, offset: u64, expected: u64) -> Result<Vec<u8>, String> {
    let response = shared
        .transport
        .fetch(offset, expected)
        .await
        .map_err(|err| err.to_string())?;

    let body = response.read_all().await.map_err(|err| err.to_string())?;

    if (body.len() as u64) < expected {
        return Err(TransportError::ShortRead {
            locator: shared.transport.locator(),
            got: body.len() as u64,
            expected,
        }
        .to_string());
    }

    Ok(body)
}

/// Hash, compare, and commit every chunk slice of a fetched span. Each
/// chunk settles independently; one bad slice does not fail its
/// neighbors.
async fn commit_chunks(shared: &ExecutorShared, task: FetchTask, span_start: u64, body: &[u8]) {
    let mut writer = match shared.cache.writer().await {
        Ok(writer) => writer,
        Err(err) => {
            let err = Arc::new(err);
            for commit in task.commits {
                let chunk = commit.chunk();
                shared.inflight.remove(chunk);
                commit.complete(Err(ChunkError::LocalIo {
                    chunk,
                    error: Arc::clone(&err),
                }));
            }
            return;
        }
    };

    for commit in task.commits {
        let chunk = commit.chunk();
        if let Err(err) = commit_one(shared, &mut writer, commit, span_start, body).await {
            debug!(chunk, %err, "chunk failed");
        }
    }
}

async fn commit_one(
    shared: &ExecutorShared,
    writer: &mut crate::cache::CacheWriter,
    commit: ChunkCommit,
    span_start: u64,
    body: &[u8],
) -> Result<(), ChunkError> {
    let chunk = commit.chunk();

    let (range, expected_hash) = match shared
        .shape
        .byte_range_of_chunk(chunk)
        .and_then(|range| Ok((range, shared.reference.chunk_hash(chunk)?)))
    {
        Ok(pair) => pair,
        Err(_) => {
            // Unreachable for tasks built from the same shape; settle as
            // abandoned rather than panic.
            let err = ChunkError::Abandoned { chunk };
            shared.inflight.remove(chunk);
            commit.complete(Err(err.clone()));
            return Err(err);
        }
    };

    let lo = (range.start - span_start) as usize;
    let hi = (range.end - span_start) as usize;
    let slice = &body[lo..hi];

    let actual_hash = chunk_digest(slice);
    if actual_hash != expected_hash {
        let err = ChunkError::HashMismatch {
            chunk,
            expected: hex::encode(expected_hash),
            actual: hex::encode(actual_hash),
            locator: shared.transport.locator(),
        };
        warn!(chunk, %err, "rejecting chunk");
        shared.inflight.remove(chunk);
        commit.complete(Err(err.clone()));
        return Err(err);
    }

    if let Err(err) = writer.write_chunk(range.start, slice).await {
        let err = ChunkError::LocalIo {
            chunk,
            error: Arc::new(err),
        };
        shared.inflight.remove(chunk);
        commit.complete(Err(err.clone()));
        return Err(err);
    }

    // Cache bytes are durable past this point; only now may the state bit
    // become visible.
    if shared.degraded.load(Ordering::Acquire) {
        let _ = shared.state.mark_valid_volatile(chunk);
    } else if let Err(err) = shared.state.mark_valid(chunk) {
        if !shared.degraded.swap(true, Ordering::AcqRel) {
            error!(%err, "state persistence failed, continuing with in-memory state only");
        }
    }

    shared.rate.record(slice.len() as u64);
    trace!(chunk, bytes = slice.len(), "chunk verified");

    // The state bit is visible by now, so dropping the in-flight entry
    // before resolving the future cannot admit a duplicate fetch.
    shared.inflight.remove(chunk);
    commit.complete(Ok(()));

    Ok(())
}
