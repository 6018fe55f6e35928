//! Download scheduling policies.
//!
//! A scheduler is a stateless policy object: everything it works on — the
//! tree shape, the verified-chunk state, the in-flight map, the task queue
//! and the observed transfer rate — arrives through [`ScheduleContext`].
//! Policies can therefore be swapped on a live channel without disturbing
//! work already in flight.

use core::fmt;
use core::mem;
use core::ops::RangeInclusive;

use tokio::sync::mpsc;
use tracing::trace;
use vecdata_merkle::{MerkleShape, MerkleState};

use crate::inflight::{ChunkClaim, ChunkCommit, ChunkFuture, InFlightMap};

/// One unit of executor work: materialize the contiguous chunk span
/// `first_chunk..=last_chunk` with a single source fetch. A leaf task has
/// a span of one; coalesced tasks carry one commit handle per chunk.
#[derive(Debug)]
pub struct FetchTask {
    pub first_chunk: u64,
    pub last_chunk: u64,
    pub commits: Vec<ChunkCommit>,
}

pub type TaskSender = mpsc::UnboundedSender<FetchTask>;
pub type TaskReceiver = mpsc::UnboundedReceiver<FetchTask>;

/// Everything a policy may consult. Owned by the channel; rebuilt per
/// scheduling call.
pub struct ScheduleContext<'a> {
    pub shape: &'a MerkleShape,
    pub state: &'a MerkleState,
    pub inflight: &'a InFlightMap,
    pub queue: &'a TaskSender,
    /// Rolling estimate of verified throughput, if any samples exist yet.
    pub rate_bytes_per_sec: Option<f64>,
}

impl fmt::Debug for ScheduleContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleContext")
            .field("rate_bytes_per_sec", &self.rate_bytes_per_sec)
            .finish_non_exhaustive()
    }
}

pub trait ChunkScheduler: fmt::Debug + Send + Sync {
    /// Arrange downloads so that every chunk covering
    /// `[offset, offset + length)` is either already valid or represented
    /// in the in-flight map, then return the futures of the chunks that
    /// are not yet valid. A bounded policy may leave some chunks
    /// unscheduled; callers loop until the range is fully valid.
    fn schedule(&self, ctx: &ScheduleContext<'_>, offset: u64, length: u64) -> Vec<ChunkFuture>;
}

/// One leaf task per missing chunk. Minimal read amplification.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultScheduler;

impl ChunkScheduler for DefaultScheduler {
    fn schedule(&self, ctx: &ScheduleContext<'_>, offset: u64, length: u64) -> Vec<ChunkFuture> {
        match ctx.shape.chunks_covering(offset, length) {
            Some(chunks) => schedule_individual(ctx, chunks, None),
            None => Vec::new(),
        }
    }
}

/// Coalesce runs of missing chunks into single larger fetches, bounded by
/// `max_run_bytes` of buffered body per task.
#[derive(Clone, Copy, Debug)]
pub struct AggressiveScheduler {
    pub max_run_bytes: u64,
}

impl Default for AggressiveScheduler {
    fn default() -> Self {
        Self {
            max_run_bytes: 64 << 20,
        }
    }
}

impl ChunkScheduler for AggressiveScheduler {
    fn schedule(&self, ctx: &ScheduleContext<'_>, offset: u64, length: u64) -> Vec<ChunkFuture> {
        match ctx.shape.chunks_covering(offset, length) {
            Some(chunks) => schedule_coalesced(ctx, chunks, self.max_run_bytes),
            None => Vec::new(),
        }
    }
}

/// Like [`DefaultScheduler`] but creates at most `max_new_tasks` new
/// downloads per call, for clients that must bound memory and bandwidth.
/// Remaining chunks are picked up by follow-up scheduling calls.
#[derive(Clone, Copy, Debug)]
pub struct ConservativeScheduler {
    pub max_new_tasks: usize,
}

impl Default for ConservativeScheduler {
    fn default() -> Self {
        Self { max_new_tasks: 4 }
    }
}

impl ChunkScheduler for ConservativeScheduler {
    fn schedule(&self, ctx: &ScheduleContext<'_>, offset: u64, length: u64) -> Vec<ChunkFuture> {
        match ctx.shape.chunks_covering(offset, length) {
            Some(chunks) => schedule_individual(ctx, chunks, Some(self.max_new_tasks.max(1))),
            None => Vec::new(),
        }
    }
}

/// Starts out like [`DefaultScheduler`] and switches to coalesced fetches
/// once the observed rate clears `aggressive_above` bytes/sec.
#[derive(Clone, Copy, Debug)]
pub struct AdaptiveScheduler {
    pub aggressive_above: f64,
    pub max_run_bytes: u64,
}

impl Default for AdaptiveScheduler {
    fn default() -> Self {
        Self {
            aggressive_above: (64 << 20) as f64,
            max_run_bytes: 64 << 20,
        }
    }
}

impl ChunkScheduler for AdaptiveScheduler {
    fn schedule(&self, ctx: &ScheduleContext<'_>, offset: u64, length: u64) -> Vec<ChunkFuture> {
        let Some(chunks) = ctx.shape.chunks_covering(offset, length) else {
            return Vec::new();
        };

        let fast = ctx
            .rate_bytes_per_sec
            .is_some_and(|rate| rate > self.aggressive_above);

        if fast {
            schedule_coalesced(ctx, chunks, self.max_run_bytes)
        } else {
            schedule_individual(ctx, chunks, None)
        }
    }
}

fn schedule_individual(
    ctx: &ScheduleContext<'_>,
    chunks: RangeInclusive<u64>,
    max_new: Option<usize>,
) -> Vec<ChunkFuture> {
    let mut futures = Vec::new();
    let mut created = 0_usize;

    for chunk in chunks {
        if ctx.state.is_valid(chunk) {
            continue;
        }

        if let Some(cap) = max_new {
            if created >= cap {
                // Over budget: join fetches others started, defer the rest.
                if let Some(existing) = ctx.inflight.get(chunk) {
                    futures.push(existing);
                }
                continue;
            }
        }

        match ctx.inflight.claim(chunk) {
            ChunkClaim::InFlight(future) => futures.push(future),
            ChunkClaim::Claimed { future, commit } => {
                futures.push(future);
                created += 1;
                enqueue(
                    ctx,
                    FetchTask {
                        first_chunk: chunk,
                        last_chunk: chunk,
                        commits: vec![commit],
                    },
                );
            }
        }
    }

    futures
}

fn schedule_coalesced(
    ctx: &ScheduleContext<'_>,
    chunks: RangeInclusive<u64>,
    max_run_bytes: u64,
) -> Vec<ChunkFuture> {
    let max_run_chunks = (max_run_bytes / ctx.shape.chunk_size()).max(1);

    let mut futures = Vec::new();
    let mut run: Vec<ChunkCommit> = Vec::new();

    for chunk in chunks {
        if ctx.state.is_valid(chunk) {
            flush_run(ctx, &mut run);
            continue;
        }

        match ctx.inflight.claim(chunk) {
            ChunkClaim::InFlight(future) => {
                // Someone else owns this chunk; it splits the run.
                futures.push(future);
                flush_run(ctx, &mut run);
            }
            ChunkClaim::Claimed { future, commit } => {
                futures.push(future);
                if run.len() as u64 >= max_run_chunks {
                    flush_run(ctx, &mut run);
                }
                run.push(commit);
            }
        }
    }

    flush_run(ctx, &mut run);
    futures
}

fn flush_run(ctx: &ScheduleContext<'_>, run: &mut Vec<ChunkCommit>) {
    if run.is_empty() {
        return;
    }

    let commits = mem::take(run);
    let first_chunk = commits[0].chunk();
    let last_chunk = commits[commits.len() - 1].chunk();

    trace!(first_chunk, last_chunk, "coalesced run");
    enqueue(
        ctx,
        FetchTask {
            first_chunk,
            last_chunk,
            commits,
        },
    );
}

fn enqueue(ctx: &ScheduleContext<'_>, task: FetchTask) {
    // A send failure means the channel is closing; dropping the task's
    // commit handles resolves its futures as abandoned.
    if let Err(err) = ctx.queue.send(task) {
        trace!("task queue closed, dropping {} commit(s)", err.0.commits.len());
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;
    use vecdata_merkle::{build_reference, MerkleRef, MerkleState};

    use super::*;
    use crate::inflight::ChunkClaim;

    const CHUNK: u64 = 1024;

    struct Fixture {
        _dir: TempDir,
        shape: MerkleShape,
        state: MerkleState,
        inflight: InFlightMap,
    }

    impl Fixture {
        fn new(chunks: u64) -> Self {
            let dir = TempDir::new().unwrap();
            let source = dir.path().join("data.bin");
            fs::write(&source, vec![7_u8; (chunks * CHUNK) as usize]).unwrap();

            let mref = dir.path().join("data.bin.mref");
            let _ = build_reference(&source, &mref, Some(CHUNK), |_, _| {}).unwrap();
            let reference = MerkleRef::load(&mref).unwrap();
            let state = MerkleState::create(dir.path().join("data.bin.mrkl"), &reference).unwrap();

            Self {
                shape: *reference.shape(),
                state,
                inflight: InFlightMap::new(),
                _dir: dir,
            }
        }

        fn schedule_with(
            &self,
            policy: &dyn ChunkScheduler,
            offset: u64,
            length: u64,
            rate: Option<f64>,
        ) -> (Vec<ChunkFuture>, Vec<(u64, u64)>) {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let ctx = ScheduleContext {
                shape: &self.shape,
                state: &self.state,
                inflight: &self.inflight,
                queue: &tx,
                rate_bytes_per_sec: rate,
            };

            let futures = policy.schedule(&ctx, offset, length);

            let mut spans = Vec::new();
            while let Ok(task) = rx.try_recv() {
                assert_eq!(
                    task.commits.len() as u64,
                    task.last_chunk - task.first_chunk + 1
                );
                spans.push((task.first_chunk, task.last_chunk));
            }

            (futures, spans)
        }
    }

    #[test]
    fn default_emits_one_leaf_task_per_missing_chunk() {
        let fixture = Fixture::new(8);
        fixture.state.mark_valid(2).unwrap();
        fixture.state.mark_valid(3).unwrap();

        let (futures, spans) =
            fixture.schedule_with(&DefaultScheduler, 0, 8 * CHUNK, None);

        assert_eq!(futures.len(), 6);
        assert_eq!(
            spans,
            vec![(0, 0), (1, 1), (4, 4), (5, 5), (6, 6), (7, 7)]
        );
        assert_eq!(fixture.inflight.len(), 6);
    }

    #[test]
    fn aggressive_coalesces_runs_split_by_valid_and_inflight_chunks() {
        let fixture = Fixture::new(8);
        fixture.state.mark_valid(3).unwrap();

        // Chunk 5 is already owned by another caller.
        let ChunkClaim::Claimed { .. } = fixture.inflight.claim(5) else {
            panic!("expected a fresh claim");
        };

        let (futures, spans) = fixture.schedule_with(
            &AggressiveScheduler::default(),
            0,
            8 * CHUNK,
            None,
        );

        // Seven futures: six new claims plus the shared one for chunk 5.
        assert_eq!(futures.len(), 7);
        assert_eq!(spans, vec![(0, 2), (4, 4), (6, 7)]);
    }

    #[test]
    fn aggressive_bounds_run_length_by_bytes() {
        let fixture = Fixture::new(8);

        let policy = AggressiveScheduler {
            max_run_bytes: 2 * CHUNK,
        };
        let (_, spans) = fixture.schedule_with(&policy, 0, 8 * CHUNK, None);

        assert_eq!(spans, vec![(0, 1), (2, 3), (4, 5), (6, 7)]);
    }

    #[test]
    fn conservative_caps_new_tasks_per_call() {
        let fixture = Fixture::new(8);

        let policy = ConservativeScheduler { max_new_tasks: 3 };
        let (futures, spans) = fixture.schedule_with(&policy, 0, 8 * CHUNK, None);

        assert_eq!(futures.len(), 3);
        assert_eq!(spans, vec![(0, 0), (1, 1), (2, 2)]);

        // A follow-up call picks up where the first left off.
        let (more, next_spans) = fixture.schedule_with(&policy, 0, 8 * CHUNK, None);
        assert_eq!(more.len(), 6);
        assert_eq!(next_spans, vec![(3, 3), (4, 4), (5, 5)]);
    }

    #[test]
    fn adaptive_switches_on_observed_rate() {
        let slow = Fixture::new(4);
        let (_, spans) = slow.schedule_with(
            &AdaptiveScheduler::default(),
            0,
            4 * CHUNK,
            Some(1.0),
        );
        assert_eq!(spans.len(), 4);

        let fast = Fixture::new(4);
        let threshold = AdaptiveScheduler::default().aggressive_above;
        let (_, spans) = fast.schedule_with(
            &AdaptiveScheduler::default(),
            0,
            4 * CHUNK,
            Some(threshold * 2.0),
        );
        assert_eq!(spans, vec![(0, 3)]);
    }

    #[test]
    fn valid_ranges_schedule_nothing() {
        let fixture = Fixture::new(4);
        for chunk in 0..4 {
            fixture.state.mark_valid(chunk).unwrap();
        }

        let (futures, spans) =
            fixture.schedule_with(&DefaultScheduler, 0, 4 * CHUNK, None);

        assert!(futures.is_empty());
        assert!(spans.is_empty());
        assert!(fixture.inflight.is_empty());
    }
}
