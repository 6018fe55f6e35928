//! Deduplicating map of outstanding chunk fetches.
//!
//! One entry per chunk currently being materialized. Claiming a chunk is
//! atomic: the first caller gets a commit handle (and must arrange a
//! download task); every later caller gets a clone of the same shared
//! future. This is what guarantees at-most-one concurrent fetch per chunk
//! no matter how many readers overlap.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;

use crate::errors::{ChunkError, ChunkResult};

/// Clonable handle on a chunk's eventual outcome. Resolves `Ok(())` once
/// the chunk is verified and present in the cache.
pub type ChunkFuture = Shared<BoxFuture<'static, ChunkResult>>;

/// Write side of one chunk's future, held by the download task that will
/// materialize it. Dropping it unfulfilled resolves the future as
/// [`ChunkError::Abandoned`].
#[derive(Debug)]
pub struct ChunkCommit {
    chunk: u64,
    tx: oneshot::Sender<ChunkResult>,
}

impl ChunkCommit {
    #[must_use]
    pub const fn chunk(&self) -> u64 {
        self.chunk
    }

    pub fn complete(self, result: ChunkResult) {
        let _ = self.tx.send(result);
    }
}

/// Outcome of [`InFlightMap::claim`].
#[derive(Debug)]
pub enum ChunkClaim {
    /// Another caller is already fetching this chunk.
    InFlight(ChunkFuture),
    /// The caller now owns the fetch and must enqueue a task carrying the
    /// commit handle.
    Claimed {
        future: ChunkFuture,
        commit: ChunkCommit,
    },
}

#[derive(Debug, Default)]
pub struct InFlightMap {
    map: DashMap<u64, ChunkFuture>,
}

impl InFlightMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, chunk: u64) -> ChunkClaim {
        match self.map.entry(chunk) {
            Entry::Occupied(entry) => ChunkClaim::InFlight(entry.get().clone()),
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                let future: ChunkFuture = async move {
                    rx.await
                        .unwrap_or_else(|_| Err(ChunkError::Abandoned { chunk }))
                }
                .boxed()
                .shared();

                let _ = entry.insert(future.clone());

                ChunkClaim::Claimed {
                    future,
                    commit: ChunkCommit { chunk, tx },
                }
            }
        }
    }

    #[must_use]
    pub fn get(&self, chunk: u64) -> Option<ChunkFuture> {
        self.map.get(&chunk).map(|entry| entry.value().clone())
    }

    /// Drop a settled entry. Clones of the shared future stay resolvable.
    pub fn remove(&self, chunk: u64) {
        let _ = self.map.remove(&chunk);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
