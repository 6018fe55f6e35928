use std::sync::Arc;

use thiserror::Error;
use vecdata_merkle::MerkleError;

/// Failure of a single chunk's fetch-verify-commit cycle. Cloneable so one
/// outcome can fan out to every reader sharing the chunk's future.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ChunkError {
    #[error("fetch for chunk {chunk} failed after {attempts} attempt(s): {reason}")]
    TransportFailure {
        chunk: u64,
        attempts: u32,
        reason: String,
    },

    #[error(
        "hash mismatch for chunk {chunk} from {locator}: expected {expected}, computed {actual}"
    )]
    HashMismatch {
        chunk: u64,
        expected: String,
        actual: String,
        locator: String,
    },

    #[error("cache write for chunk {chunk} failed: {error}")]
    LocalIo {
        chunk: u64,
        error: Arc<std::io::Error>,
    },

    #[error("fetch for chunk {chunk} was abandoned before completion")]
    Abandoned { chunk: u64 },
}

impl ChunkError {
    #[must_use]
    pub const fn chunk(&self) -> u64 {
        match self {
            Self::TransportFailure { chunk, .. }
            | Self::HashMismatch { chunk, .. }
            | Self::LocalIo { chunk, .. }
            | Self::Abandoned { chunk } => *chunk,
        }
    }
}

pub type ChunkResult = Result<(), ChunkError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    #[error(transparent)]
    Merkle(#[from] MerkleError),

    #[error("{} chunk(s) failed: {}", .failures.len(), first_failure(.failures))]
    ChunksFailed { failures: Vec<ChunkError> },

    #[error("channel is closed")]
    Closed,

    #[error("close timed out with {remaining} task(s) still in flight")]
    DrainTimeout { remaining: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Chunk indices implicated in this error, if any.
    #[must_use]
    pub fn failed_chunks(&self) -> Vec<u64> {
        match self {
            Self::ChunksFailed { failures } => failures.iter().map(ChunkError::chunk).collect(),
            _ => Vec::new(),
        }
    }
}

fn first_failure(failures: &[ChunkError]) -> String {
    failures
        .first()
        .map_or_else(String::new, ToString::to_string)
}

pub type ChannelResult<T> = Result<T, ChannelError>;
