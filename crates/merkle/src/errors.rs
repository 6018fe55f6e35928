use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MerkleError {
    #[error("invalid reference: {reason}")]
    InvalidReference { reason: String },

    #[error("state does not match reference: {reason}")]
    StateMismatch { reason: String },

    #[error("invalid shape: {reason}")]
    InvalidShape { reason: String },

    #[error("chunk index {chunk} out of range for {count} chunks")]
    ChunkOutOfRange { chunk: u64, count: u64 },

    #[error("node index {node} out of range for {count} nodes")]
    NodeOutOfRange { node: u64, count: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MerkleError {
    pub fn invalid_reference(reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            reason: reason.into(),
        }
    }

    pub fn state_mismatch(reason: impl Into<String>) -> Self {
        Self::StateMismatch {
            reason: reason.into(),
        }
    }

    pub fn invalid_shape(reason: impl Into<String>) -> Self {
        Self::InvalidShape {
            reason: reason.into(),
        }
    }
}

pub type MerkleResult<T> = Result<T, MerkleError>;
