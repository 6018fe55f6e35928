//! Merkle sidecar support for chunked, content-verified data files.
//!
//! A data file is partitioned into fixed-size chunks which form the leaves
//! of a complete binary hash tree. Two sidecar files accompany the data:
//!
//! - a reference (`.mref`): the immutable, hash-complete tree produced from
//!   a fully available copy of the file, used as the trusted comparand, and
//! - a state (`.mrkl`): a mutable local record of which chunks have been
//!   fetched, hashed, and found to match the reference.
//!
//! This crate owns the tree geometry, both sidecar formats, reference
//! construction, and whole-file verification. The fetch/cache machinery
//! that consumes these types lives in `vecdata-channel`.

pub use crate::builder::{
    build_reference, chunk_digest, default_chunk_size, parent_digest, verify_file, VerifyReport,
    MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
pub use crate::errors::{MerkleError, MerkleResult};
pub use crate::format::{
    Footer, FOOTER_LEN, FORMAT_VERSION, HASH_ALG_SHA256, HASH_LEN, REF_MAGIC, STATE_MAGIC,
};
pub use crate::reference::{MerkleRef, ZERO_HASH};
pub use crate::shape::MerkleShape;
pub use crate::state::MerkleState;

mod builder;
mod errors;
mod format;
mod reference;
mod shape;
mod state;
