//! Reference construction and whole-file verification.
//!
//! Both walk a fully available local file chunk by chunk: the builder
//! hashes every leaf and folds parents bottom-up into a new `.mref`; the
//! verifier reuses the leaf-hash pass and compares against an existing
//! reference instead.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::Mmap;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::errors::{MerkleError, MerkleResult};
use crate::format::HASH_LEN;
use crate::reference::{MerkleRef, ZERO_HASH};
use crate::shape::MerkleShape;

pub const MIN_CHUNK_SIZE: u64 = 1 << 20;
pub const MAX_CHUNK_SIZE: u64 = 64 << 20;

/// Chunk-size heuristic: double from 1 MiB while the file would split into
/// more than this many chunks, capping at 64 MiB.
const TARGET_MAX_CHUNKS: u64 = 8192;

#[must_use]
pub fn default_chunk_size(file_size: u64) -> u64 {
    let mut size = MIN_CHUNK_SIZE;

    while size < MAX_CHUNK_SIZE && file_size.div_ceil(size) > TARGET_MAX_CHUNKS {
        size *= 2;
    }

    size
}

/// Outcome of verifying a local file against a reference.
#[derive(Clone, Debug)]
pub struct VerifyReport {
    pub chunk_count: u64,
    /// Sorted indices of chunks whose hash differs from the reference.
    pub mismatched: Vec<u64>,
}

impl VerifyReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.mismatched.is_empty()
    }
}

/// Build a `.mref` for `source` and write it to `output`. Leaf chunks are
/// hashed in parallel; `progress` receives `(chunks_hashed, chunk_count)`
/// as leaves complete, in no particular chunk order.
pub fn build_reference(
    source: impl AsRef<Path>,
    output: impl AsRef<Path>,
    chunk_size: Option<u64>,
    progress: impl Fn(u64, u64) + Sync,
) -> MerkleResult<MerkleShape> {
    let source = source.as_ref();
    let file = File::open(source)?;
    let file_size = file.metadata()?.len();

    let chunk_size = chunk_size.unwrap_or_else(|| default_chunk_size(file_size));
    let shape = MerkleShape::new(file_size, chunk_size)?;

    let leaves = hash_leaves(&file, &shape, &progress)?;
    let nodes = fold_tree(&shape, leaves);

    MerkleRef::write(output, &shape, &nodes)?;

    info!(
        source = %source.display(),
        file_size,
        chunk_size,
        chunks = shape.chunk_count(),
        "built merkle reference"
    );

    Ok(shape)
}

/// Hash every chunk of `source` and compare against `reference`. The file
/// must have the exact size the reference was built for.
pub fn verify_file(
    source: impl AsRef<Path>,
    reference: &MerkleRef,
    progress: impl Fn(u64, u64) + Sync,
) -> MerkleResult<VerifyReport> {
    let file = File::open(source)?;
    let file_size = file.metadata()?.len();
    let shape = *reference.shape();

    if file_size != shape.file_size() {
        return Err(MerkleError::state_mismatch(format!(
            "file is {file_size} bytes but reference describes {} bytes",
            shape.file_size()
        )));
    }

    let leaves = hash_leaves(&file, &shape, &progress)?;

    let mut mismatched = Vec::new();
    for (chunk, leaf) in leaves.iter().enumerate() {
        if *leaf != reference.chunk_hash(chunk as u64)? {
            mismatched.push(chunk as u64);
        }
    }

    Ok(VerifyReport {
        chunk_count: shape.chunk_count(),
        mismatched,
    })
}

/// Parallel leaf-hash pass over a mapped file. Returns one hash per real
/// chunk, in chunk order.
fn hash_leaves(
    file: &File,
    shape: &MerkleShape,
    progress: &(impl Fn(u64, u64) + Sync),
) -> MerkleResult<Vec<[u8; HASH_LEN]>> {
    if shape.chunk_count() == 0 {
        return Ok(Vec::new());
    }

    let map = unsafe { Mmap::map(file)? };
    let total = shape.chunk_count();
    let done = AtomicU64::new(0);

    let leaves = map
        .par_chunks(shape.chunk_size() as usize)
        .map(|slice| {
            let hash = chunk_digest(slice);
            progress(done.fetch_add(1, Ordering::Relaxed) + 1, total);
            hash
        })
        .collect();

    Ok(leaves)
}

/// Lay real leaves and phantom zero-hashes into the heap array, then fold
/// internal nodes bottom-up: `hash(node) = SHA-256(left || right)`.
fn fold_tree(shape: &MerkleShape, leaves: Vec<[u8; HASH_LEN]>) -> Vec<[u8; HASH_LEN]> {
    let mut nodes = vec![ZERO_HASH; shape.node_count() as usize];

    let first_leaf = shape.internal_count() as usize;
    for (chunk, leaf) in leaves.into_iter().enumerate() {
        nodes[first_leaf + chunk] = leaf;
    }

    for node in (0..shape.internal_count()).rev() {
        let left = nodes[(2 * node + 1) as usize];
        let right = nodes[(2 * node + 2) as usize];
        nodes[node as usize] = parent_digest(&left, &right);
    }

    nodes
}

#[must_use]
pub fn chunk_digest(bytes: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

#[must_use]
pub fn parent_digest(left: &[u8; HASH_LEN], right: &[u8; HASH_LEN]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_heuristic_is_logarithmic_and_bounded() {
        assert_eq!(default_chunk_size(0), MIN_CHUNK_SIZE);
        assert_eq!(default_chunk_size(1 << 30), MIN_CHUNK_SIZE);
        // 8 GiB needs no growth at 8192 chunks of 1 MiB.
        assert_eq!(default_chunk_size(8 << 30), MIN_CHUNK_SIZE);
        assert_eq!(default_chunk_size((8 << 30) + 1), 2 << 20);
        // 256 GiB wants 32 MiB chunks; 1 TiB hits the 64 MiB cap.
        assert_eq!(default_chunk_size(256 << 30), 32 << 20);
        assert_eq!(default_chunk_size(1 << 40), MAX_CHUNK_SIZE);
        assert_eq!(default_chunk_size(u64::MAX), MAX_CHUNK_SIZE);
        assert!(default_chunk_size(123 << 30).is_power_of_two());
    }
}
