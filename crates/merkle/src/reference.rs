//! The immutable `.mref` sidecar: a hash-complete tree used as the trusted
//! comparand during verification.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;

use crate::errors::{MerkleError, MerkleResult};
use crate::format::{Footer, FOOTER_LEN, HASH_LEN, REF_MAGIC};
use crate::shape::MerkleShape;

/// All-zero hash assigned to phantom leaves past the last real chunk.
pub const ZERO_HASH: [u8; HASH_LEN] = [0_u8; HASH_LEN];

/// A loaded reference. The hash block stays memory-mapped; lookups are
/// copy-out reads of 32 bytes.
#[derive(Debug)]
pub struct MerkleRef {
    shape: MerkleShape,
    map: Mmap,
}

impl MerkleRef {
    /// Open and validate a `.mref` file. Fails with `InvalidReference` on
    /// bad magic, bad CRC, or a body that does not hold exactly
    /// `node_count * 32` bytes of hashes.
    pub fn load(path: impl AsRef<Path>) -> MerkleResult<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;

        let footer = Footer::read_from(&mut file, REF_MAGIC)?;
        let shape = footer.shape()?;

        let expected_len = shape.node_count() * HASH_LEN as u64 + FOOTER_LEN as u64;
        let actual_len = file.metadata()?.len();
        if actual_len != expected_len {
            return Err(MerkleError::invalid_reference(format!(
                "body length mismatch: file is {actual_len} bytes, shape requires {expected_len}"
            )));
        }

        let map = unsafe { Mmap::map(&file)? };

        Ok(Self { shape, map })
    }

    #[must_use]
    pub const fn shape(&self) -> &MerkleShape {
        &self.shape
    }

    /// Hash of tree node `node` in heap order.
    pub fn hash(&self, node: u64) -> MerkleResult<[u8; HASH_LEN]> {
        if node >= self.shape.node_count() {
            return Err(MerkleError::NodeOutOfRange {
                node,
                count: self.shape.node_count(),
            });
        }

        let at = node as usize * HASH_LEN;
        let mut out = [0_u8; HASH_LEN];
        out.copy_from_slice(&self.map[at..at + HASH_LEN]);

        Ok(out)
    }

    /// Hash of the leaf backing chunk `chunk`.
    pub fn chunk_hash(&self, chunk: u64) -> MerkleResult<[u8; HASH_LEN]> {
        self.hash(self.shape.leaf_node_index(chunk)?)
    }

    pub fn root_hash(&self) -> MerkleResult<[u8; HASH_LEN]> {
        self.hash(0)
    }

    /// Raw hash block, `node_count * 32` bytes in heap order. Used when
    /// seeding a new state file.
    #[must_use]
    pub fn hash_block(&self) -> &[u8] {
        &self.map[..self.shape.node_count() as usize * HASH_LEN]
    }

    /// Write a complete reference file: the hash block in heap order
    /// followed by the footer.
    pub fn write(
        path: impl AsRef<Path>,
        shape: &MerkleShape,
        nodes: &[[u8; HASH_LEN]],
    ) -> MerkleResult<()> {
        if nodes.len() as u64 != shape.node_count() {
            return Err(MerkleError::invalid_shape(format!(
                "expected {} node hashes, got {}",
                shape.node_count(),
                nodes.len()
            )));
        }

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        for hash in nodes {
            writer.write_all(hash)?;
        }
        writer.write_all(&Footer::for_shape(REF_MAGIC, shape).encode())?;

        writer.into_inner().map_err(|err| err.into_error())?.sync_all()?;

        Ok(())
    }
}
