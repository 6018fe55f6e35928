//! The mutable `.mrkl` sidecar: tracks which chunks of the paired cache
//! file have been fetched, hashed, and found to match the reference.
//!
//! Layout: the reference's hash block, then a one-bit-per-leaf valid
//! bitset, then the standard footer. The bitset is the only region that
//! changes after creation; it is updated in place one byte at a time,
//! synced after each commit. Losing a bit on crash is safe (the chunk is
//! re-fetched); a bit is never persisted before the executor has synced
//! the chunk's cache bytes.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::errors::{MerkleError, MerkleResult};
use crate::format::{Footer, FOOTER_LEN, HASH_LEN, STATE_MAGIC};
use crate::reference::MerkleRef;
use crate::shape::MerkleShape;

#[derive(Debug)]
pub struct MerkleState {
    shape: MerkleShape,
    hashes: Vec<u8>,
    bits: Vec<AtomicU8>,
    file: Mutex<File>,
}

impl MerkleState {
    /// Create a fresh state file seeded from `reference`: its hash block,
    /// an all-zero bitset, and a `MRKLv001` footer.
    pub fn create(path: impl AsRef<Path>, reference: &MerkleRef) -> MerkleResult<Self> {
        let shape = *reference.shape();
        let hashes = reference.hash_block().to_vec();
        let bitset_len = shape.bitset_len() as usize;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let mut writer = BufWriter::new(file);
        writer.write_all(&hashes)?;
        writer.write_all(&vec![0_u8; bitset_len])?;
        writer.write_all(&Footer::for_shape(STATE_MAGIC, &shape).encode())?;

        let file = writer.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;

        Ok(Self {
            shape,
            hashes,
            bits: (0..bitset_len).map(|_| AtomicU8::new(0)).collect(),
            file: Mutex::new(file),
        })
    }

    /// Open an existing state file. The footer is validated; the hash block
    /// and bitset are read into memory. No reference is required, which is
    /// what lets `merkle summary` inspect a state on its own.
    pub fn load(path: impl AsRef<Path>) -> MerkleResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let footer = Footer::read_from(&mut file, STATE_MAGIC)?;
        let shape = footer.shape()?;

        let body_len = shape.node_count() * HASH_LEN as u64;
        let bitset_len = shape.bitset_len();
        let expected_len = body_len + bitset_len + FOOTER_LEN as u64;
        let actual_len = file.metadata()?.len();
        if actual_len != expected_len {
            return Err(MerkleError::invalid_reference(format!(
                "state length mismatch: file is {actual_len} bytes, shape requires {expected_len}"
            )));
        }

        let _ = file.seek(SeekFrom::Start(0))?;
        let mut hashes = vec![0_u8; body_len as usize];
        file.read_exact(&mut hashes)?;

        let mut bit_bytes = vec![0_u8; bitset_len as usize];
        file.read_exact(&mut bit_bytes)?;

        Ok(Self {
            shape,
            hashes,
            bits: bit_bytes.into_iter().map(AtomicU8::new).collect(),
            file: Mutex::new(file),
        })
    }

    /// Load `path` if it exists (cross-checking it against `reference`),
    /// otherwise create it fresh.
    pub fn open_or_create(path: impl AsRef<Path>, reference: &MerkleRef) -> MerkleResult<Self> {
        let path = path.as_ref();

        if path.is_file() {
            let state = Self::load(path)?;
            state.cross_check(reference)?;
            debug!(path = %path.display(), valid = state.count_valid(), "resumed existing state");
            return Ok(state);
        }

        Self::create(path, reference)
    }

    /// A state may only be paired with the reference it was seeded from:
    /// same shape, same hash table.
    pub fn cross_check(&self, reference: &MerkleRef) -> MerkleResult<()> {
        if self.shape != *reference.shape() {
            return Err(MerkleError::state_mismatch(format!(
                "state shape {:?} differs from reference shape {:?}",
                self.shape,
                reference.shape()
            )));
        }

        if self.hashes != reference.hash_block() {
            return Err(MerkleError::state_mismatch(
                "state hash table differs from reference",
            ));
        }

        Ok(())
    }

    #[must_use]
    pub const fn shape(&self) -> &MerkleShape {
        &self.shape
    }

    #[must_use]
    pub fn is_valid(&self, chunk: u64) -> bool {
        if chunk >= self.shape.chunk_count() {
            return false;
        }

        let byte = self.bits[(chunk / 8) as usize].load(Ordering::Acquire);
        byte & (1 << (chunk % 8)) != 0
    }

    /// Record chunk `chunk` as verified and persist the covering bitset
    /// byte. The in-memory bit is set even when persistence fails, so the
    /// caller can degrade to memory-only operation.
    pub fn mark_valid(&self, chunk: u64) -> MerkleResult<()> {
        self.set_bit(chunk, true)
    }

    /// Drop a chunk's verified status (used when re-validation finds the
    /// cached bytes no longer match).
    pub fn clear_valid(&self, chunk: u64) -> MerkleResult<()> {
        self.set_bit(chunk, false)
    }

    /// Set the in-memory bit without touching the file. Used once a
    /// channel has degraded to memory-only state after a persist failure.
    pub fn mark_valid_volatile(&self, chunk: u64) -> MerkleResult<()> {
        if chunk >= self.shape.chunk_count() {
            return Err(MerkleError::ChunkOutOfRange {
                chunk,
                count: self.shape.chunk_count(),
            });
        }

        let _ = self.bits[(chunk / 8) as usize].fetch_or(1 << (chunk % 8), Ordering::AcqRel);

        Ok(())
    }

    fn set_bit(&self, chunk: u64, value: bool) -> MerkleResult<()> {
        if chunk >= self.shape.chunk_count() {
            return Err(MerkleError::ChunkOutOfRange {
                chunk,
                count: self.shape.chunk_count(),
            });
        }

        let index = (chunk / 8) as usize;
        let mask = 1_u8 << (chunk % 8);

        if value {
            let _ = self.bits[index].fetch_or(mask, Ordering::AcqRel);
        } else {
            let _ = self.bits[index].fetch_and(!mask, Ordering::AcqRel);
        }

        self.persist_byte(index)
    }

    /// Write one bitset byte at its file position and sync. The byte is
    /// re-read under the file lock so concurrent commits to neighboring
    /// chunks in the same byte are never lost.
    fn persist_byte(&self, index: usize) -> MerkleResult<()> {
        let file = self.file.lock();
        let mut handle: &File = &file;

        let byte = self.bits[index].load(Ordering::Acquire);
        let at = self.shape.node_count() * HASH_LEN as u64 + index as u64;

        let _ = handle.seek(SeekFrom::Start(at))?;
        handle.write_all(&[byte])?;
        file.sync_data()?;

        Ok(())
    }

    /// Sorted chunk indices in `first..=last` that are not yet valid.
    /// `last` is clamped to the final real chunk.
    #[must_use]
    pub fn missing_chunks_in_range(&self, first: u64, last: u64) -> Vec<u64> {
        if self.shape.chunk_count() == 0 {
            return Vec::new();
        }

        let last = last.min(self.shape.chunk_count() - 1);

        (first..=last).filter(|&c| !self.is_valid(c)).collect()
    }

    #[must_use]
    pub fn count_valid(&self) -> u64 {
        (0..self.shape.chunk_count())
            .filter(|&c| self.is_valid(c))
            .count() as u64
    }

    #[must_use]
    pub fn fraction_complete(&self) -> f64 {
        if self.shape.chunk_count() == 0 {
            return 1.0;
        }

        self.count_valid() as f64 / self.shape.chunk_count() as f64
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.count_valid() == self.shape.chunk_count()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::thread;

    use tempfile::TempDir;

    use super::*;
    use crate::builder::build_reference;

    const CHUNK: u64 = 1024;

    fn fixture(chunks: u64) -> (TempDir, MerkleRef) {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("data.bin");
        fs::write(&source, vec![3_u8; (chunks * CHUNK) as usize]).unwrap();

        let mref = dir.path().join("data.bin.mref");
        let _ = build_reference(&source, &mref, Some(CHUNK), |_, _| {}).unwrap();
        let reference = MerkleRef::load(&mref).unwrap();

        (dir, reference)
    }

    #[test]
    fn bits_pack_across_byte_boundaries() {
        let (dir, reference) = fixture(20);
        let state = MerkleState::create(dir.path().join("s.mrkl"), &reference).unwrap();

        for chunk in [0, 7, 8, 9, 15, 16, 19] {
            state.mark_valid(chunk).unwrap();
        }

        for chunk in 0..20 {
            let expected = matches!(chunk, 0 | 7 | 8 | 9 | 15 | 16 | 19);
            assert_eq!(state.is_valid(chunk), expected, "chunk {chunk}");
        }
        assert_eq!(state.count_valid(), 7);
        assert_eq!(state.missing_chunks_in_range(6, 10), vec![6, 10]);
    }

    #[test]
    fn out_of_range_chunks_are_rejected() {
        let (dir, reference) = fixture(4);
        let state = MerkleState::create(dir.path().join("s.mrkl"), &reference).unwrap();

        assert!(!state.is_valid(4));
        assert!(matches!(
            state.mark_valid(4),
            Err(MerkleError::ChunkOutOfRange { chunk: 4, count: 4 })
        ));
    }

    #[test]
    fn concurrent_marks_in_the_same_byte_all_persist() {
        let (dir, reference) = fixture(64);
        let path = dir.path().join("s.mrkl");
        let state = Arc::new(MerkleState::create(&path, &reference).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    for chunk in (worker..64).step_by(8) {
                        state.mark_valid(chunk).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(state.count_valid(), 64);
        drop(state);

        let reloaded = MerkleState::load(&path).unwrap();
        assert_eq!(reloaded.count_valid(), 64);
        assert!(reloaded.is_complete());
    }

    #[test]
    fn volatile_marks_do_not_persist() {
        let (dir, reference) = fixture(4);
        let path = dir.path().join("s.mrkl");

        let state = MerkleState::create(&path, &reference).unwrap();
        state.mark_valid(0).unwrap();
        state.mark_valid_volatile(1).unwrap();
        assert!(state.is_valid(1));
        drop(state);

        let reloaded = MerkleState::load(&path).unwrap();
        assert!(reloaded.is_valid(0));
        assert!(!reloaded.is_valid(1));
    }
}
