//! On-disk trailer shared by the `.mref` and `.mrkl` sidecar formats.
//!
//! Both files end in a fixed 64-byte little-endian footer describing the
//! tree shape, so a sidecar is self-describing without reading its body.
//! The final two fields are the footer's own length and a CRC32 over the
//! preceding footer bytes.

use std::io::{Read, Seek, SeekFrom};

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::errors::{MerkleError, MerkleResult};
use crate::shape::MerkleShape;

pub const REF_MAGIC: u64 = u64::from_le_bytes(*b"MREFv001");
pub const STATE_MAGIC: u64 = u64::from_le_bytes(*b"MRKLv001");

pub const FORMAT_VERSION: u32 = 1;
pub const HASH_ALG_SHA256: u32 = 1;

pub const HASH_LEN: usize = 32;
pub const FOOTER_LEN: usize = 64;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Footer {
    pub magic: u64,
    pub version: u32,
    pub hash_alg: u32,
    pub file_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u64,
    pub leaf_count: u64,
    pub node_count: u64,
}

impl Footer {
    #[must_use]
    pub const fn for_shape(magic: u64, shape: &MerkleShape) -> Self {
        Self {
            magic,
            version: FORMAT_VERSION,
            hash_alg: HASH_ALG_SHA256,
            file_size: shape.file_size(),
            chunk_size: shape.chunk_size(),
            chunk_count: shape.chunk_count(),
            leaf_count: shape.leaf_count(),
            node_count: shape.node_count(),
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; FOOTER_LEN] {
        let mut buf = [0_u8; FOOTER_LEN];

        buf[0..8].copy_from_slice(&self.magic.to_le_bytes());
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.hash_alg.to_le_bytes());
        buf[16..24].copy_from_slice(&self.file_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.chunk_size.to_le_bytes());
        buf[32..40].copy_from_slice(&self.chunk_count.to_le_bytes());
        buf[40..48].copy_from_slice(&self.leaf_count.to_le_bytes());
        buf[48..56].copy_from_slice(&self.node_count.to_le_bytes());
        buf[56..60].copy_from_slice(&(FOOTER_LEN as u32).to_le_bytes());

        let crc = CRC32.checksum(&buf[..60]);
        buf[60..64].copy_from_slice(&crc.to_le_bytes());

        buf
    }

    pub fn decode(buf: &[u8; FOOTER_LEN], expected_magic: u64) -> MerkleResult<Self> {
        let stored_crc = u32::from_le_bytes(buf[60..64].try_into().unwrap_or([0; 4]));
        let computed_crc = CRC32.checksum(&buf[..60]);
        if stored_crc != computed_crc {
            return Err(MerkleError::invalid_reference(format!(
                "footer CRC mismatch (stored {stored_crc:#010x}, computed {computed_crc:#010x})"
            )));
        }

        let magic = read_u64(buf, 0);
        if magic != expected_magic {
            return Err(MerkleError::invalid_reference(format!(
                "unrecognized magic {:?}",
                String::from_utf8_lossy(&magic.to_le_bytes())
            )));
        }

        let version = read_u32(buf, 8);
        if version != FORMAT_VERSION {
            return Err(MerkleError::invalid_reference(format!(
                "unsupported version {version}"
            )));
        }

        let hash_alg = read_u32(buf, 12);
        if hash_alg != HASH_ALG_SHA256 {
            return Err(MerkleError::invalid_reference(format!(
                "unsupported hash algorithm {hash_alg}"
            )));
        }

        let footer_size = read_u32(buf, 56);
        if footer_size as usize != FOOTER_LEN {
            return Err(MerkleError::invalid_reference(format!(
                "unexpected footer size {footer_size}"
            )));
        }

        Ok(Self {
            magic,
            version,
            hash_alg,
            file_size: read_u64(buf, 16),
            chunk_size: read_u64(buf, 24),
            chunk_count: read_u64(buf, 32),
            leaf_count: read_u64(buf, 40),
            node_count: read_u64(buf, 48),
        })
    }

    /// Reconstruct and cross-check the shape the footer claims. The stored
    /// counts must match the counts derived from size and chunk size.
    pub fn shape(&self) -> MerkleResult<MerkleShape> {
        let shape = MerkleShape::new(self.file_size, self.chunk_size).map_err(|err| {
            MerkleError::invalid_reference(format!("footer shape invalid: {err}"))
        })?;

        if shape.chunk_count() != self.chunk_count
            || shape.leaf_count() != self.leaf_count
            || shape.node_count() != self.node_count
        {
            return Err(MerkleError::invalid_reference(format!(
                "footer counts ({}, {}, {}) disagree with derived shape ({}, {}, {})",
                self.chunk_count,
                self.leaf_count,
                self.node_count,
                shape.chunk_count(),
                shape.leaf_count(),
                shape.node_count(),
            )));
        }

        Ok(shape)
    }

    /// Read and validate the trailing footer of an open sidecar file.
    pub fn read_from(file: &mut std::fs::File, expected_magic: u64) -> MerkleResult<Self> {
        let len = file.seek(SeekFrom::End(0))?;
        if len < FOOTER_LEN as u64 {
            return Err(MerkleError::invalid_reference(format!(
                "file too short for footer ({len} bytes)"
            )));
        }

        let _ = file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
        let mut buf = [0_u8; FOOTER_LEN];
        file.read_exact(&mut buf)?;

        Self::decode(&buf, expected_magic)
    }
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap_or([0; 8]))
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap_or([0; 4]))
}
