//! The sparse local cache file backing a channel.
//!
//! A plain file pre-sized to the source's length; no headers. Bytes are
//! only meaningful where the paired state records a verified chunk.
//! Workers write disjoint chunk regions through their own handles, so no
//! application-level locking is needed on the data path.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use vecdata_merkle::{MerkleError, MerkleResult};

#[derive(Debug)]
pub struct CacheFile {
    path: PathBuf,
    len: u64,
}

impl CacheFile {
    /// Open the cache at `path`, creating it as a sparse file of exactly
    /// `len` bytes. An existing cache of any other size belongs to a
    /// different source and is rejected.
    pub async fn open_or_create(path: impl AsRef<Path>, len: u64) -> MerkleResult<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await?;

        let existing = file.metadata().await?.len();
        if existing == 0 {
            file.set_len(len).await?;
        } else if existing != len {
            return Err(MerkleError::state_mismatch(format!(
                "cache file {} is {existing} bytes, reference describes {len}",
                path.display()
            )));
        }

        Ok(Self { path, len })
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A dedicated write handle for one worker.
    pub async fn writer(&self) -> std::io::Result<CacheWriter> {
        let file = OpenOptions::new().write(true).open(&self.path).await?;

        Ok(CacheWriter { file })
    }

    /// Read `buf.len()` bytes starting at `offset`. Callers must only ask
    /// for regions whose chunks are verified.
    pub async fn read_range(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let mut file = File::open(&self.path).await?;
        let _ = file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(buf).await?;

        Ok(())
    }
}

/// Position-writing handle owned by a single worker.
#[derive(Debug)]
pub struct CacheWriter {
    file: File,
}

impl CacheWriter {
    /// Write one verified chunk and flush it to stable storage. The sync
    /// must complete before the chunk's state bit is persisted; that
    /// ordering is what makes a set bit imply durable cache bytes.
    pub async fn write_chunk(&mut self, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
        let _ = self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(bytes).await?;
        self.file.sync_data().await?;

        Ok(())
    }
}
