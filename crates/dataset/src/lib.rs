//! The facet layer of a dataset directory.
//!
//! A dataset is a directory of binary facet files (base vectors, query
//! vectors, neighbor indices, distances and friends) identified by
//! well-known extensions. A facet may ship with a co-located `.mref`
//! sidecar; if it does, it is opened through a verifying channel, and
//! otherwise read directly — a local file is its own trusted source.

use std::collections::HashMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::debug;
use vecdata_channel::{ChannelError, ChannelOptions, MerkleChannel};
use vecdata_transport::FileTransport;

/// What a facet file holds, keyed by its extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FacetKind {
    FloatVectors,
    IntVectors,
    ByteVectors,
    Hdf5,
    Parquet,
}

impl FacetKind {
    #[must_use]
    pub const fn describe(&self) -> &'static str {
        match self {
            Self::FloatVectors => "float vectors",
            Self::IntVectors => "int vectors",
            Self::ByteVectors => "byte vectors",
            Self::Hdf5 => "hdf5 container",
            Self::Parquet => "parquet table",
        }
    }
}

/// Explicit extension registry, populated once at first use. New formats
/// are added here, not discovered.
static FACET_EXTENSIONS: Lazy<HashMap<&'static str, FacetKind>> = Lazy::new(|| {
    let mut map = HashMap::new();
    let _ = map.insert("fvec", FacetKind::FloatVectors);
    let _ = map.insert("fvecs", FacetKind::FloatVectors);
    let _ = map.insert("ivec", FacetKind::IntVectors);
    let _ = map.insert("ivecs", FacetKind::IntVectors);
    let _ = map.insert("bvec", FacetKind::ByteVectors);
    let _ = map.insert("bvecs", FacetKind::ByteVectors);
    let _ = map.insert("hdf5", FacetKind::Hdf5);
    let _ = map.insert("parquet", FacetKind::Parquet);
    map
});

#[must_use]
pub fn facet_kind_for_extension(extension: &str) -> Option<FacetKind> {
    FACET_EXTENSIONS.get(extension).copied()
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DatasetError {
    #[error("{0} is not a dataset directory")]
    NotADirectory(Utf8PathBuf),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type DatasetResult<T> = Result<T, DatasetError>;

/// One facet file of a dataset.
#[derive(Clone, Debug)]
pub struct Facet {
    pub name: String,
    pub path: Utf8PathBuf,
    pub kind: FacetKind,
    /// The co-located `.mref`, when the facet is published with one.
    pub reference_path: Option<Utf8PathBuf>,
}

impl Facet {
    #[must_use]
    pub const fn is_verified(&self) -> bool {
        self.reference_path.is_some()
    }
}

#[derive(Debug)]
pub struct Dataset {
    dir: Utf8PathBuf,
}

impl Dataset {
    pub fn open(dir: impl Into<Utf8PathBuf>) -> DatasetResult<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(DatasetError::NotADirectory(dir));
        }

        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Enumerate facet files, sorted by name. Files with unregistered
    /// extensions (including the sidecars themselves) are skipped.
    pub fn facets(&self) -> DatasetResult<Vec<Facet>> {
        let mut facets = Vec::new();

        for entry in self.dir.read_dir_utf8().map_err(DatasetError::Io)? {
            let entry = entry.map_err(DatasetError::Io)?;
            let path = entry.path();

            let Some(kind) = path.extension().and_then(facet_kind_for_extension) else {
                continue;
            };

            let reference_path = {
                let candidate = Utf8PathBuf::from(format!("{path}.mref"));
                candidate.is_file().then_some(candidate)
            };

            facets.push(Facet {
                name: entry.file_name().to_owned(),
                path: path.to_owned(),
                kind,
                reference_path,
            });
        }

        facets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(facets)
    }

    /// Open a facet for reading. With a reference present the facet goes
    /// through the verifying channel (cache and state land in
    /// `cache_dir`); without one it is read directly.
    pub async fn open_facet(
        &self,
        facet: &Facet,
        cache_dir: &Utf8Path,
    ) -> DatasetResult<FacetReader> {
        match &facet.reference_path {
            Some(reference_path) => {
                tokio::fs::create_dir_all(cache_dir).await?;
                let cache_path = cache_dir.join(&facet.name);

                debug!(facet = %facet.name, "opening facet through verifying channel");
                let transport = Arc::new(FileTransport::new(facet.path.as_std_path()));
                let options = ChannelOptions::new(
                    reference_path.as_std_path(),
                    cache_path.as_std_path(),
                );

                let channel = MerkleChannel::open(transport, options).await?;
                Ok(FacetReader::Verified(channel))
            }
            None => {
                debug!(facet = %facet.name, "opening facet directly");
                let file = tokio::fs::File::open(&facet.path).await?;
                let len = file.metadata().await?.len();

                Ok(FacetReader::Direct {
                    file: tokio::sync::Mutex::new(file),
                    len,
                })
            }
        }
    }
}

/// A positioned reader over one facet, verified or direct.
#[derive(Debug)]
pub enum FacetReader {
    Verified(MerkleChannel),
    Direct {
        file: tokio::sync::Mutex<tokio::fs::File>,
        len: u64,
    },
}

impl FacetReader {
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::Verified(channel) => channel.size(),
            Self::Direct { len, .. } => *len,
        }
    }

    /// Read up to `buf.len()` bytes at `position`; short only at end of
    /// file.
    pub async fn read_at(&self, buf: &mut [u8], position: u64) -> DatasetResult<usize> {
        match self {
            Self::Verified(channel) => Ok(channel.read_at(buf, position).await?),
            Self::Direct { file, len } => {
                if position >= *len || buf.is_empty() {
                    return Ok(0);
                }

                let window = (buf.len() as u64).min(len - position) as usize;
                let mut file = file.lock().await;
                let _ = file.seek(SeekFrom::Start(position)).await?;
                file.read_exact(&mut buf[..window]).await?;

                Ok(window)
            }
        }
    }

    pub async fn close(self) -> DatasetResult<()> {
        if let Self::Verified(channel) = self {
            channel.close().await?;
        }

        Ok(())
    }
}
