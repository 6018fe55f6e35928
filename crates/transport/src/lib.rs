//! Byte-range transports for immutable data files.
//!
//! A [`Transport`] serves read-only byte ranges of one source file, either
//! over HTTP (`Range` requests) or from the local filesystem. The returned
//! [`RangeResponse`] exposes a reader bounded to the granted range; the
//! underlying socket or file handle is released on drop.

use core::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

pub use crate::errors::TransportError;
pub use crate::file::FileTransport;
pub use crate::http::HttpTransport;
pub use crate::limited::BoundedReader;

mod errors;
mod file;
mod http;
mod limited;

pub type TransportResult<T> = Result<T, TransportError>;

/// A boxed reader over a fetched range.
pub type RangeReader = BoundedReader<Box<dyn AsyncRead + Send + Unpin>>;

#[async_trait]
pub trait Transport: fmt::Debug + Send + Sync {
    /// Fetch the byte range `[offset, offset + length)`. The response may
    /// be shorter than requested when the range extends past end of file,
    /// never longer.
    async fn fetch(&self, offset: u64, length: u64) -> TransportResult<RangeResponse>;

    /// Human-readable source locator (URL or path) for diagnostics.
    fn locator(&self) -> String;
}

/// A granted byte range and its streaming body.
pub struct RangeResponse {
    offset: u64,
    length: u64,
    reader: RangeReader,
}

impl RangeResponse {
    pub(crate) fn new(offset: u64, length: u64, reader: RangeReader) -> Self {
        Self {
            offset,
            length,
            reader,
        }
    }

    /// Starting byte offset the source granted.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of body bytes the source declared for this range.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.length
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[must_use]
    pub fn into_reader(self) -> RangeReader {
        self.reader
    }

    /// Drain the body into memory. Returns however many bytes the stream
    /// actually produced; callers comparing against [`Self::len`] decide
    /// whether a shortfall is end-of-file or a failure.
    pub async fn read_all(mut self) -> TransportResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(usize::try_from(self.length).unwrap_or(0));
        let _ = self.reader.read_to_end(&mut buf).await?;

        Ok(buf)
    }
}

impl fmt::Debug for RangeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeResponse")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}
