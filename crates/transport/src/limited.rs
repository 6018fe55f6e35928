//! Reader adapter that never yields more bytes than its budget.

use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf, Take};

/// Caps an inner reader at a fixed number of bytes. The underlying stream
/// may hold more data (a 200 response carrying the whole file, a cache
/// file larger than the request); the surplus is never surfaced.
#[derive(Debug)]
pub struct BoundedReader<R> {
    inner: Take<R>,
}

impl<R: AsyncRead + Unpin> BoundedReader<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        Self {
            inner: inner.take(limit),
        }
    }

    /// Bytes still allowed to flow through.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.inner.limit()
    }

    #[must_use]
    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for BoundedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn stops_at_the_budget() {
        let data = vec![0xA5_u8; 1024];
        let mut reader = BoundedReader::new(&data[..], 100);

        let mut out = Vec::new();
        let n = reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(n, 100);
        assert_eq!(out, vec![0xA5; 100]);
        assert_eq!(reader.remaining(), 0);
    }

    #[tokio::test]
    async fn short_input_ends_early() {
        let data = [1_u8, 2, 3];
        let mut reader = BoundedReader::new(&data[..], 10);

        let mut out = Vec::new();
        let n = reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(n, 3);
        assert_eq!(reader.remaining(), 7);
    }

    #[tokio::test]
    async fn zero_budget_yields_nothing() {
        let data = [9_u8; 16];
        let mut reader = BoundedReader::new(&data[..], 0);

        let mut out = Vec::new();
        assert_eq!(reader.read_to_end(&mut out).await.unwrap(), 0);
        assert!(out.is_empty());
    }
}
