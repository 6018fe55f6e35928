//! Local-file transport: a file on disk is its own trusted source.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeekExt, SeekFrom};

use crate::limited::BoundedReader;
use crate::{RangeResponse, Transport, TransportResult};

#[derive(Clone, Debug)]
pub struct FileTransport {
    path: PathBuf,
}

impl FileTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn fetch(&self, offset: u64, length: u64) -> TransportResult<RangeResponse> {
        let mut file = File::open(&self.path).await?;
        let file_len = file.metadata().await?.len();

        let granted = if offset >= file_len {
            0
        } else {
            length.min(file_len - offset)
        };

        if granted > 0 {
            let _ = file.seek(SeekFrom::Start(offset)).await?;
        }

        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(file);
        Ok(RangeResponse::new(
            offset,
            granted,
            BoundedReader::new(reader, granted),
        ))
    }

    fn locator(&self) -> String {
        self.path.display().to_string()
    }
}
