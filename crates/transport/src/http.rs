//! HTTP range transport.
//!
//! Issues `Range: bytes=A-B` requests and accepts either `206 Partial
//! Content` (the granted range confirmed by `Content-Range`) or a plain
//! `200` from servers that ignore range requests, in which case the prefix
//! up to the requested offset is read and discarded.

use core::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;
use tracing::debug;
use url::Url;

use crate::errors::TransportError;
use crate::limited::BoundedReader;
use crate::{RangeResponse, Transport, TransportResult};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 5;

#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    url: Url,
}

impl HttpTransport {
    pub fn new(url: Url) -> TransportResult<Self> {
        Self::with_timeout(url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(url: Url, timeout: Duration) -> TransportResult<Self> {
        let client = Client::builder()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .timeout(timeout)
            .build()
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;

        Ok(Self { client, url })
    }

    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, offset: u64, length: u64) -> TransportResult<RangeResponse> {
        if length == 0 {
            let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(tokio::io::empty());
            return Ok(RangeResponse::new(offset, 0, BoundedReader::new(reader, 0)));
        }

        let end = offset + length - 1;
        let response = self
            .client
            .get(self.url.clone())
            .header(RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: self.url.to_string(),
                source,
            })?;

        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT => {
                let header = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_owned)
                    .ok_or_else(|| {
                        TransportError::invalid_range(self.url.as_str(), "missing Content-Range")
                    })?;

                let (start, last) = parse_content_range(&header).ok_or_else(|| {
                    TransportError::invalid_range(
                        self.url.as_str(),
                        format!("unparseable Content-Range {header:?}"),
                    )
                })?;

                if start != offset {
                    return Err(TransportError::invalid_range(
                        self.url.as_str(),
                        format!("asked for offset {offset}, server granted {start}"),
                    ));
                }

                let granted = (last - start + 1).min(length);
                debug!(offset, length, granted, "partial content response");

                let reader = into_reader(response);
                Ok(RangeResponse::new(
                    offset,
                    granted,
                    BoundedReader::new(reader, granted),
                ))
            }
            StatusCode::OK => {
                // Server ignored the range header and is sending the whole
                // file; discard the prefix and bound the rest.
                let total = response.content_length();
                let mut reader = into_reader(response);

                if offset > 0 {
                    let skipped =
                        tokio::io::copy(&mut (&mut reader).take(offset), &mut tokio::io::sink())
                            .await?;
                    if skipped < offset {
                        let empty: Box<dyn AsyncRead + Send + Unpin> = Box::new(tokio::io::empty());
                        return Ok(RangeResponse::new(offset, 0, BoundedReader::new(empty, 0)));
                    }
                }

                let granted = match total {
                    Some(total) => total.saturating_sub(offset).min(length),
                    None => length,
                };
                debug!(offset, length, granted, "full-body fallback response");

                Ok(RangeResponse::new(
                    offset,
                    granted,
                    BoundedReader::new(reader, granted),
                ))
            }
            status => Err(TransportError::Status {
                url: self.url.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    fn locator(&self) -> String {
        self.url.to_string()
    }
}

fn into_reader(response: reqwest::Response) -> Box<dyn AsyncRead + Send + Unpin> {
    let stream = response
        .bytes_stream()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err));

    Box::new(StreamReader::new(Box::pin(stream)))
}

/// Parse `bytes A-B/total` (total may be `*`) into `(A, B)`.
fn parse_content_range(value: &str) -> Option<(u64, u64)> {
    let rest = value.strip_prefix("bytes ")?;
    let (range, _total) = rest.split_once('/')?;
    let (start, last) = range.split_once('-')?;

    let start = start.trim().parse().ok()?;
    let last = last.trim().parse().ok()?;
    (start <= last).then_some((start, last))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_content_range() {
        assert_eq!(parse_content_range("bytes 0-99/1000"), Some((0, 99)));
        assert_eq!(parse_content_range("bytes 100-199/*"), Some((100, 199)));
    }

    #[test]
    fn rejects_malformed_content_range() {
        assert_eq!(parse_content_range("bytes 100-99/1000"), None);
        assert_eq!(parse_content_range("bytes 100/1000"), None);
        assert_eq!(parse_content_range("items 0-99/1000"), None);
        assert_eq!(parse_content_range("bytes x-y/z"), None);
    }
}
