use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("invalid range response from {url}: {reason}")]
    InvalidRange { url: String, reason: String },

    #[error("short read from {locator}: got {got} of {expected} bytes")]
    ShortRead {
        locator: String,
        got: u64,
        expected: u64,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn invalid_range(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRange {
            url: url.into(),
            reason: reason.into(),
        }
    }
}
