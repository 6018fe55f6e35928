use core::time::Duration;
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

/// Tunables for a channel's executor and retry behavior.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Worker tasks draining the download queue.
    pub workers: usize,

    /// Ceiling on a single fetch attempt, including body transfer.
    #[serde(rename = "transport_timeout_ms", with = "serde_duration")]
    pub transport_timeout: Duration,

    /// Fetch attempts per task before its chunks fail terminally.
    pub retry_attempts: u32,

    /// First retry delay; doubles per attempt.
    #[serde(rename = "retry_base_delay_ms", with = "serde_duration")]
    pub retry_base_delay: Duration,

    /// How long `close` waits for in-flight work before abandoning it.
    #[serde(rename = "drain_timeout_ms", with = "serde_duration")]
    pub drain_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(4),
            transport_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(250),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

mod serde_duration {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
