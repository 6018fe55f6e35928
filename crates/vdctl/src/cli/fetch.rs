use core::time::Duration;
use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use eyre::{eyre, Result as EyreResult};
use tracing::info;
use url::Url;
use vecdata_channel::{
    AdaptiveScheduler, AggressiveScheduler, ChannelOptions, ChunkError, ChunkScheduler,
    ConservativeScheduler, DefaultScheduler, MerkleChannel,
};
use vecdata_transport::{FileTransport, HttpTransport, Transport};

use crate::cli::Environment;
use crate::output::FetchResponse;

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum SchedulerPolicy {
    #[default]
    Default,
    Aggressive,
    Conservative,
    Adaptive,
}

impl SchedulerPolicy {
    fn build(self) -> Arc<dyn ChunkScheduler> {
        match self {
            Self::Default => Arc::new(DefaultScheduler),
            Self::Aggressive => Arc::new(AggressiveScheduler::default()),
            Self::Conservative => Arc::new(ConservativeScheduler::default()),
            Self::Adaptive => Arc::new(AdaptiveScheduler::default()),
        }
    }
}

#[derive(Debug, Parser)]
#[command(about = "Stage a data file locally, verifying every chunk")]
pub struct FetchCommand {
    /// Source URL (http, https, or file)
    #[arg(long, value_name = "URL")]
    pub url: Url,

    /// Reference sidecar for the file
    #[arg(long, value_name = "PATH")]
    pub reference: Utf8PathBuf,

    /// Local cache path to populate
    #[arg(long, value_name = "PATH")]
    pub output: Utf8PathBuf,

    /// Download scheduling policy
    #[arg(long, value_name = "POLICY", value_enum, default_value = "default")]
    pub scheduler: SchedulerPolicy,

    /// Worker count; defaults to the number of CPUs
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,
}

impl FetchCommand {
    pub async fn run(self, environment: &Environment) -> EyreResult<ExitCode> {
        let transport: Arc<dyn Transport> = match self.url.scheme() {
            "file" => {
                let path = self
                    .url
                    .to_file_path()
                    .map_err(|()| eyre!("invalid file url {}", self.url))?;
                Arc::new(FileTransport::new(path))
            }
            _ => Arc::new(HttpTransport::new(self.url.clone())?),
        };

        let mut options = ChannelOptions::new(self.reference.as_std_path(), self.output.as_std_path());
        options.scheduler = Some(self.scheduler.build());
        if let Some(workers) = self.workers {
            options.config.workers = workers;
        }

        let channel = MerkleChannel::open(transport, options).await?;
        let size = channel.size();
        let chunks = channel.shape().chunk_count();

        let progress = channel.prebuffer(0, size);
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = progress.wait() => break,
                _ = ticker.tick() => {
                    info!(
                        percent = progress.fraction_complete() * 100.0,
                        rate_mbit = ?progress.rate_mbit_per_sec(),
                        eta_seconds = ?progress.eta_seconds(),
                        in_flight = channel.in_flight_count(),
                        "fetching"
                    );
                }
            }
        }

        let mut failed_chunks: Vec<u64> =
            progress.failures().iter().map(ChunkError::chunk).collect();
        failed_chunks.sort_unstable();
        failed_chunks.dedup();

        channel.close().await?;

        let failed = !failed_chunks.is_empty();
        environment.output.write(&FetchResponse {
            url: self.url.to_string(),
            output: self.output,
            bytes: size,
            chunks,
            failed_chunks,
        });

        Ok(if failed {
            ExitCode::from(1)
        } else {
            ExitCode::SUCCESS
        })
    }
}
