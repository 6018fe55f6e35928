use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::Result as EyreResult;
use vecdata_channel::{ChannelOptions, MerkleChannel};
use vecdata_transport::FileTransport;

use crate::cli::Environment;
use crate::output::ReverifyResponse;

#[derive(Debug, Parser)]
pub struct ReverifyCommand {
    /// Cache file to re-hash
    #[arg(long, value_name = "FILE")]
    pub cache: Utf8PathBuf,

    /// Reference sidecar the cache was verified against
    #[arg(long, value_name = "PATH")]
    pub reference: Utf8PathBuf,

    /// State sidecar; defaults to <CACHE>.mrkl
    #[arg(long, value_name = "PATH")]
    pub state: Option<Utf8PathBuf>,
}

impl ReverifyCommand {
    pub async fn run(self, environment: &Environment) -> EyreResult<ExitCode> {
        // Reverification never fetches; the cache stands in as its own
        // (unused) source.
        let transport = Arc::new(FileTransport::new(self.cache.as_std_path()));

        let mut options =
            ChannelOptions::new(self.reference.as_std_path(), self.cache.as_std_path());
        options.state_path = self.state.map(camino::Utf8PathBuf::into_std_path_buf);

        let channel = MerkleChannel::open(transport, options).await?;
        let cleared = channel.reverify().await?;
        channel.close().await?;

        let tampered = !cleared.is_empty();
        environment.output.write(&ReverifyResponse {
            cache: self.cache,
            cleared,
        });

        Ok(if tampered {
            ExitCode::from(1)
        } else {
            ExitCode::SUCCESS
        })
    }
}
