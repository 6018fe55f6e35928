use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::Result as EyreResult;
use vecdata_merkle::MerkleState;

use crate::cli::Environment;
use crate::output::SummaryResponse;

#[derive(Debug, Parser)]
pub struct SummaryCommand {
    /// State sidecar (.mrkl) to summarize
    #[arg(long, value_name = "FILE")]
    pub file: Utf8PathBuf,
}

impl SummaryCommand {
    pub fn run(self, environment: &Environment) -> EyreResult<ExitCode> {
        let state = MerkleState::load(self.file.as_std_path())?;
        let shape = *state.shape();

        environment.output.write(&SummaryResponse {
            file: self.file,
            file_size: shape.file_size(),
            chunk_size: shape.chunk_size(),
            chunk_count: shape.chunk_count(),
            verified: state.count_valid(),
            fraction_complete: state.fraction_complete(),
        });

        Ok(ExitCode::SUCCESS)
    }
}
