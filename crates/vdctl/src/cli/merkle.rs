use std::process::ExitCode;

use clap::{Parser, Subcommand};
use const_format::concatcp;
use eyre::Result as EyreResult;

use crate::cli::Environment;

pub mod create;
pub mod reverify;
pub mod summary;
pub mod verify;

pub const EXAMPLES: &str = r"
  # Build a reference with an explicit chunk size
  $ vdctl merkle create --file base.fvec --chunk-size 1048576

  # Verify a file; exits 1 if any chunk mismatches
  $ vdctl merkle verify --file base.fvec --reference base.fvec.mref

  # Inspect how much of a cache is verified
  $ vdctl merkle summary --file cache/base.fvec.mrkl

  # Re-hash a cache against its reference, clearing stale chunks
  $ vdctl merkle reverify --cache cache/base.fvec --reference base.fvec.mref
";

#[derive(Debug, Parser)]
#[command(about = "Commands for merkle reference and state sidecars")]
#[command(after_help = concatcp!(
    "Examples:",
    EXAMPLES
))]
pub struct MerkleCommand {
    #[command(subcommand)]
    pub subcommand: MerkleSubCommands,
}

#[derive(Debug, Subcommand)]
pub enum MerkleSubCommands {
    #[command(about = "Build a merkle reference for a data file")]
    Create(create::CreateCommand),
    #[command(about = "Verify a local file against a reference")]
    Verify(verify::VerifyCommand),
    #[command(about = "Summarize a state sidecar")]
    Summary(summary::SummaryCommand),
    #[command(about = "Re-hash a cache against its reference")]
    Reverify(reverify::ReverifyCommand),
}

impl MerkleCommand {
    pub async fn run(self, environment: &Environment) -> EyreResult<ExitCode> {
        match self.subcommand {
            MerkleSubCommands::Create(create) => create.run(environment),
            MerkleSubCommands::Verify(verify) => verify.run(environment),
            MerkleSubCommands::Summary(summary) => summary.run(environment),
            MerkleSubCommands::Reverify(reverify) => reverify.run(environment).await,
        }
    }
}
