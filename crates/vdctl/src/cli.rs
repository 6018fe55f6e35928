use std::process::ExitCode;

use clap::{Parser, Subcommand};
use const_format::concatcp;
use eyre::Result as EyreResult;

use crate::cli::dataset::DatasetCommand;
use crate::cli::fetch::FetchCommand;
use crate::cli::merkle::MerkleCommand;
use crate::output::{Format, Output};

mod dataset;
mod fetch;
mod merkle;

pub const EXAMPLES: &str = r"
  # Build a reference sidecar for a facet file
  $ vdctl merkle create --file base.fvec

  # Verify a local file against its reference
  $ vdctl merkle verify --file base.fvec --reference base.fvec.mref

  # Summarize a state sidecar
  $ vdctl merkle summary --file cache/base.fvec.mrkl

  # Stage a remote facet with verification and progress
  $ vdctl fetch --url https://datasets.example.com/glove/base.fvec \
      --reference base.fvec.mref --output cache/base.fvec

  # List the facets of a dataset directory
  $ vdctl dataset facets --dir ./glove-25
";

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
#[command(after_help = concatcp!(
    "Environment variables:\n",
    "  VECDATA_OUTPUT    Output format (json or human)\n\n",
    "Exit codes:\n",
    "  0 success, 1 verification failure, 2 I/O error, 3 usage error\n\n",
    "Examples:",
    EXAMPLES
))]
pub struct RootCommand {
    #[command(flatten)]
    pub args: RootArgs,

    #[command(subcommand)]
    pub action: SubCommands,
}

#[derive(Debug, Subcommand)]
pub enum SubCommands {
    Merkle(MerkleCommand),
    Fetch(FetchCommand),
    Dataset(DatasetCommand),
}

#[derive(Debug, Parser)]
pub struct RootArgs {
    /// Output format
    #[arg(long, value_name = "FORMAT", value_enum, default_value = "human")]
    #[arg(env = "VECDATA_OUTPUT", hide_env_values = true)]
    pub output_format: Format,
}

#[derive(Debug)]
pub struct Environment {
    pub output: Output,
}

impl Environment {
    #[must_use]
    pub const fn new(output: Output) -> Self {
        Self { output }
    }
}

impl RootCommand {
    pub async fn run(self) -> EyreResult<ExitCode> {
        let environment = Environment::new(Output::new(self.args.output_format));

        match self.action {
            SubCommands::Merkle(merkle) => merkle.run(&environment).await,
            SubCommands::Fetch(fetch) => fetch.run(&environment).await,
            SubCommands::Dataset(dataset) => dataset.run(&environment),
        }
    }
}
