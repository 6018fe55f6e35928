use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::Result as EyreResult;
use vecdata_merkle::{verify_file, MerkleRef};

use crate::cli::Environment;
use crate::output::VerifyResponse;

#[derive(Debug, Parser)]
pub struct VerifyCommand {
    /// Data file to verify
    #[arg(long, value_name = "FILE")]
    pub file: Utf8PathBuf,

    /// Reference sidecar to verify against
    #[arg(long, value_name = "PATH")]
    pub reference: Utf8PathBuf,
}

impl VerifyCommand {
    pub fn run(self, environment: &Environment) -> EyreResult<ExitCode> {
        let reference = MerkleRef::load(self.reference.as_std_path())?;
        let report = verify_file(self.file.as_std_path(), &reference, |_, _| {})?;

        let clean = report.is_clean();
        environment.output.write(&VerifyResponse {
            file: self.file,
            reference: self.reference,
            chunk_count: report.chunk_count,
            mismatched: report.mismatched,
        });

        Ok(if clean {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(1)
        })
    }
}
