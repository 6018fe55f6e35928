use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::Result as EyreResult;
use tracing::info;
use vecdata_merkle::build_reference;

use crate::cli::Environment;
use crate::output::CreateResponse;

#[derive(Debug, Parser)]
pub struct CreateCommand {
    /// Data file to build a reference for
    #[arg(long, value_name = "FILE")]
    pub file: Utf8PathBuf,

    /// Chunk size in bytes (power of two); defaults to a size-based
    /// heuristic between 1 MiB and 64 MiB
    #[arg(long, value_name = "BYTES")]
    pub chunk_size: Option<u64>,

    /// Where to write the reference; defaults to <FILE>.mref
    #[arg(long, value_name = "PATH")]
    pub output: Option<Utf8PathBuf>,
}

impl CreateCommand {
    pub fn run(self, environment: &Environment) -> EyreResult<ExitCode> {
        let output = self
            .output
            .unwrap_or_else(|| Utf8PathBuf::from(format!("{}.mref", self.file)));

        let last_reported = AtomicU64::new(0);
        let shape = build_reference(
            self.file.as_std_path(),
            output.as_std_path(),
            self.chunk_size,
            |done, total| {
                let percent = done * 100 / total.max(1);
                let last = last_reported.load(Ordering::Relaxed);
                if percent >= last + 10
                    && last_reported
                        .compare_exchange(last, percent, Ordering::Relaxed, Ordering::Relaxed)
                        .is_ok()
                {
                    info!(percent, "hashing chunks");
                }
            },
        )?;

        environment.output.write(&CreateResponse {
            file: self.file,
            output,
            file_size: shape.file_size(),
            chunk_size: shape.chunk_size(),
            chunk_count: shape.chunk_count(),
        });

        Ok(ExitCode::SUCCESS)
    }
}
