use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use eyre::Result as EyreResult;
use vecdata_dataset::Dataset;

use crate::cli::Environment;
use crate::output::{FacetRow, FacetsResponse};

#[derive(Debug, Parser)]
#[command(about = "Commands for dataset directories")]
pub struct DatasetCommand {
    #[command(subcommand)]
    pub subcommand: DatasetSubCommands,
}

#[derive(Debug, Subcommand)]
pub enum DatasetSubCommands {
    #[command(about = "List the facet files of a dataset", alias = "ls")]
    Facets(FacetsCommand),
}

impl DatasetCommand {
    pub fn run(self, environment: &Environment) -> EyreResult<ExitCode> {
        match self.subcommand {
            DatasetSubCommands::Facets(facets) => facets.run(environment),
        }
    }
}

#[derive(Debug, Parser)]
pub struct FacetsCommand {
    /// Dataset directory
    #[arg(long, value_name = "DIR")]
    pub dir: Utf8PathBuf,
}

impl FacetsCommand {
    pub fn run(self, environment: &Environment) -> EyreResult<ExitCode> {
        let dataset = Dataset::open(self.dir.clone())?;

        let mut rows = Vec::new();
        for facet in dataset.facets()? {
            let size = facet.path.metadata()?.len();
            rows.push(FacetRow {
                name: facet.name.clone(),
                kind: facet.kind.describe(),
                size,
                verified: facet.is_verified(),
            });
        }

        environment.output.write(&FacetsResponse {
            dir: self.dir,
            facets: rows,
        });

        Ok(ExitCode::SUCCESS)
    }
}
