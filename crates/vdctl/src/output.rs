use camino::Utf8PathBuf;
use clap::ValueEnum;
use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum Format {
    Json,
    #[default]
    Human,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Output {
    format: Format,
}

pub trait Report {
    fn report(&self);
}

impl Output {
    #[must_use]
    pub const fn new(format: Format) -> Self {
        Self { format }
    }

    pub fn write<T: Serialize + Report>(&self, value: &T) {
        match self.format {
            Format::Json => match serde_json::to_string(&value) {
                Ok(json) => println!("{json}"),
                Err(err) => eprintln!("Failed to serialize to JSON: {err}"),
            },
            Format::Human => value.report(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub file: Utf8PathBuf,
    pub output: Utf8PathBuf,
    pub file_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u64,
}

impl Report for CreateResponse {
    fn report(&self) {
        println!(
            "built {} ({} bytes in {} chunk(s) of {} bytes)",
            self.output, self.file_size, self.chunk_count, self.chunk_size
        );
    }
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub file: Utf8PathBuf,
    pub reference: Utf8PathBuf,
    pub chunk_count: u64,
    pub mismatched: Vec<u64>,
}

impl Report for VerifyResponse {
    fn report(&self) {
        if self.mismatched.is_empty() {
            println!("{}: all {} chunk(s) match", self.file, self.chunk_count);
        } else {
            println!(
                "{}: {} of {} chunk(s) MISMATCH: {:?}",
                self.file,
                self.mismatched.len(),
                self.chunk_count,
                self.mismatched
            );
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub file: Utf8PathBuf,
    pub file_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u64,
    pub verified: u64,
    pub fraction_complete: f64,
}

impl Report for SummaryResponse {
    fn report(&self) {
        println!(
            "{}: {} bytes, chunk size {}, {}/{} chunk(s) verified ({:.1}%)",
            self.file,
            self.file_size,
            self.chunk_size,
            self.verified,
            self.chunk_count,
            self.fraction_complete * 100.0
        );
    }
}

#[derive(Debug, Serialize)]
pub struct ReverifyResponse {
    pub cache: Utf8PathBuf,
    pub cleared: Vec<u64>,
}

impl Report for ReverifyResponse {
    fn report(&self) {
        if self.cleared.is_empty() {
            println!("{}: cache matches its state", self.cache);
        } else {
            println!(
                "{}: cleared {} stale chunk(s): {:?}",
                self.cache,
                self.cleared.len(),
                self.cleared
            );
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FetchResponse {
    pub url: String,
    pub output: Utf8PathBuf,
    pub bytes: u64,
    pub chunks: u64,
    pub failed_chunks: Vec<u64>,
}

impl Report for FetchResponse {
    fn report(&self) {
        if self.failed_chunks.is_empty() {
            println!(
                "fetched {} -> {} ({} bytes, {} chunk(s) verified)",
                self.url, self.output, self.bytes, self.chunks
            );
        } else {
            println!(
                "fetch of {} FAILED for {} chunk(s): {:?}",
                self.url,
                self.failed_chunks.len(),
                self.failed_chunks
            );
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FacetRow {
    pub name: String,
    pub kind: &'static str,
    pub size: u64,
    pub verified: bool,
}

#[derive(Debug, Serialize)]
pub struct FacetsResponse {
    pub dir: Utf8PathBuf,
    pub facets: Vec<FacetRow>,
}

impl Report for FacetsResponse {
    fn report(&self) {
        println!("{} facet(s) in {}", self.facets.len(), self.dir);
        for facet in &self.facets {
            println!(
                "  {:<24} {:<16} {:>12} bytes  {}",
                facet.name,
                facet.kind,
                facet.size,
                if facet.verified { "verified" } else { "direct" }
            );
        }
    }
}
