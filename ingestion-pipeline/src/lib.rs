#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod chunker;
pub mod parser;
pub mod pipeline;
pub mod runner;
pub mod services;

pub use pipeline::{is_local, run_once, IngestOutcome};
pub use runner::{run_worker_loop, RunnerConfig};
pub use services::{DefaultIngestServices, IngestPipelineConfig, IngestServices};
