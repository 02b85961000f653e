//! Config-driven archive ingestion engine.
//!
//! Datasets declared in a pipeline file are extracted from a zip archive,
//! decoded, projected onto their configured columns, and appended to a
//! single text-typed table, optionally waiting on another dataset's run.

pub mod config;
pub mod errors;
pub mod extract;
pub mod gate;
pub mod loader;
pub mod orchestrator;
pub mod plan;
pub mod project;
pub mod readers;
pub mod registry;
mod resolve;
pub mod result;
pub mod store;

// Re-export public API for convenience
pub use errors::{ConfigurationError, IngestError, PipelineError, Stage, Violation, ViolationKind};
pub use orchestrator::{check_pipeline, open_run_ledger, CheckResult, Pipeline, PipelineSettings};
pub use result::{CycleReport, DatasetOutcome, LoadSummary};
