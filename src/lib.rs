//! Main library crate for the bankpipe statement pipeline

pub mod app;
pub mod classify;
pub mod common;
pub mod config;
pub mod dedup;
pub mod domain;
pub mod guided;
pub mod infra;
pub mod ingest;
pub mod interpret;
pub mod normalize;
pub mod observability;
pub mod pipeline;
pub mod reconcile;

// Re-export commonly used types
pub use common::error::{PipelineError, Result};
pub use domain::{NormalizedRecord, RawRecord};
pub use pipeline::{PipelineRunner, RunOutcome};
