//! Pipeline execution engine

pub mod dry_run;
pub mod orchestrator;

pub use orchestrator::{PipelineOrchestrator, PipelineStatus, RunOptions, RunOutcome, RunSummary};
