pub mod artifacts;
pub mod checker;
pub mod config;
pub mod connectors;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod overrides;
pub mod pipeline;
pub mod repository;
pub mod yaml_locator;
pub mod yaml_parser;

pub use checker::{ConfigChecker, ValidationResult};
pub use config::PipelineConfig;
pub use engine::{PipelineOrchestrator, RunOptions, RunOutcome};
pub use executor::JobRunner;
