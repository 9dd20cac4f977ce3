pub mod pipeline;

pub use pipeline::{order_by_history, PipelineStore};
