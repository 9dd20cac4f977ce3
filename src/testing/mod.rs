//! In-process doubles for the container engine and artifact sink.

pub mod fake_engine;
pub mod memory_sink;

pub use fake_engine::{FakeContainerEngine, FakeJob};
pub use memory_sink::MemoryArtifactSink;
