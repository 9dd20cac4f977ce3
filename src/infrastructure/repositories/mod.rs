pub mod disconnected;
pub mod memory;
pub mod mongo_pipeline_repository;

pub use disconnected::DisconnectedStore;
pub use memory::MemoryPipelineStore;
pub use mongo_pipeline_repository::MongoPipelineStore;
