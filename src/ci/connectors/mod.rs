//! Container engines

pub mod docker;
pub mod traits;

pub use docker::DockerCli;
pub use traits::{ContainerEngine, ContainerLogs, ContainerSpec};
