//! Container Manager module — see `docker` for the runtime-backed
//! implementation and `types` for the data shapes it exchanges.

mod docker;
mod types;

pub use docker::{AttachedPty, ContainerManager};
pub use types::{
    ContainerFilter, ContainerInfo, ContainerSpec, ContainerStats, ContainerStatus,
    ResourceLimits,
};
