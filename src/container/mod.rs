//! Container management module
//!
//! The lifecycle core: a registry of containers, the state machine that moves
//! them between `created`, `running` and `stopped`, per-container monitors,
//! and the backend seam through which the host resources are provisioned.

pub mod backend;
pub mod config;
pub mod lifecycle;
pub mod lock;
pub mod monitor;
pub mod state;

#[cfg(test)]
pub(crate) mod mock;

pub use backend::{ContainerBackend, LinuxBackend};
pub use config::{
    format_bytes, validate_name, ContainerInfo, ContainerRecord, ContainerStatus, CreateRequest,
};
pub use lifecycle::ContainerManager;
pub use lock::RootLock;
pub use state::StateStore;
