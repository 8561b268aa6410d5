//! Corral - a small Linux container runtime
//!
//! Corral isolates a command in fresh kernel namespaces on top of an overlay
//! root filesystem, accounts and limits it through a cgroup, and wires it to a
//! host bridge with NAT. It provides:
//!
//! - Container lifecycle management (create, start, stop, remove)
//! - Namespace and cgroup (v1 and v2) management
//! - Layered overlay root filesystems
//! - veth/bridge networking with iptables port maps
//! - Background monitoring of running containers

pub mod config;
pub mod container;
pub mod error;
pub mod filesystem;
pub mod network;
pub mod runtime;

pub use config::RuntimeConfig;
pub use container::ContainerManager;
pub use error::{CorralError, Result};
