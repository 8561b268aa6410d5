//! Kernel-facing isolation primitives
//!
//! Namespaces and process creation, cgroup accounting, and the raw system
//! calls both are built on.

pub mod cgroup;
pub mod namespace;
pub mod process;
pub mod syscall;

pub use cgroup::{CgroupManager, CgroupRecord, CgroupVersion, ResourceLimits, UsageSample};
pub use namespace::{IdMapping, NamespaceManager, NamespaceType};
pub use process::{is_alive, ContainerProcess, ProcessConfig};
