//! flowgrid-cluster — the elastic compute-cluster manager.
//!
//! The manager satisfies a stream of resource requests by launching
//! cloud VMs that run the flowgrid worker:
//!
//! ```text
//! ClusterManager::allocate(need)
//!   ├── SelectorState — pick an instance type (largest or cheapest)
//!   ├── LaunchDriver  — probe → launch → tag → wait → verify image
//!   │     └── CloudConfigBuilder — first-boot user data
//!   └── publish the worker endpoint; mark the type unavailable and
//!       retry with another on capacity failures
//! ```
//!
//! Workers terminate themselves after ten idle minutes; the manager
//! observes terminations through the cloud API and prunes its pool.

pub mod catalog;
pub mod cloudinit;
pub mod launcher;
pub mod manager;
pub mod selector;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::{configs, InstanceConfig, InstanceType, MEMORY_DISCOUNT};
pub use cloudinit::{build_user_data, BootParams, CloudConfig, TraceAgent};
pub use launcher::{LaunchDriver, LaunchParams, WorkerImage, WorkerInstance};
pub use manager::{ClusterConfig, ClusterManager, SelectionPolicy, WorkerHandle};
pub use selector::SelectorState;
