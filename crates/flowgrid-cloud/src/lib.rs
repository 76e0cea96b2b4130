//! flowgrid-cloud — the narrow cloud-provider seam.
//!
//! [`CloudApi`] captures exactly the provider calls the cluster
//! manager uses: run-instances (including dry-run capacity probes),
//! describe-instances, spot request/describe, tagging and
//! termination. Test doubles replace it directly; a production
//! implementation adapts the provider SDK behind it.

pub mod api;
pub mod testing;

pub use api::{
    BlockDevice, CloudApi, CloudError, CloudInstance, InstanceLifecycle, LaunchSpec,
    RunInstancesRequest, SpotRequest, SpotStatus,
};

/// Provider error codes that indicate exhausted capacity. The launch
/// driver reclassifies these to the `Unavailable` kind before
/// dispatching.
pub const CAPACITY_ERROR_CODES: &[&str] = &[
    "InsufficientCapacity",
    "InsufficientInstanceCapacity",
    "InsufficientHostCapacity",
    "InsufficientReservedInstanceCapacity",
    "InstanceLimitExceeded",
];

/// The code a dry-run probe returns when the request would have
/// succeeded.
pub const DRY_RUN_OK_CODE: &str = "DryRunOperation";

/// The code the provider returns when a call is cancelled by its
/// context.
pub const REQUEST_CANCELED_CODE: &str = "RequestCanceled";
