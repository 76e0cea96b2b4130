//! Request/response types and the [`CloudApi`] trait.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An error returned by the cloud provider. `code` carries the
/// provider's machine-readable error code when one was supplied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct CloudError {
    pub code: Option<String>,
    pub message: String,
}

impl CloudError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        CloudError {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn uncoded(message: impl Into<String>) -> Self {
        CloudError {
            code: None,
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl fmt::Display for CloudError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{code}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// A block device to attach at launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDevice {
    /// Device name, e.g. `/dev/xvdb`.
    pub device_name: String,
    pub volume_size_gib: u64,
    /// Volume type, e.g. `gp2` or `st1`.
    pub volume_type: String,
    pub delete_on_termination: bool,
}

/// Everything the provider needs to materialize an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub image_id: String,
    pub instance_type: String,
    pub subnet_id: String,
    pub security_group: String,
    pub instance_profile: String,
    pub key_name: Option<String>,
    /// base64-encoded first-boot configuration.
    pub user_data: String,
    pub ebs_optimized: bool,
    pub block_devices: Vec<BlockDevice>,
}

/// A run-instances call. With `dry_run` the provider validates the
/// request (including capacity) without launching.
#[derive(Debug, Clone, PartialEq)]
pub struct RunInstancesRequest {
    pub spec: LaunchSpec,
    pub count: u32,
    pub dry_run: bool,
    /// Idempotency token; a fresh token per logical launch.
    pub client_token: Option<String>,
}

/// A spot-instances request with a bid and an expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct SpotRequest {
    pub spec: LaunchSpec,
    /// Bid in USD/hour.
    pub spot_price: f64,
    pub valid_until: DateTime<Utc>,
}

/// Status of a spot request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotStatus {
    pub request_id: String,
    /// Provider status code, e.g. `fulfilled` or `schedule-expired`.
    pub status_code: String,
    pub instance_id: Option<String>,
}

/// Lifecycle state of a launched instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceLifecycle {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopped,
}

/// A provider-side view of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudInstance {
    pub instance_id: String,
    pub instance_type: String,
    pub public_dns_name: String,
    pub lifecycle: InstanceLifecycle,
    pub tags: BTreeMap<String, String>,
}

/// The calls the cluster manager actually issues against the
/// provider. Implementations must be safe for concurrent use.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Launch (or, with `dry_run`, validate) instances. A successful
    /// dry run is reported as an error whose code is
    /// [`crate::DRY_RUN_OK_CODE`], mirroring provider behavior.
    async fn run_instances(
        &self,
        req: RunInstancesRequest,
    ) -> Result<Vec<CloudInstance>, CloudError>;

    async fn describe_instance(&self, instance_id: &str) -> Result<CloudInstance, CloudError>;

    /// Submit a spot request; returns the spot request id.
    async fn request_spot_instances(&self, req: SpotRequest) -> Result<String, CloudError>;

    async fn describe_spot_request(&self, request_id: &str) -> Result<SpotStatus, CloudError>;

    async fn create_tags(
        &self,
        instance_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), CloudError>;

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), CloudError>;
}
