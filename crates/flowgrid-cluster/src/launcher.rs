//! The per-instance launch state machine.
//!
//! A `LaunchDriver` takes a selected configuration through capacity
//! probing, launch, tagging, readiness and worker-image verification:
//!
//! ```text
//! Capacity → Launch → Tag → WaitInstance → DescribeDns
//!   → WaitWorker → DescribeTags → [UpdateImage → WaitWorker]* → Done
//! ```
//!
//! Errors are dispatched by kind: `Fatal` and `Unavailable` abort the
//! launch immediately (the manager can pick a different type);
//! everything else retries the same state with exponential backoff up
//! to a bounded number of tries. After a successful image update the
//! machine resets to `WaitWorker`, because the worker restarts into
//! the new image and must be re-verified.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use flow_core::{Digest, Error, ErrorKind, Labels, OnceTask, Repository};
use flowgrid_cloud::{
    BlockDevice, CloudApi, CloudError, CloudInstance, InstanceLifecycle, LaunchSpec,
    RunInstancesRequest, SpotRequest, CAPACITY_ERROR_CODES, DRY_RUN_OK_CODE,
    REQUEST_CANCELED_CODE,
};
use flowgrid_worker::{WorkerDialer, DIGEST_TAG, VERSION_TAG};

use crate::catalog::InstanceConfig;
use crate::cloudinit::{self, min_disk_size, BootParams, CloudConfig, TraceAgent};

/// Attempts of one state before the launch is abandoned.
pub const MAX_TRIES: u32 = 5;

const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(10);
const WORKER_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const IMAGE_UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);
/// How long a spot request stays valid.
const SPOT_REQUEST_VALIDITY: Duration = Duration::from_secs(60);
/// Slack past the request validity before fulfillment is abandoned.
const SPOT_FULFILLMENT_TIMEOUT: Duration = Duration::from_secs(70);
const POLL_INTERVAL: Duration = Duration::from_secs(15);
const WAIT_RUNNING_MAX_POLLS: u32 = 40;

/// The embedded worker image, its digest computed once per process
/// and its repository upload performed exactly once; concurrent
/// launches await and share the same outcome.
pub struct WorkerImage {
    data: Bytes,
    digest: OnceTask<Result<Digest, String>>,
    upload: OnceTask<Result<(), String>>,
}

impl WorkerImage {
    pub fn new(data: Bytes) -> Arc<Self> {
        Arc::new(WorkerImage {
            data,
            digest: OnceTask::new(),
            upload: OnceTask::new(),
        })
    }

    /// The image digest, computed on first use.
    pub async fn digest(&self) -> Result<Digest, Error> {
        self.digest
            .get_or_run(|| async { Ok(Digest::from_bytes(&self.data)) })
            .await
            .map_err(|msg| Error::fatal("image digest", msg))
    }

    /// Upload the image to the shared repository, once per process.
    /// Skips the write when the repository already holds the digest.
    pub async fn upload(&self, repo: &Arc<dyn Repository>) -> Result<(), Error> {
        let repo = Arc::clone(repo);
        let data = self.data.clone();
        self.upload
            .get_or_run(|| async move {
                let id = Digest::from_bytes(&data);
                match repo.contains(&id).await {
                    Ok(true) => return Ok(()),
                    Ok(false) => {}
                    Err(e) => return Err(e.to_string()),
                }
                debug!(digest = %id.short(), "uploading worker image to repository");
                let stored = repo.put(data).await.map_err(|e| e.to_string())?;
                if stored != id {
                    return Err("uploaded image digest mismatch".to_string());
                }
                Ok(())
            })
            .await
            .map_err(|msg| Error::fatal("uploading worker image", msg))
    }
}

/// Everything a driver needs to launch one instance.
#[derive(Debug, Clone)]
pub struct LaunchParams {
    pub config: InstanceConfig,
    pub region: String,
    pub spot: bool,
    /// Dry-run capacity probe depth; zero skips the probe.
    pub spot_probe_depth: u32,
    /// The spot bid, USD/hour.
    pub price: f64,
    pub ami: String,
    pub subnet: String,
    pub security_group: String,
    pub instance_profile: String,
    pub key_name: Option<String>,
    pub instance_tags: Labels,
    pub labels: Labels,
    pub ebs_type: String,
    pub ebs_size_gib: u64,
    pub n_ebs: u32,
    pub immortal: bool,
    pub registry_login: String,
    pub worker_config_yaml: String,
    pub ssh_key: Option<String>,
    pub worker_image: String,
    pub trace_agent: Option<TraceAgent>,
    pub extra_cloud_config: Option<CloudConfig>,
}

/// The worker-facing view of a launched instance, read back from its
/// tags.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInstance {
    pub instance_id: String,
    pub public_dns: String,
    pub version: String,
    pub digest: String,
}

impl WorkerInstance {
    fn of(inst: &CloudInstance) -> Self {
        WorkerInstance {
            instance_id: inst.instance_id.clone(),
            public_dns: inst.public_dns_name.clone(),
            version: inst.tags.get(VERSION_TAG).cloned().unwrap_or_default(),
            digest: inst.tags.get(DIGEST_TAG).cloned().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchState {
    Capacity,
    Launch,
    Tag,
    WaitInstance,
    DescribeDns,
    WaitWorker,
    DescribeTags,
    UpdateImage,
    Done,
}

impl LaunchState {
    fn next(self) -> LaunchState {
        match self {
            LaunchState::Capacity => LaunchState::Launch,
            LaunchState::Launch => LaunchState::Tag,
            LaunchState::Tag => LaunchState::WaitInstance,
            LaunchState::WaitInstance => LaunchState::DescribeDns,
            LaunchState::DescribeDns => LaunchState::WaitWorker,
            LaunchState::WaitWorker => LaunchState::DescribeTags,
            LaunchState::DescribeTags => LaunchState::UpdateImage,
            LaunchState::UpdateImage | LaunchState::Done => LaunchState::Done,
        }
    }

    /// The operation name carried on this state's errors.
    fn describe(self) -> &'static str {
        match self {
            LaunchState::Capacity => "checking capacity",
            LaunchState::Launch => "launching instance",
            LaunchState::Tag => "tagging instance",
            LaunchState::WaitInstance => "waiting for instance",
            LaunchState::DescribeDns => "describing instance (dns)",
            LaunchState::WaitWorker => "waiting for worker",
            LaunchState::DescribeTags => "describing instance (version, digest)",
            LaunchState::UpdateImage => "updating worker image",
            LaunchState::Done => "done",
        }
    }
}

/// Drives one instance from configuration to a live, image-verified
/// worker. Owned exclusively by the task that runs it; the result is
/// read through [`LaunchDriver::err`] and [`LaunchDriver::instance`]
/// after [`LaunchDriver::go`] returns.
pub struct LaunchDriver {
    cloud: Arc<dyn CloudApi>,
    repo: Arc<dyn Repository>,
    dialer: Arc<dyn WorkerDialer>,
    image: Arc<WorkerImage>,
    params: LaunchParams,

    backoff: Duration,
    poll_interval: Duration,
    spot_deadline: Duration,

    err: Option<Error>,
    instance: Option<CloudInstance>,
}

impl LaunchDriver {
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        repo: Arc<dyn Repository>,
        dialer: Arc<dyn WorkerDialer>,
        image: Arc<WorkerImage>,
        params: LaunchParams,
    ) -> Self {
        LaunchDriver {
            cloud,
            repo,
            dialer,
            image,
            params,
            backoff: INITIAL_BACKOFF,
            poll_interval: POLL_INTERVAL,
            spot_deadline: SPOT_FULFILLMENT_TIMEOUT,
            err: None,
            instance: None,
        }
    }

    /// Override the initial retry backoff.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Override the cloud polling interval.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll_interval = poll;
        self
    }

    /// Override the spot-fulfillment deadline.
    pub fn with_spot_deadline(mut self, deadline: Duration) -> Self {
        self.spot_deadline = deadline;
        self
    }

    /// Any error that ended the launch. `None` after a successful
    /// run, in which case [`LaunchDriver::instance`] carries a
    /// populated, digest-verified worker.
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// The launched instance as last described.
    pub fn instance(&self) -> Option<WorkerInstance> {
        self.instance.as_ref().map(WorkerInstance::of)
    }

    /// Run the launch to completion, failure, or cancellation.
    pub async fn go(&mut self, cancel: &CancellationToken) {
        self.clamp_ebs_shape();

        let mut state = LaunchState::Capacity;
        let mut tries: u32 = 0;
        let mut delay = self.backoff;
        let mut instance_id = String::new();
        let mut dns = String::new();

        while state != LaunchState::Done && !cancel.is_cancelled() {
            self.err = match state {
                LaunchState::Capacity => self.check_capacity(cancel).await.err(),
                LaunchState::Launch => match self.launch(cancel).await {
                    Ok(id) => {
                        let market = if self.params.spot { "spot " } else { "" };
                        info!(
                            instance = %id,
                            instance_type = %self.params.config.instance_type,
                            resources = %self.params.config.resources,
                            "launched {market}instance"
                        );
                        instance_id = id;
                        None
                    }
                    Err(e) => Some(e),
                },
                LaunchState::Tag => self.tag(&instance_id).await.err(),
                LaunchState::WaitInstance => self.wait_running(&instance_id).await.err(),
                LaunchState::DescribeDns => match self.describe_dns(&instance_id).await {
                    Ok(d) => {
                        dns = d;
                        None
                    }
                    Err(e) => Some(e),
                },
                LaunchState::WaitWorker => self.wait_worker(&dns).await.err(),
                LaunchState::DescribeTags => match self.describe_tags(&instance_id).await {
                    Ok(true) => {
                        state = LaunchState::Done;
                        continue;
                    }
                    Ok(false) => None, // advance to UpdateImage
                    Err(e) => Some(e),
                },
                LaunchState::UpdateImage => match self.update_image(&dns).await {
                    Ok(()) => {
                        // The worker restarts into the new image;
                        // re-verify from WaitWorker.
                        state = LaunchState::WaitWorker;
                        continue;
                    }
                    Err(e) => Some(e),
                },
                LaunchState::Done => unreachable!("loop exits on Done"),
            };

            let Some(err) = self.err.clone() else {
                tries = 0;
                delay = self.backoff;
                state = state.next();
                continue;
            };
            if tries == MAX_TRIES {
                break;
            }
            match err.kind {
                ErrorKind::Fatal => {
                    error!(instance = %instance_id, error = %err, "instance launch fatal");
                    return;
                }
                // The caller may be able to handle these by
                // selecting a different instance type.
                ErrorKind::Unavailable => {
                    error!(instance = %instance_id, error = %err, "instance unavailable");
                    return;
                }
                ErrorKind::Temporary | ErrorKind::Timeout | ErrorKind::Net => {}
                _ => {
                    error!(error = %err, "error while {}", state.describe());
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {}
            }
            tries += 1;
            delay *= 2;
            debug!(
                instance = %instance_id,
                tries,
                max_tries = MAX_TRIES,
                error = %err,
                "recoverable launch error"
            );
        }

        if self.err.is_some() {
            return;
        }
        if cancel.is_cancelled() && state != LaunchState::Done {
            self.err = Some(Error::new(
                ErrorKind::Other,
                state.describe(),
                "launch cancelled",
            ));
            return;
        }
        info!(instance = %instance_id, "instance ready");
    }

    /// Clamp the EBS shape: at least one volume, each member at or
    /// above the per-type minimum size.
    fn clamp_ebs_shape(&mut self) {
        if self.params.n_ebs < 1 {
            self.params.n_ebs = 1;
        }
        if let Some(min) = min_disk_size(&self.params.ebs_type) {
            if self.params.ebs_size_gib < min {
                self.params.ebs_size_gib = min;
            }
            let n_min = (self.params.ebs_size_gib / min) as u32;
            if self.params.n_ebs > n_min {
                self.params.n_ebs = n_min.max(1);
            }
        }
    }

    async fn check_capacity(&self, cancel: &CancellationToken) -> Result<(), Error> {
        const OP: &str = "checking capacity";
        if !self.params.spot || self.params.spot_probe_depth == 0 {
            return Ok(());
        }
        info!(
            instance_type = %self.params.config.instance_type,
            depth = self.params.spot_probe_depth,
            "probing for cloud capacity"
        );
        let req = RunInstancesRequest {
            spec: LaunchSpec {
                image_id: self.params.ami.clone(),
                instance_type: self.params.config.instance_type.clone(),
                subnet_id: String::new(),
                security_group: String::new(),
                instance_profile: String::new(),
                key_name: None,
                user_data: String::new(),
                ebs_optimized: false,
                block_devices: Vec::new(),
            },
            count: self.params.spot_probe_depth,
            dry_run: true,
            client_token: None,
        };
        let probe = tokio::time::timeout(Duration::from_secs(60), self.cloud.run_instances(req));
        let ok = tokio::select! {
            result = probe => match result {
                // An API timeout is a negative answer.
                Err(_elapsed) => false,
                Ok(Ok(_)) => {
                    return Err(Error::new(
                        ErrorKind::Other,
                        OP,
                        "did not expect a successful dry-run response",
                    ));
                }
                Ok(Err(e)) => match e.code() {
                    Some(DRY_RUN_OK_CODE) => true,
                    Some(REQUEST_CANCELED_CODE) => false,
                    _ => return Err(cloud_err(OP, e)),
                },
            },
            _ = cancel.cancelled() => false,
        };
        if !ok {
            return Err(Error::unavailable(OP, "cloud capacity is likely exhausted"));
        }
        Ok(())
    }

    async fn launch(&self, cancel: &CancellationToken) -> Result<String, Error> {
        let user_data = cloudinit::build_user_data(&BootParams {
            registry_login: self.params.registry_login.clone(),
            worker_config_yaml: self.params.worker_config_yaml.clone(),
            ssh_key: self.params.ssh_key.clone(),
            nvme: self.params.config.nvme,
            n_ebs: self.params.n_ebs,
            immortal: self.params.immortal,
            worker_image: self.params.worker_image.clone(),
            trace_agent: self.params.trace_agent.clone(),
            extra: self.params.extra_cloud_config.clone(),
        })?;
        let spec = self.launch_spec(user_data);
        if self.params.spot {
            self.launch_spot(spec, cancel).await
        } else {
            self.launch_on_demand(spec).await
        }
    }

    fn launch_spec(&self, user_data: String) -> LaunchSpec {
        LaunchSpec {
            image_id: self.params.ami.clone(),
            instance_type: self.params.config.instance_type.clone(),
            subnet_id: self.params.subnet.clone(),
            security_group: self.params.security_group.clone(),
            instance_profile: self.params.instance_profile.clone(),
            key_name: self.params.key_name.clone(),
            user_data,
            ebs_optimized: self.params.config.ebs_optimized,
            block_devices: self.block_devices(),
        }
    }

    /// The root device plus the requested data volumes; with several
    /// data volumes each carries an equal share of the total size.
    fn block_devices(&self) -> Vec<BlockDevice> {
        let mut devices = vec![BlockDevice {
            // The root device for the OS and container images.
            device_name: "/dev/xvda".to_string(),
            volume_size_gib: 200,
            volume_type: "gp2".to_string(),
            delete_on_termination: true,
        }];
        for idx in 0..self.params.n_ebs {
            devices.push(BlockDevice {
                device_name: format!("/dev/xvd{}", (b'b' + idx as u8) as char),
                volume_size_gib: self.params.ebs_size_gib / self.params.n_ebs as u64,
                volume_type: self.params.ebs_type.clone(),
                delete_on_termination: true,
            });
        }
        devices
    }

    async fn launch_on_demand(&self, spec: LaunchSpec) -> Result<String, Error> {
        const OP: &str = "launching instance";
        let insts = self
            .cloud
            .run_instances(RunInstancesRequest {
                spec,
                count: 1,
                dry_run: false,
                client_token: Some(new_client_token()),
            })
            .await
            .map_err(|e| cloud_err(OP, e))?;
        if insts.len() != 1 {
            return Err(Error::new(
                ErrorKind::Other,
                OP,
                format!("expected 1 instance, got {}", insts.len()),
            ));
        }
        Ok(insts[0].instance_id.clone())
    }

    async fn launch_spot(
        &self,
        spec: LaunchSpec,
        cancel: &CancellationToken,
    ) -> Result<String, Error> {
        const OP: &str = "launching instance";
        info!(
            instance_type = %spec.instance_type,
            bid = format!("{:.3}", self.params.price),
            "requesting spot instance"
        );
        let request_id = self
            .cloud
            .request_spot_instances(SpotRequest {
                spec,
                spot_price: self.params.price,
                valid_until: Utc::now()
                    + chrono::Duration::seconds(SPOT_REQUEST_VALIDITY.as_secs() as i64),
            })
            .await
            .map_err(|e| cloud_err(OP, e))?;
        if request_id.is_empty() {
            return Err(Error::new(ErrorKind::Other, OP, "empty spot request id"));
        }
        debug!(request = %request_id, "awaiting spot fulfillment");

        // Not fulfilled by the deadline (or failed outright) means
        // spot capacity is unavailable for this type; the caller can
        // pick another.
        let status = match self.wait_spot_fulfillment(&request_id, cancel).await {
            Ok(status) => status,
            Err(e) => {
                return Err(Error::unavailable("waiting for spot fulfillment", e.msg));
            }
        };
        let id = status.instance_id.ok_or_else(|| {
            Error::new(ErrorKind::Other, OP, "fulfilled spot request has no instance id")
        })?;
        info!(request = %request_id, instance = %id, "spot request fulfilled");
        Ok(id)
    }

    async fn wait_spot_fulfillment(
        &self,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> Result<flowgrid_cloud::SpotStatus, Error> {
        const OP: &str = "waiting for spot fulfillment";
        let poll = async {
            loop {
                let status = self
                    .cloud
                    .describe_spot_request(request_id)
                    .await
                    .map_err(|e| cloud_err(OP, e))?;
                match status.status_code.as_str() {
                    "fulfilled" | "request-canceled-and-instance-running" => return Ok(status),
                    "schedule-expired"
                    | "canceled-before-fulfillment"
                    | "bad-parameters"
                    | "system-error" => {
                        return Err(Error::new(
                            ErrorKind::Other,
                            OP,
                            format!("spot request failed: {}", status.status_code),
                        ));
                    }
                    _ => {}
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = cancel.cancelled() => {
                        return Err(Error::new(ErrorKind::Other, OP, "cancelled"));
                    }
                }
            }
        };
        match tokio::time::timeout(self.spot_deadline, poll).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::timeout(OP, "spot request not fulfilled by deadline")),
        }
    }

    async fn tag(&self, instance_id: &str) -> Result<(), Error> {
        const OP: &str = "tagging instance";
        let mut tags = self.params.instance_tags.clone();
        for (k, v) in &self.params.labels {
            tags.insert(k.clone(), v.clone());
        }
        self.cloud
            .create_tags(instance_id, &tags)
            .await
            .map_err(|e| cloud_err(OP, e))
    }

    async fn wait_running(&self, instance_id: &str) -> Result<(), Error> {
        const OP: &str = "waiting for instance";
        for _ in 0..WAIT_RUNNING_MAX_POLLS {
            let inst = self
                .cloud
                .describe_instance(instance_id)
                .await
                .map_err(|e| cloud_err(OP, e))?;
            match inst.lifecycle {
                InstanceLifecycle::Running => return Ok(()),
                InstanceLifecycle::Pending => {}
                state => {
                    return Err(Error::fatal(
                        OP,
                        format!("instance {instance_id} entered {state:?}"),
                    ));
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(Error::timeout(
            OP,
            format!("instance {instance_id} did not reach running state"),
        ))
    }

    async fn describe_dns(&mut self, instance_id: &str) -> Result<String, Error> {
        const OP: &str = "describing instance (dns)";
        let inst = match tokio::time::timeout(
            DESCRIBE_TIMEOUT,
            self.cloud.describe_instance(instance_id),
        )
        .await
        {
            Err(_elapsed) => return Err(Error::timeout(OP, "describe timed out")),
            Ok(Err(e)) => return Err(cloud_err(OP, e)),
            Ok(Ok(inst)) => inst,
        };
        self.instance = Some(inst.clone());
        if inst.public_dns_name.is_empty() {
            return Err(Error::temporary(
                OP,
                format!("{instance_id}: no public DNS name"),
            ));
        }
        Ok(inst.public_dns_name)
    }

    async fn wait_worker(&self, dns: &str) -> Result<(), Error> {
        const OP: &str = "waiting for worker";
        let client = self
            .dialer
            .dial(dns)
            .map_err(|e| Error::fatal(OP, e.to_string()))?;
        match tokio::time::timeout(WORKER_CALL_TIMEOUT, client.config()).await {
            Err(_elapsed) => Err(Error::timeout(OP, "config request timed out")),
            // A refused connection means the worker has not come up
            // yet; retry.
            Ok(Err(e)) if e.kind == ErrorKind::Net => Err(Error::temporary(OP, e.msg)),
            Ok(Err(e)) => Err(e.with_op(OP)),
            Ok(Ok(_)) => Ok(()),
        }
    }

    /// Returns `Ok(true)` when the worker's digest matches the
    /// controller's, `Ok(false)` when an image update is needed.
    async fn describe_tags(&mut self, instance_id: &str) -> Result<bool, Error> {
        const OP: &str = "describing instance (version, digest)";
        let inst = match tokio::time::timeout(
            DESCRIBE_TIMEOUT,
            self.cloud.describe_instance(instance_id),
        )
        .await
        {
            Err(_elapsed) => return Err(Error::temporary(OP, "describe timed out")),
            Ok(Err(e)) => return Err(Error::temporary(OP, e.to_string())),
            Ok(Ok(inst)) => inst,
        };
        let worker = WorkerInstance::of(&inst);
        self.instance = Some(inst);
        if worker.version.is_empty() || worker.digest.is_empty() {
            return Err(Error::temporary(OP, "version/digest unavailable"));
        }
        let local = self.image.digest().await?;
        let remote = Digest::parse(&worker.digest)
            .map_err(|e| Error::fatal(OP, format!("parse remote digest: {e}")))?;
        if remote == local {
            Ok(true)
        } else {
            debug!(
                instance = %instance_id,
                remote = %remote.short(),
                local = %local.short(),
                "worker image needs update"
            );
            Ok(false)
        }
    }

    async fn update_image(&self, dns: &str) -> Result<(), Error> {
        const OP: &str = "updating worker image";
        info!(dns = %dns, "updating worker image");
        let client = self
            .dialer
            .dial(dns)
            .map_err(|e| Error::fatal(OP, e.to_string()))?;
        match tokio::time::timeout(IMAGE_UPLOAD_TIMEOUT, self.image.upload(&self.repo)).await {
            Err(_elapsed) => return Err(Error::fatal(OP, "image upload timed out")),
            Ok(Err(e)) => return Err(Error::fatal(OP, e.to_string())),
            Ok(Ok(())) => {}
        }
        let local = self.image.digest().await?;
        match tokio::time::timeout(WORKER_CALL_TIMEOUT, client.install_image(&local)).await {
            Err(_elapsed) => return Err(Error::fatal(OP, "install request timed out")),
            // The worker tears the connection down while restarting
            // into the new image; that is the expected outcome.
            Ok(Err(e)) if e.kind == ErrorKind::Net => {
                debug!(dns = %dns, "install connection dropped; worker restarting");
            }
            Ok(Err(e)) => return Err(Error::fatal(OP, e.to_string())),
            Ok(Ok(())) => {}
        }
        Ok(())
    }
}

/// Reclassify provider errors: capacity-exhaustion codes become
/// `Unavailable`, everything else stays unclassified and consumes the
/// retry budget.
fn cloud_err(op: &str, e: CloudError) -> Error {
    if let Some(code) = e.code() {
        if CAPACITY_ERROR_CODES.contains(&code) {
            return Error::unavailable(op, e.to_string());
        }
    }
    Error::new(ErrorKind::Other, op, e.to_string())
}

/// A fresh idempotency token for run-instances.
fn new_client_token() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use flowgrid_cloud::testing::TestCloud;

    use crate::testing::{test_repo, ScriptedDialer, ScriptedWorker};

    const IMAGE: &[u8] = b"worker-image-v2";
    const STALE_IMAGE: &[u8] = b"worker-image-v1";

    fn test_config() -> InstanceConfig {
        InstanceConfig::from_type(
            crate::catalog::TYPES
                .iter()
                .find(|t| t.name == "m4.xlarge")
                .unwrap(),
        )
    }

    fn params() -> LaunchParams {
        LaunchParams {
            config: test_config(),
            region: "us-east-1".to_string(),
            spot: false,
            spot_probe_depth: 0,
            price: 0.20,
            ami: "ami-12345678".to_string(),
            subnet: "subnet-1".to_string(),
            security_group: "sg-1".to_string(),
            instance_profile: "arn:profile".to_string(),
            key_name: None,
            instance_tags: Labels::new(),
            labels: Labels::new(),
            ebs_type: "gp2".to_string(),
            ebs_size_gib: 400,
            n_ebs: 1,
            immortal: false,
            registry_login: "docker login registry".to_string(),
            worker_config_yaml: "cluster: elastic\nuser: test\n".to_string(),
            ssh_key: None,
            worker_image: "registry/flowgrid:test".to_string(),
            trace_agent: None,
            extra_cloud_config: None,
        }
    }

    struct Fixture {
        cloud: Arc<TestCloud>,
        worker: Arc<ScriptedWorker>,
        driver: LaunchDriver,
        repo: Arc<dyn Repository>,
    }

    /// A fixture whose cloud boots instances already tagged with the
    /// digest of `boot_image`.
    fn fixture(boot_image: &[u8], params: LaunchParams) -> Fixture {
        let cloud = Arc::new(TestCloud::new());
        let mut tags = BTreeMap::new();
        tags.insert(VERSION_TAG.to_string(), "0.3.0".to_string());
        tags.insert(
            DIGEST_TAG.to_string(),
            Digest::from_bytes(boot_image).to_string(),
        );
        cloud.set_boot_tags(tags);

        let worker = ScriptedWorker::new(Arc::clone(&cloud));
        let repo: Arc<dyn Repository> = test_repo();
        let driver = LaunchDriver::new(
            Arc::clone(&cloud) as Arc<dyn CloudApi>,
            Arc::clone(&repo),
            Arc::new(ScriptedDialer::new(Arc::clone(&worker))),
            WorkerImage::new(Bytes::from_static(IMAGE)),
            params,
        )
        .with_backoff(Duration::from_millis(1))
        .with_poll_interval(Duration::from_millis(1))
        .with_spot_deadline(Duration::from_millis(100));
        Fixture {
            cloud,
            worker,
            driver,
            repo,
        }
    }

    #[tokio::test]
    async fn on_demand_launch_reaches_done() {
        let mut f = fixture(IMAGE, params());
        f.driver.go(&CancellationToken::new()).await;

        assert!(f.driver.err().is_none(), "err: {:?}", f.driver.err());
        let inst = f.driver.instance().unwrap();
        assert!(!inst.version.is_empty());
        assert_eq!(inst.digest, Digest::from_bytes(IMAGE).to_string());
        assert!(!inst.public_dns.is_empty());

        let calls = f.cloud.calls();
        assert!(calls.iter().any(|c| c.starts_with("run_instances")));
        assert!(calls.iter().any(|c| c.starts_with("create_tags")));
    }

    #[tokio::test]
    async fn image_self_update_cycles_back_to_wait_worker() {
        // The worker boots with a stale image; the controller's local
        // digest differs, forcing upload + install + re-verify.
        let mut f = fixture(STALE_IMAGE, params());
        f.driver.go(&CancellationToken::new()).await;

        assert!(f.driver.err().is_none(), "err: {:?}", f.driver.err());
        let inst = f.driver.instance().unwrap();
        let want = Digest::from_bytes(IMAGE);
        assert_eq!(inst.digest, want.to_string());
        // The image was uploaded to the shared repository and the
        // worker was told to install it.
        assert!(f.repo.contains(&want).await.unwrap());
        assert_eq!(f.worker.installed(), Some(want));
    }

    #[tokio::test]
    async fn upload_happens_once_across_drivers() {
        let image = WorkerImage::new(Bytes::from_static(IMAGE));
        let repo: Arc<dyn Repository> = test_repo();
        image.upload(&repo).await.unwrap();
        image.upload(&repo).await.unwrap();
        // Memoized: the second call is a no-op even though the object
        // already exists.
        assert!(repo.contains(&Digest::from_bytes(IMAGE)).await.unwrap());
    }

    #[tokio::test]
    async fn spot_launch_waits_for_fulfillment() {
        let mut p = params();
        p.spot = true;
        let mut f = fixture(IMAGE, p);
        f.cloud.set_spot_codes(&["pending-evaluation", "fulfilled"]);
        f.driver.go(&CancellationToken::new()).await;

        assert!(f.driver.err().is_none(), "err: {:?}", f.driver.err());
        assert!(f
            .cloud
            .calls()
            .iter()
            .any(|c| c.starts_with("request_spot_instances")));
    }

    #[tokio::test]
    async fn spot_fulfillment_deadline_is_unavailable() {
        let mut p = params();
        p.spot = true;
        let mut f = fixture(IMAGE, p);
        f.cloud.set_spot_codes(&["pending-evaluation"]);
        f.driver.go(&CancellationToken::new()).await;

        let err = f.driver.err().unwrap();
        assert_eq!(err.kind, ErrorKind::Unavailable, "got: {err}");
    }

    #[tokio::test]
    async fn spot_terminal_failure_is_unavailable() {
        let mut p = params();
        p.spot = true;
        let mut f = fixture(IMAGE, p);
        f.cloud.set_spot_codes(&["bad-parameters"]);
        f.driver.go(&CancellationToken::new()).await;

        let err = f.driver.err().unwrap();
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert!(err.to_string().contains("bad-parameters"));
    }

    #[tokio::test]
    async fn capacity_probe_failure_is_unavailable() {
        let mut p = params();
        p.spot = true;
        p.spot_probe_depth = 20;
        let mut f = fixture(IMAGE, p);
        f.cloud.set_dry_run_code(Some("RequestCanceled"));
        f.driver.go(&CancellationToken::new()).await;

        let err = f.driver.err().unwrap();
        assert_eq!(err.kind, ErrorKind::Unavailable);
        // The probe failed before anything launched.
        assert_eq!(f.cloud.calls().len(), 1);
    }

    #[tokio::test]
    async fn capacity_probe_success_proceeds_to_launch() {
        let mut p = params();
        p.spot = true;
        p.spot_probe_depth = 20;
        let mut f = fixture(IMAGE, p);
        f.driver.go(&CancellationToken::new()).await;
        assert!(f.driver.err().is_none(), "err: {:?}", f.driver.err());
    }

    #[tokio::test]
    async fn capacity_exhaustion_codes_reclassify_to_unavailable() {
        let mut f = fixture(IMAGE, params());
        f.cloud.fail_launches_of(
            "m4.xlarge",
            CloudError::new("InsufficientInstanceCapacity", "no capacity"),
        );
        f.driver.go(&CancellationToken::new()).await;

        let err = f.driver.err().unwrap();
        assert_eq!(err.kind, ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn temporary_worker_failures_retry_until_live() {
        let mut f = fixture(IMAGE, params());
        f.worker.fail_configs(2);
        f.driver.go(&CancellationToken::new()).await;
        assert!(f.driver.err().is_none(), "err: {:?}", f.driver.err());
    }

    #[tokio::test]
    async fn retries_exhaust_after_max_tries() {
        let mut f = fixture(IMAGE, params());
        f.worker.fail_configs(100);
        f.driver.go(&CancellationToken::new()).await;

        let err = f.driver.err().unwrap();
        assert_eq!(err.kind, ErrorKind::Temporary);
        assert_eq!(err.op, "waiting for worker");
    }

    #[tokio::test]
    async fn empty_dns_is_temporary() {
        let mut f = fixture(IMAGE, params());
        f.cloud.set_dns_name("");
        f.driver.go(&CancellationToken::new()).await;

        let err = f.driver.err().unwrap();
        assert_eq!(err.kind, ErrorKind::Temporary);
        assert_eq!(err.op, "describing instance (dns)");
    }

    #[tokio::test]
    async fn cancellation_surfaces_as_error() {
        let mut f = fixture(IMAGE, params());
        let cancel = CancellationToken::new();
        cancel.cancel();
        f.driver.go(&cancel).await;
        let err = f.driver.err().unwrap();
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn ebs_shape_is_clamped_to_minimum_sizes() {
        let cloud = Arc::new(TestCloud::new());
        let worker = ScriptedWorker::new(Arc::clone(&cloud));
        let mut p = params();
        p.ebs_type = "st1".to_string();
        p.ebs_size_gib = 100; // below the 500 GiB st1 floor
        p.n_ebs = 4;
        let mut driver = LaunchDriver::new(
            cloud as Arc<dyn CloudApi>,
            test_repo(),
            Arc::new(ScriptedDialer::new(worker)),
            WorkerImage::new(Bytes::from_static(IMAGE)),
            p,
        );
        driver.clamp_ebs_shape();
        assert_eq!(driver.params.ebs_size_gib, 500);
        // 500 GiB cannot be split into four st1 volumes of 500 GiB.
        assert_eq!(driver.params.n_ebs, 1);
    }
}
