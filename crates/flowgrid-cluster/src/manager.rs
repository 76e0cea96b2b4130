//! The cluster manager: request admission, pool composition, and
//! terminated-instance reaping.
//!
//! `allocate` turns one resource request into a live worker endpoint.
//! Selection failures are terminal (`Unavailable`); launch-time
//! capacity failures mark the type in the selector and retry with the
//! next choice, up to a bounded number of attempts. Workers
//! self-terminate after ten idle minutes; the reaper observes
//! terminations through the cloud API and prunes the pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use flow_core::{Error, Labels, Repository, Resources};
use flowgrid_cloud::{CloudApi, InstanceLifecycle};
use flowgrid_worker::WorkerDialer;

use crate::cloudinit::{CloudConfig, TraceAgent};
use crate::launcher::{LaunchDriver, LaunchParams, WorkerImage};
use crate::selector::SelectorState;

/// How a type is chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// The largest satisfying type (headroom for packing).
    Largest,
    /// The cheapest satisfying type, EBS-throughput adjusted.
    Cheapest,
}

/// Site configuration shared by every launch.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub region: String,
    pub ami: String,
    pub subnet: String,
    pub security_group: String,
    pub instance_profile: String,
    pub key_name: Option<String>,
    pub spot: bool,
    pub spot_probe_depth: u32,
    pub ebs_type: String,
    pub ebs_size_gib: u64,
    pub n_ebs: u32,
    pub immortal: bool,
    pub instance_tags: Labels,
    pub labels: Labels,
    pub registry_login: String,
    pub worker_config_yaml: String,
    pub ssh_key: Option<String>,
    pub worker_image: String,
    pub trace_agent: Option<TraceAgent>,
    pub extra_cloud_config: Option<CloudConfig>,
    pub policy: SelectionPolicy,
    /// Selection retries after `Unavailable` launches.
    pub max_launch_attempts: u32,
}

/// A live pool entry.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerHandle {
    pub instance_id: String,
    pub public_dns: String,
    pub instance_type: String,
    pub resources: Resources,
}

/// Admits resource requests and maintains the worker pool.
pub struct ClusterManager {
    cloud: Arc<dyn CloudApi>,
    repo: Arc<dyn Repository>,
    dialer: Arc<dyn WorkerDialer>,
    image: Arc<WorkerImage>,
    selector: Arc<SelectorState>,
    config: ClusterConfig,
    workers: RwLock<HashMap<String, WorkerHandle>>,

    launch_backoff: Duration,
    launch_poll: Duration,
}

impl ClusterManager {
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        repo: Arc<dyn Repository>,
        dialer: Arc<dyn WorkerDialer>,
        image: Arc<WorkerImage>,
        selector: Arc<SelectorState>,
        config: ClusterConfig,
    ) -> Self {
        ClusterManager {
            cloud,
            repo,
            dialer,
            image,
            selector,
            config,
            workers: RwLock::new(HashMap::new()),
            launch_backoff: Duration::from_secs(5),
            launch_poll: Duration::from_secs(15),
        }
    }

    /// Tune launch retry pacing (tests use millisecond scales).
    pub fn with_launch_pacing(mut self, backoff: Duration, poll: Duration) -> Self {
        self.launch_backoff = backoff;
        self.launch_poll = poll;
        self
    }

    pub fn selector(&self) -> &SelectorState {
        &self.selector
    }

    /// Satisfy one resource request with a live worker endpoint.
    pub async fn allocate(
        &self,
        need: &Resources,
        cancel: &CancellationToken,
    ) -> Result<WorkerHandle, Error> {
        const OP: &str = "allocating worker";
        if !self.selector.available(need) {
            return Err(Error::unavailable(
                OP,
                format!("no instance type can satisfy {need}"),
            ));
        }
        for attempt in 0..self.config.max_launch_attempts.max(1) {
            let picked = match self.config.policy {
                SelectionPolicy::Largest => self.selector.max_available(need, self.config.spot),
                SelectionPolicy::Cheapest => self.selector.min_available(need, self.config.spot),
            };
            let Some(config) = picked else {
                return Err(Error::unavailable(OP, "no available instance type"));
            };
            let price = config
                .price
                .get(&self.config.region)
                .copied()
                .unwrap_or_default();

            let mut driver = LaunchDriver::new(
                Arc::clone(&self.cloud),
                Arc::clone(&self.repo),
                Arc::clone(&self.dialer),
                Arc::clone(&self.image),
                LaunchParams {
                    config: config.clone(),
                    region: self.config.region.clone(),
                    spot: self.config.spot,
                    spot_probe_depth: self.config.spot_probe_depth,
                    price,
                    ami: self.config.ami.clone(),
                    subnet: self.config.subnet.clone(),
                    security_group: self.config.security_group.clone(),
                    instance_profile: self.config.instance_profile.clone(),
                    key_name: self.config.key_name.clone(),
                    instance_tags: self.config.instance_tags.clone(),
                    labels: self.config.labels.clone(),
                    ebs_type: self.config.ebs_type.clone(),
                    ebs_size_gib: self.config.ebs_size_gib,
                    n_ebs: self.config.n_ebs,
                    immortal: self.config.immortal,
                    registry_login: self.config.registry_login.clone(),
                    worker_config_yaml: self.config.worker_config_yaml.clone(),
                    ssh_key: self.config.ssh_key.clone(),
                    worker_image: self.config.worker_image.clone(),
                    trace_agent: self.config.trace_agent.clone(),
                    extra_cloud_config: self.config.extra_cloud_config.clone(),
                },
            )
            .with_backoff(self.launch_backoff)
            .with_poll_interval(self.launch_poll);

            driver.go(cancel).await;
            match driver.err() {
                None => {
                    let Some(instance) = driver.instance() else {
                        return Err(Error::fatal(OP, "successful launch reported no instance"));
                    };
                    let handle = WorkerHandle {
                        instance_id: instance.instance_id.clone(),
                        public_dns: instance.public_dns.clone(),
                        instance_type: config.instance_type.clone(),
                        resources: config.resources.clone(),
                    };
                    self.workers
                        .write()
                        .await
                        .insert(handle.instance_id.clone(), handle.clone());
                    info!(
                        instance = %handle.instance_id,
                        instance_type = %handle.instance_type,
                        dns = %handle.public_dns,
                        "worker allocated"
                    );
                    return Ok(handle);
                }
                Some(e) if e.is(flow_core::ErrorKind::Unavailable) => {
                    warn!(
                        instance_type = %config.instance_type,
                        attempt,
                        error = %e,
                        "instance type unavailable; marking and retrying selection"
                    );
                    self.selector.mark_unavailable(&config);
                    continue;
                }
                Some(e) => return Err(e.clone()),
            }
        }
        Err(Error::unavailable(OP, "exhausted launch attempts"))
    }

    /// The current pool.
    pub async fn workers(&self) -> Vec<WorkerHandle> {
        self.workers.read().await.values().cloned().collect()
    }

    /// Drop pool entries whose instances the cloud no longer reports
    /// running (workers self-terminate after ten idle minutes).
    /// Returns how many entries were removed.
    pub async fn reap(&self) -> usize {
        let ids: Vec<String> = self.workers.read().await.keys().cloned().collect();
        let mut dead = Vec::new();
        for id in ids {
            match self.cloud.describe_instance(&id).await {
                Ok(inst) => {
                    if !matches!(
                        inst.lifecycle,
                        InstanceLifecycle::Running | InstanceLifecycle::Pending
                    ) {
                        dead.push(id);
                    }
                }
                Err(e) => {
                    // An unknown instance is gone.
                    warn!(instance = %id, error = %e, "describe failed during reap");
                    dead.push(id);
                }
            }
        }
        let mut workers = self.workers.write().await;
        let mut removed = 0;
        for id in dead {
            if workers.remove(&id).is_some() {
                info!(instance = %id, "terminated worker pruned from pool");
                removed += 1;
            }
        }
        removed
    }

    /// Run the reaper until shutdown.
    pub async fn run_reaper(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    self.reap().await;
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use bytes::Bytes;

    use flow_core::resources::GIB;
    use flow_core::Digest;
    use flowgrid_cloud::testing::TestCloud;
    use flowgrid_cloud::CloudError;
    use flowgrid_worker::{DIGEST_TAG, VERSION_TAG};

    use crate::catalog::configs;
    use crate::testing::{test_repo, ScriptedDialer, ScriptedWorker};

    const IMAGE: &[u8] = b"controller-image";

    fn cluster_config() -> ClusterConfig {
        ClusterConfig {
            region: "us-east-1".to_string(),
            ami: "ami-12345678".to_string(),
            subnet: "subnet-1".to_string(),
            security_group: "sg-1".to_string(),
            instance_profile: "arn:profile".to_string(),
            key_name: None,
            spot: false,
            spot_probe_depth: 0,
            ebs_type: "gp2".to_string(),
            ebs_size_gib: 400,
            n_ebs: 1,
            immortal: false,
            instance_tags: Labels::new(),
            labels: Labels::new(),
            registry_login: "docker login registry".to_string(),
            worker_config_yaml: "cluster: elastic\n".to_string(),
            ssh_key: None,
            worker_image: "registry/flowgrid:test".to_string(),
            trace_agent: None,
            extra_cloud_config: None,
            policy: SelectionPolicy::Cheapest,
            max_launch_attempts: 5,
        }
    }

    fn manager(cloud: Arc<TestCloud>, config: ClusterConfig) -> ClusterManager {
        let mut tags = BTreeMap::new();
        tags.insert(VERSION_TAG.to_string(), "0.3.0".to_string());
        tags.insert(DIGEST_TAG.to_string(), Digest::from_bytes(IMAGE).to_string());
        cloud.set_boot_tags(tags);

        let worker = ScriptedWorker::new(Arc::clone(&cloud));
        let selector = Arc::new(SelectorState::new(
            configs(),
            Duration::from_secs(60),
            "us-east-1",
        ));
        ClusterManager::new(
            cloud as Arc<dyn CloudApi>,
            test_repo(),
            Arc::new(ScriptedDialer::new(worker)),
            WorkerImage::new(Bytes::from_static(IMAGE)),
            selector,
            config,
        )
        .with_launch_pacing(Duration::from_millis(1), Duration::from_millis(1))
    }

    fn need(cpu: f64, mem_gib: f64) -> Resources {
        Resources::with_cpu_mem(cpu, mem_gib * GIB)
    }

    #[tokio::test]
    async fn allocate_publishes_a_live_endpoint() {
        let cloud = Arc::new(TestCloud::new());
        let m = manager(Arc::clone(&cloud), cluster_config());

        let handle = m
            .allocate(&need(2.0, 8.0), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!handle.public_dns.is_empty());
        assert!(handle.resources.available(&need(2.0, 8.0)));
        assert_eq!(m.workers().await.len(), 1);
    }

    #[tokio::test]
    async fn allocate_retries_with_a_different_type_on_capacity_failure() {
        let cloud = Arc::new(TestCloud::new());
        let m = manager(Arc::clone(&cloud), cluster_config());

        // Find what the cheapest choice would be and exhaust it.
        let first = m
            .selector()
            .min_available(&need(2.0, 8.0), false)
            .unwrap();
        cloud.fail_launches_of(
            &first.instance_type,
            CloudError::new("InsufficientInstanceCapacity", "no capacity"),
        );

        let handle = m
            .allocate(&need(2.0, 8.0), &CancellationToken::new())
            .await
            .unwrap();
        assert_ne!(handle.instance_type, first.instance_type);
        // The failing type is now marked unavailable in the selector.
        assert!(m.selector().type_named(&first.instance_type).is_none());
    }

    #[tokio::test]
    async fn allocate_fails_when_no_type_satisfies() {
        let cloud = Arc::new(TestCloud::new());
        let m = manager(cloud, cluster_config());

        let err = m
            .allocate(&need(1024.0, 8192.0), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is(flow_core::ErrorKind::Unavailable));
        assert!(m.workers().await.is_empty());
    }

    #[tokio::test]
    async fn largest_policy_allocates_bigger_workers() {
        let cloud = Arc::new(TestCloud::new());
        let mut config = cluster_config();
        config.policy = SelectionPolicy::Largest;
        let m = manager(Arc::clone(&cloud), config);

        let handle = m
            .allocate(&need(2.0, 8.0), &CancellationToken::new())
            .await
            .unwrap();
        // The largest catalog entry by scaled distance wins.
        assert_eq!(handle.instance_type, "m4.16xlarge");
    }

    #[tokio::test]
    async fn reap_prunes_terminated_instances() {
        let cloud = Arc::new(TestCloud::new());
        let m = manager(Arc::clone(&cloud), cluster_config());

        let a = m
            .allocate(&need(2.0, 8.0), &CancellationToken::new())
            .await
            .unwrap();
        let b = m
            .allocate(&need(2.0, 8.0), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(m.workers().await.len(), 2);

        // One worker goes idle and powers itself off.
        cloud.terminate(&a.instance_id);
        let removed = m.reap().await;
        assert_eq!(removed, 1);

        let left = m.workers().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].instance_id, b.instance_id);
    }
}
