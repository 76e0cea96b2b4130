//! A programmable in-memory [`CloudApi`] double.
//!
//! `TestCloud` records every call and lets tests script failures,
//! spot-request status sequences and instance state. It is used by
//! the launch-driver and cluster-manager tests in sibling crates,
//! which is why it lives in the crate proper rather than under
//! `#[cfg(test)]`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::api::{
    CloudApi, CloudError, CloudInstance, InstanceLifecycle, RunInstancesRequest, SpotRequest,
    SpotStatus,
};
use crate::DRY_RUN_OK_CODE;

#[derive(Default)]
struct Inner {
    next_instance: u32,
    next_spot: u32,
    instances: BTreeMap<String, CloudInstance>,
    spot_requests: BTreeMap<String, SpotState>,
    calls: Vec<String>,

    /// Code returned by dry-run probes. Defaults to a successful probe.
    dry_run_code: Option<String>,
    /// Error injected into non-dry-run launches, keyed by instance type.
    launch_errors: BTreeMap<String, CloudError>,
    /// Status codes handed out by successive spot describes; the last
    /// entry repeats.
    spot_codes: Vec<String>,
    /// Tags stamped onto every new instance (simulates the worker
    /// tagging itself during bring-up).
    boot_tags: BTreeMap<String, String>,
    /// Number of describes an instance reports `pending` before
    /// transitioning to `running`.
    pending_describes: u32,
    /// DNS name assigned to launched instances. Empty simulates a
    /// provider that has not yet published one.
    dns_name: String,
}

struct SpotState {
    instance_type: String,
    describes: u32,
    instance_id: Option<String>,
}

/// In-memory scripted cloud.
pub struct TestCloud {
    inner: Mutex<Inner>,
}

impl Default for TestCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCloud {
    pub fn new() -> Self {
        TestCloud {
            inner: Mutex::new(Inner {
                dns_name: "worker-1.test.internal".to_string(),
                spot_codes: vec!["fulfilled".to_string()],
                ..Inner::default()
            }),
        }
    }

    /// Script the code dry-run probes answer with (`None` makes the
    /// probe return success, which callers treat as a protocol error).
    pub fn set_dry_run_code(&self, code: Option<&str>) {
        self.inner.lock().unwrap().dry_run_code = code.map(String::from);
    }

    /// Inject a launch error for a specific instance type.
    pub fn fail_launches_of(&self, instance_type: &str, err: CloudError) {
        self.inner
            .lock()
            .unwrap()
            .launch_errors
            .insert(instance_type.to_string(), err);
    }

    /// Script the sequence of spot status codes returned by
    /// successive describes (last repeats).
    pub fn set_spot_codes(&self, codes: &[&str]) {
        self.inner.lock().unwrap().spot_codes = codes.iter().map(|s| s.to_string()).collect();
    }

    /// Tags stamped onto every instance at creation.
    pub fn set_boot_tags(&self, tags: BTreeMap<String, String>) {
        self.inner.lock().unwrap().boot_tags = tags;
    }

    /// Overwrite one tag on a live instance.
    pub fn set_instance_tag(&self, instance_id: &str, key: &str, value: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(inst) = inner.instances.get_mut(instance_id) {
            inst.tags.insert(key.to_string(), value.to_string());
        }
    }

    /// Overwrite one tag on every live instance.
    pub fn set_all_instances_tag(&self, key: &str, value: &str) {
        let mut inner = self.inner.lock().unwrap();
        for inst in inner.instances.values_mut() {
            inst.tags.insert(key.to_string(), value.to_string());
        }
    }

    pub fn set_pending_describes(&self, n: u32) {
        self.inner.lock().unwrap().pending_describes = n;
    }

    pub fn set_dns_name(&self, dns: &str) {
        self.inner.lock().unwrap().dns_name = dns.to_string();
    }

    /// Mark an instance terminated (as the provider would after the
    /// worker powers itself off).
    pub fn terminate(&self, instance_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(inst) = inner.instances.get_mut(instance_id) {
            inst.lifecycle = InstanceLifecycle::Terminated;
        }
    }

    /// The recorded call log.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn instance(&self, instance_id: &str) -> Option<CloudInstance> {
        self.inner.lock().unwrap().instances.get(instance_id).cloned()
    }

    fn new_instance(inner: &mut Inner, instance_type: &str) -> CloudInstance {
        inner.next_instance += 1;
        let id = format!("i-{:08x}", inner.next_instance);
        let inst = CloudInstance {
            instance_id: id.clone(),
            instance_type: instance_type.to_string(),
            public_dns_name: inner.dns_name.clone(),
            lifecycle: if inner.pending_describes == 0 {
                InstanceLifecycle::Running
            } else {
                InstanceLifecycle::Pending
            },
            tags: inner.boot_tags.clone(),
        };
        inner.instances.insert(id, inst.clone());
        inst
    }
}

#[async_trait]
impl CloudApi for TestCloud {
    async fn run_instances(
        &self,
        req: RunInstancesRequest,
    ) -> Result<Vec<CloudInstance>, CloudError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!(
            "run_instances(type={}, count={}, dry_run={})",
            req.spec.instance_type, req.count, req.dry_run
        ));
        if req.dry_run {
            return match &inner.dry_run_code {
                Some(code) => Err(CloudError::new(code.clone(), "dry run")),
                None => Ok(Vec::new()),
            };
        }
        if let Some(err) = inner.launch_errors.get(&req.spec.instance_type) {
            return Err(err.clone());
        }
        let insts = (0..req.count)
            .map(|_| Self::new_instance(&mut inner, &req.spec.instance_type))
            .collect();
        Ok(insts)
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<CloudInstance, CloudError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("describe_instance({instance_id})"));
        if inner.pending_describes > 0 {
            inner.pending_describes -= 1;
            if inner.pending_describes == 0 {
                if let Some(inst) = inner.instances.get_mut(instance_id) {
                    inst.lifecycle = InstanceLifecycle::Running;
                }
            }
        }
        inner
            .instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| CloudError::new("InvalidInstanceID.NotFound", instance_id))
    }

    async fn request_spot_instances(&self, req: SpotRequest) -> Result<String, CloudError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!(
            "request_spot_instances(type={}, price={:.3})",
            req.spec.instance_type, req.spot_price
        ));
        if let Some(err) = inner.launch_errors.get(&req.spec.instance_type) {
            return Err(err.clone());
        }
        inner.next_spot += 1;
        let id = format!("sir-{:06x}", inner.next_spot);
        inner.spot_requests.insert(
            id.clone(),
            SpotState {
                instance_type: req.spec.instance_type.clone(),
                describes: 0,
                instance_id: None,
            },
        );
        Ok(id)
    }

    async fn describe_spot_request(&self, request_id: &str) -> Result<SpotStatus, CloudError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .calls
            .push(format!("describe_spot_request({request_id})"));
        let codes = inner.spot_codes.clone();
        let state = inner
            .spot_requests
            .get_mut(request_id)
            .ok_or_else(|| CloudError::new("InvalidSpotInstanceRequestID.NotFound", request_id))?;
        let idx = (state.describes as usize).min(codes.len().saturating_sub(1));
        state.describes += 1;
        let code = codes
            .get(idx)
            .cloned()
            .unwrap_or_else(|| "pending-evaluation".to_string());
        let fulfilled = code == "fulfilled" || code == "request-canceled-and-instance-running";
        let instance_type = state.instance_type.clone();
        if fulfilled && state.instance_id.is_none() {
            let inst = Self::new_instance(&mut inner, &instance_type);
            // Re-borrow: new_instance required exclusive access to inner.
            inner
                .spot_requests
                .get_mut(request_id)
                .expect("spot request vanished")
                .instance_id = Some(inst.instance_id);
        }
        let state = &inner.spot_requests[request_id];
        Ok(SpotStatus {
            request_id: request_id.to_string(),
            status_code: code,
            instance_id: state.instance_id.clone(),
        })
    }

    async fn create_tags(
        &self,
        instance_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), CloudError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("create_tags({instance_id})"));
        let inst = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| CloudError::new("InvalidInstanceID.NotFound", instance_id))?;
        for (k, v) in tags {
            inst.tags.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), CloudError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .calls
            .push(format!("terminate_instances({})", instance_ids.join(",")));
        for id in instance_ids {
            if let Some(inst) = inner.instances.get_mut(id) {
                inst.lifecycle = InstanceLifecycle::Terminated;
            }
        }
        Ok(())
    }
}

/// Convenience: the canonical successful dry-run error.
pub fn dry_run_ok() -> CloudError {
    CloudError::new(DRY_RUN_OK_CODE, "dry run would have succeeded")
}
