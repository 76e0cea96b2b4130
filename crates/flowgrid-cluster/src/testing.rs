//! Scripted doubles shared by the launcher and manager tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use flow_core::{Digest, Error, Repository};
use flowgrid_cloud::testing::TestCloud;
use flowgrid_worker::{WorkerApi, WorkerDialer, DIGEST_TAG};

/// A worker whose behavior tests script: failing config probes, and
/// image installs that re-tag the cloud instance the way a restarted
/// worker would.
pub(crate) struct ScriptedWorker {
    cloud: Arc<TestCloud>,
    config_failures: Mutex<u32>,
    installed: Mutex<Option<Digest>>,
}

impl ScriptedWorker {
    pub fn new(cloud: Arc<TestCloud>) -> Arc<Self> {
        Arc::new(ScriptedWorker {
            cloud,
            config_failures: Mutex::new(0),
            installed: Mutex::new(None),
        })
    }

    /// Fail the next `n` config calls with a refused connection.
    pub fn fail_configs(&self, n: u32) {
        *self.config_failures.lock().unwrap() = n;
    }

    /// The digest most recently installed, if any.
    pub fn installed(&self) -> Option<Digest> {
        self.installed.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerApi for ScriptedWorker {
    async fn config(&self) -> Result<Bytes, Error> {
        {
            let mut failures = self.config_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::net("worker config", "connection refused"));
            }
        }
        Ok(Bytes::from_static(b"cluster: none\n"))
    }

    async fn exec_image(&self) -> Result<Digest, Error> {
        Ok(self
            .installed
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Digest::from_str_content("boot-image")))
    }

    async fn install_image(&self, digest: &Digest) -> Result<(), Error> {
        *self.installed.lock().unwrap() = Some(digest.clone());
        // A restarted worker re-tags its instance with the digest it
        // now runs.
        self.cloud
            .set_all_instances_tag(DIGEST_TAG, &digest.to_string());
        Ok(())
    }
}

/// Hands out the same scripted worker for every DNS name.
pub(crate) struct ScriptedDialer {
    worker: Arc<ScriptedWorker>,
}

impl ScriptedDialer {
    pub fn new(worker: Arc<ScriptedWorker>) -> Self {
        ScriptedDialer { worker }
    }
}

impl WorkerDialer for ScriptedDialer {
    fn dial(&self, _dns: &str) -> Result<Arc<dyn WorkerApi>, Error> {
        Ok(Arc::clone(&self.worker) as Arc<dyn WorkerApi>)
    }
}

/// An in-memory repository.
#[derive(Default)]
pub(crate) struct MemRepository {
    objects: Mutex<BTreeMap<Digest, Bytes>>,
}

#[async_trait]
impl Repository for MemRepository {
    async fn contains(&self, id: &Digest) -> Result<bool, Error> {
        Ok(self.objects.lock().unwrap().contains_key(id))
    }

    async fn get(&self, id: &Digest) -> Result<Bytes, Error> {
        self.objects
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_exist("repository get", id.to_string()))
    }

    async fn put(&self, data: Bytes) -> Result<Digest, Error> {
        let id = Digest::from_bytes(&data);
        self.objects.lock().unwrap().insert(id.clone(), data);
        Ok(id)
    }
}

pub(crate) fn test_repo() -> Arc<dyn Repository> {
    Arc::new(MemRepository::default())
}
