//! The intern/extern transfer executor.
//!
//! An intern run resolves the configured URL to either a single
//! object (result keyed `"."`) or a key listing, skips keys whose
//! content digest is already in the repository, streams the rest into
//! the staging repository, and reports a fileset binding each entry
//! to its content digest and provenance assertions. On success the
//! caller promotes the staging contents into the main repository in
//! one batch.
//!
//! An extern run writes each input fileset entry to its destination
//! key; a single-file fileset writes to the exact configured key with
//! no path joining.
//!
//! Any entry failure aborts the whole transfer. Intern discards the
//! staging area; extern leaves partial blob writes behind, which is
//! acceptable because destination keys are re-derived on retry.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use flow_core::fileset::SINGLE_KEY;
use flow_core::{Assertions, Error, ErrorKind, File, Fileset, Repository};

use crate::filerepo::FileRepository;
use crate::rate::{transferred_bytes, RateExporter};
use crate::store::{BlobObject, BlobUrl, Bucket, Mux};

/// Default bound on concurrent per-entry transfers.
const DEFAULT_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Blob store → repository.
    Intern,
    /// Repository → blob store.
    Extern,
}

/// Configuration for one transfer.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub kind: TransferKind,
    /// `scheme://bucket/prefix` (or exact key).
    pub url: String,
    /// The fileset to export (extern only).
    pub input: Option<Fileset>,
}

/// A single transfer execution.
pub struct BlobExec {
    mux: Mux,
    repo: Arc<FileRepository>,
    staging: Arc<FileRepository>,
    config: TransferConfig,
    limit: usize,
    exporter: Arc<RateExporter>,
}

impl BlobExec {
    pub fn new(
        mux: Mux,
        repo: Arc<FileRepository>,
        staging: Arc<FileRepository>,
        config: TransferConfig,
    ) -> Self {
        BlobExec {
            mux,
            repo,
            staging,
            config,
            limit: DEFAULT_CONCURRENCY,
            exporter: Arc::new(RateExporter::new(transferred_bytes())),
        }
    }

    /// Bound the number of concurrent entry transfers.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Use a specific counter instead of the process-wide one.
    pub fn with_counter(mut self, counter: prometheus::IntCounter) -> Self {
        self.exporter = Arc::new(RateExporter::new(counter));
        self
    }

    pub fn exporter(&self) -> &RateExporter {
        &self.exporter
    }

    /// Execute the transfer, returning the resulting fileset.
    pub async fn run(&self) -> Result<Fileset, Error> {
        match self.config.kind {
            TransferKind::Intern => self.intern().await,
            TransferKind::Extern => self.extern_out().await,
        }
    }

    /// Promote staged intern results into the main repository.
    pub async fn promote(&self) -> Result<(), Error> {
        self.repo.promote_from(&self.staging).await
    }

    async fn intern(&self) -> Result<Fileset, Error> {
        let (bucket, url) = self.mux.bucket(&self.config.url).await?;

        // A prefix naming exactly one object yields a single-file
        // fileset keyed ".".
        let entries: Vec<(String, BlobObject)> = match bucket.head(&url.key).await {
            Ok(obj) => vec![(SINGLE_KEY.to_string(), obj)],
            Err(e) if e.is(ErrorKind::NotExist) => bucket
                .list(&url.key)
                .await?
                .into_iter()
                .map(|o| {
                    let name = o
                        .key
                        .strip_prefix(&url.key)
                        .unwrap_or(o.key.as_str())
                        .to_string();
                    (name, o)
                })
                .collect(),
            Err(e) => return Err(e),
        };
        debug!(url = %self.config.url, entries = entries.len(), "intern transfer starting");

        let sem = Arc::new(Semaphore::new(self.limit));
        let mut set = JoinSet::new();
        for (name, obj) in entries {
            let bucket = Arc::clone(&bucket);
            let url = url.clone();
            let repo = Arc::clone(&self.repo);
            let staging = Arc::clone(&self.staging);
            let exporter = Arc::clone(&self.exporter);
            let sem = Arc::clone(&sem);
            set.spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore closed");
                let file = intern_one(&*bucket, &url, &obj, &*repo, &*staging, &exporter).await?;
                Ok::<(String, File), Error>((name, file))
            });
        }

        let mut fileset = Fileset::new();
        let mut first_err: Option<Error> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok((name, file))) => {
                    fileset.map.insert(name, file);
                }
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                        set.abort_all();
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(Error::temporary("intern transfer", e.to_string()));
                        set.abort_all();
                    }
                }
            }
        }
        if let Some(e) = first_err {
            if let Err(clear_err) = self.staging.clear().await {
                warn!(error = %clear_err, "failed to discard staging repository");
            }
            return Err(e);
        }
        Ok(fileset)
    }

    async fn extern_out(&self) -> Result<Fileset, Error> {
        let fileset = self.config.input.clone().ok_or_else(|| {
            Error::fatal("extern transfer", "missing input fileset")
        })?;
        let (bucket, url) = self.mux.bucket(&self.config.url).await?;
        debug!(url = %self.config.url, entries = fileset.len(), "extern transfer starting");

        // A single-file fileset writes to the exact destination key.
        if fileset.is_single() {
            let file = &fileset.map[SINGLE_KEY];
            let data = self.repo.get(&file.id).await?;
            let n = data.len() as u64;
            bucket.put(&url.key, data).await?;
            self.exporter.add(n);
            return Ok(fileset);
        }

        let sem = Arc::new(Semaphore::new(self.limit));
        let mut set = JoinSet::new();
        for (path, file) in &fileset.map {
            let key = format!("{}{}", url.key, path);
            let id = file.id.clone();
            let bucket = Arc::clone(&bucket);
            let repo = Arc::clone(&self.repo);
            let exporter = Arc::clone(&self.exporter);
            let sem = Arc::clone(&sem);
            set.spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore closed");
                let data = repo.get(&id).await?;
                let n = data.len() as u64;
                bucket.put(&key, data).await?;
                exporter.add(n);
                Ok::<(), Error>(())
            });
        }

        let mut first_err: Option<Error> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                        set.abort_all();
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(Error::temporary("extern transfer", e.to_string()));
                        set.abort_all();
                    }
                }
            }
        }
        match first_err {
            // Partial writes stay behind: keys are re-derived on retry.
            Some(e) => Err(e),
            None => Ok(fileset),
        }
    }
}

/// Fetch one object into staging, or skip the fetch entirely when the
/// repository already holds its advertised content digest.
async fn intern_one(
    bucket: &dyn Bucket,
    url: &BlobUrl,
    obj: &BlobObject,
    repo: &FileRepository,
    staging: &FileRepository,
    exporter: &RateExporter,
) -> Result<File, Error> {
    let source = url.source_of(&obj.key);
    if let Some(id) = &obj.sha256 {
        if repo.contains(id).await? {
            debug!(key = %obj.key, id = %id.short(), "content already in repository, skipping fetch");
            let mut file = File {
                id: id.clone(),
                size: obj.size,
                source: Some(source),
                etag: obj.etag.clone(),
                last_modified: obj.last_modified,
                assertions: None,
            };
            file.assertions = Some(Assertions::for_blob(&file));
            return Ok(file);
        }
    }

    let (meta, data) = bucket.get(&obj.key).await?;
    exporter.add(data.len() as u64);
    let size = data.len() as u64;
    let id = staging.put(data).await?;
    if let Some(expected) = &meta.sha256 {
        if expected != &id {
            return Err(Error::fatal(
                "intern transfer",
                format!("{}: content digest mismatch", obj.key),
            ));
        }
    }
    let mut file = File {
        id,
        size,
        source: Some(source),
        etag: meta.etag,
        last_modified: meta.last_modified,
        assertions: None,
    };
    file.assertions = Some(Assertions::for_blob(&file));
    Ok(file)
}
