//! The worker's HTTP/2 server.
//!
//! Serving is a manual accept loop so the HTTP/2 stream limit can be
//! applied per connection. Mutual-TLS serving requires deployment
//! certificate material wired in by the binary; the `insecure` flag
//! explicitly opts into cleartext HTTP/2 (used in tests and trusted
//! networks).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::Service;
use tracing::{error, info, warn};

use flow_core::{Digest, Error, Repository, Resources};
use flowgrid_cloud::CloudApi;

use crate::pool::Pool;

/// The port workers listen on.
pub const WORKER_PORT: u16 = 9000;

/// Concurrent HTTP/2 streams supported per server.
pub const MAX_CONCURRENT_STREAMS: u32 = 20_000;

/// Instance tags the worker sets on itself during bring-up.
pub const VERSION_TAG: &str = "worker:version";
pub const DIGEST_TAG: &str = "worker:digest";

/// Worker server parameters.
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Listen on cleartext HTTP/2 instead of TLS.
    pub insecure: bool,
    pub version: String,
    /// The configuration document served from `/v1/config`.
    pub config_yaml: Vec<u8>,
    /// Where installed images are written.
    pub install_dir: PathBuf,
    /// Whether this worker is part of an elastic cluster; enables
    /// idle self-termination.
    pub cluster_mode: bool,
    /// Grace period before the first idleness check.
    pub grace: Duration,
    /// Idle time after which the worker terminates itself.
    pub idle_expiry: Duration,
    /// Idleness check cadence.
    pub poll: Duration,
}

impl ServerConfig {
    pub fn new(addr: SocketAddr, version: impl Into<String>) -> Self {
        ServerConfig {
            addr,
            insecure: false,
            version: version.into(),
            config_yaml: Vec::new(),
            install_dir: PathBuf::from("/mnt/data/flowgrid"),
            cluster_mode: false,
            grace: Duration::from_secs(600),
            idle_expiry: Duration::from_secs(600),
            poll: Duration::from_secs(60),
        }
    }
}

struct ServerState {
    version: String,
    config_yaml: Vec<u8>,
    pool: Arc<Pool>,
    repo: Arc<dyn Repository>,
    install_dir: PathBuf,
    installed: std::sync::Mutex<Digest>,
    restart: watch::Sender<bool>,
}

/// The worker agent server.
pub struct WorkerServer {
    config: ServerConfig,
    state: Arc<ServerState>,
    restart_rx: watch::Receiver<bool>,
}

impl WorkerServer {
    pub fn new(
        config: ServerConfig,
        pool: Arc<Pool>,
        repo: Arc<dyn Repository>,
        installed: Digest,
    ) -> Self {
        let (restart, restart_rx) = watch::channel(false);
        let state = Arc::new(ServerState {
            version: config.version.clone(),
            config_yaml: config.config_yaml.clone(),
            pool,
            repo,
            install_dir: config.install_dir.clone(),
            installed: std::sync::Mutex::new(installed),
            restart,
        });
        WorkerServer {
            config,
            state,
            restart_rx,
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/", get(pool_status))
            .route("/v1/config", get(get_config))
            .route("/v1/execimage", get(get_execimage).post(post_execimage))
            .with_state(Arc::clone(&self.state))
    }

    /// Bind the configured address and serve until shutdown, restart,
    /// or idle self-termination.
    pub async fn serve(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.addr)
            .await
            .context("failed to bind worker server")?;
        self.serve_with(listener, shutdown).await
    }

    /// Serve on an already-bound listener (used by tests to learn the
    /// bound port).
    pub async fn serve_with(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        if !self.config.insecure {
            anyhow::bail!(
                "mutual-TLS serving requires certificate material; \
                 pass the insecure flag for cleartext HTTP/2"
            );
        }
        let addr = listener.local_addr().context("listener address")?;
        info!(%addr, version = %self.config.version, "worker listening");

        if self.config.cluster_mode {
            let pool = Arc::clone(&self.state.pool);
            let restart = self.state.restart.clone();
            let grace = self.config.grace;
            let expiry = self.config.idle_expiry;
            let poll = self.config.poll;
            tokio::spawn(async move {
                // Give the instance a full expiry period to receive
                // work before the first check.
                tokio::time::sleep(grace).await;
                loop {
                    if pool.stop_if_idle_for(expiry) {
                        warn!(idle_secs = expiry.as_secs(), "worker idle; shutting down");
                        let _ = restart.send(true);
                        return;
                    }
                    tokio::time::sleep(poll).await;
                }
            });
        }

        let app = self.router();
        let mut restart_rx = self.restart_rx.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted.context("accept failed")?;
                    let app = app.clone();
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                            app.clone().call(req)
                        });
                        let mut builder = auto::Builder::new(TokioExecutor::new());
                        builder
                            .http2()
                            .max_concurrent_streams(MAX_CONCURRENT_STREAMS);
                        if let Err(e) = builder.serve_connection(io, service).await {
                            error!(%peer_addr, error = %e, "connection error");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("worker shutting down");
                    return Ok(());
                }
                _ = restart_rx.changed() => {
                    info!("worker restarting into installed image");
                    return Ok(());
                }
            }
        }
    }
}

/// Tag the worker's own instance with its version and image digest,
/// read back by the controller after launch.
pub async fn set_tags(
    cloud: &dyn CloudApi,
    instance_id: &str,
    version: &str,
    digest: &Digest,
) -> Result<(), Error> {
    let mut tags = BTreeMap::new();
    tags.insert(VERSION_TAG.to_string(), version.to_string());
    tags.insert(DIGEST_TAG.to_string(), digest.to_string());
    cloud
        .create_tags(instance_id, &tags)
        .await
        .map_err(|e| Error::temporary("tagging instance", e.to_string()))
}

// ── Handlers ───────────────────────────────────────────────────────

async fn get_config(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/x-yaml")],
        state.config_yaml.clone(),
    )
}

async fn get_execimage(State(state): State<Arc<ServerState>>) -> Json<String> {
    Json(state.installed.lock().unwrap().to_string())
}

async fn post_execimage(
    State(state): State<Arc<ServerState>>,
    Json(digest): Json<String>,
) -> Response {
    let digest = match Digest::parse(&digest) {
        Ok(d) => d,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    // Replacement is only allowed on an idle worker; this also stops
    // the pool so no new exec slips in underneath the restart.
    if !state.pool.stop_if_idle_for(Duration::ZERO) {
        return (StatusCode::CONFLICT, "worker not idle").into_response();
    }
    let image = match state.repo.get(&digest).await {
        Ok(data) => data,
        Err(e) => {
            error!(error = %e, "image fetch failed");
            return (StatusCode::BAD_GATEWAY, format!("fetch image: {e}")).into_response();
        }
    };
    let path = state
        .install_dir
        .join(format!("worker-{}", digest.hex_n(7)));
    if let Err(e) = install_image(&path, &image).await {
        error!(error = %e, "image install failed");
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("install image: {e}"))
            .into_response();
    }
    *state.installed.lock().unwrap() = digest.clone();
    info!(digest = %digest.short(), path = %path.display(), "image installed, restarting");
    let _ = state.restart.send(true);
    StatusCode::ACCEPTED.into_response()
}

async fn install_image(path: &std::path::Path, image: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, image).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    }
    Ok(())
}

#[derive(serde::Serialize)]
struct PoolStatus {
    version: String,
    resources: Resources,
    busy: usize,
    stopped: bool,
}

async fn pool_status(State(state): State<Arc<ServerState>>) -> Json<PoolStatus> {
    Json(PoolStatus {
        version: state.version.clone(),
        resources: state.pool.resources().clone(),
        busy: state.pool.busy(),
        stopped: state.pool.stopped(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgrid_cloud::testing::TestCloud;

    #[tokio::test]
    async fn set_tags_writes_version_and_digest() {
        let cloud = TestCloud::new();
        let insts = cloud
            .run_instances(flowgrid_cloud::RunInstancesRequest {
                spec: flowgrid_cloud::LaunchSpec {
                    image_id: "ami-1".to_string(),
                    instance_type: "m4.xlarge".to_string(),
                    subnet_id: String::new(),
                    security_group: String::new(),
                    instance_profile: String::new(),
                    key_name: None,
                    user_data: String::new(),
                    ebs_optimized: false,
                    block_devices: Vec::new(),
                },
                count: 1,
                dry_run: false,
                client_token: None,
            })
            .await
            .unwrap();
        let id = insts[0].instance_id.clone();

        let digest = Digest::from_str_content("image");
        set_tags(&cloud, &id, "0.3.0", &digest).await.unwrap();

        let inst = cloud.instance(&id).unwrap();
        assert_eq!(inst.tags.get(VERSION_TAG).map(String::as_str), Some("0.3.0"));
        assert_eq!(
            inst.tags.get(DIGEST_TAG).cloned(),
            Some(digest.to_string())
        );
    }

    #[tokio::test]
    async fn secure_serving_requires_certificates() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), "0.3.0");
        let pool = Pool::new(Resources::new());
        let repo: Arc<dyn Repository> =
            Arc::new(flowgrid_blob::FileRepository::new(std::env::temp_dir().join("unused")));
        let server = WorkerServer::new(config, pool, repo, Digest::from_str_content("img"));
        let (_tx, rx) = watch::channel(false);
        let err = server.serve(rx).await.unwrap_err();
        assert!(err.to_string().contains("insecure"));
    }
}
