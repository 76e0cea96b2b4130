//! flowd — the flowgrid daemon.
//!
//! Two modes:
//!
//! - **worker** — the agent that runs on each launched VM: serves the
//!   worker API, installs image updates, and (in cluster mode) shuts
//!   itself down after ten idle minutes
//! - **migrate** — create the task store's table and secondary
//!   indices
//!
//! # Usage
//!
//! ```text
//! flowd worker --addr 0.0.0.0:9000 --config /etc/flowgrid.yaml --cluster
//! flowd migrate --db /var/lib/flowgrid/taskdb.redb
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use flow_core::{Digest, Repository, Resources};
use flowgrid_blob::FileRepository;
use flowgrid_taskdb::TaskStore;
use flowgrid_worker::{Pool, ServerConfig, WorkerServer};

#[derive(Parser)]
#[command(name = "flowd", about = "flowgrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker agent.
    Worker {
        /// Server address.
        #[arg(long, default_value = "0.0.0.0:9000")]
        addr: SocketAddr,

        /// The worker configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Runtime data directory.
        #[arg(long, default_value = "/mnt/data/flowgrid")]
        dir: PathBuf,

        /// Listen on cleartext HTTP/2 instead of TLS.
        #[arg(long)]
        insecure: bool,

        /// This worker is part of an elastic cluster; enables idle
        /// self-termination.
        #[arg(long)]
        cluster: bool,

        /// Prefix used for directory lookup (set when running inside
        /// a container with the host rootfs bound).
        #[arg(long, default_value = "")]
        prefix: String,
    },

    /// Create the task store table and all secondary indices.
    Migrate {
        /// Task store database path.
        #[arg(long, default_value = "/var/lib/flowgrid/taskdb.redb")]
        db: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flowd=debug,flowgrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Worker {
            addr,
            config,
            dir,
            insecure,
            cluster,
            prefix,
        } => run_worker(addr, config, dir, insecure, cluster, prefix).await,
        Command::Migrate { db } => run_migrate(&db),
    }
}

async fn run_worker(
    addr: SocketAddr,
    config: Option<PathBuf>,
    dir: PathBuf,
    insecure: bool,
    cluster: bool,
    prefix: String,
) -> anyhow::Result<()> {
    info!("flowd starting in worker mode");

    let config_yaml = match &config {
        Some(path) => {
            let resolved = PathBuf::from(format!("{prefix}{}", path.display()));
            std::fs::read(&resolved)
                .with_context(|| format!("read config {}", resolved.display()))?
        }
        None => Vec::new(),
    };

    std::fs::create_dir_all(&dir).context("create data directory")?;
    let repo = Arc::new(FileRepository::new(dir.join("repo")));
    info!(root = %repo.root().display(), "repository opened");

    // The installed image digest is this executable's own digest.
    let exe = std::env::current_exe().context("locate executable")?;
    let image = tokio::fs::read(&exe)
        .await
        .with_context(|| format!("read executable {}", exe.display()))?;
    let installed = Digest::from_bytes(&image);
    info!(digest = %installed.short(), "installed image digest computed");

    let cpus = std::thread::available_parallelism()
        .map(|n| n.get() as f64)
        .unwrap_or(1.0);
    let pool = Pool::new(Resources::with_cpu_mem(cpus, 0.0));

    let mut server_config = ServerConfig::new(addr, env!("CARGO_PKG_VERSION"));
    server_config.insecure = insecure;
    server_config.cluster_mode = cluster;
    server_config.config_yaml = config_yaml;
    server_config.install_dir = dir.join("images");
    let server = WorkerServer::new(server_config, pool, repo as Arc<dyn Repository>, installed);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut serve = tokio::spawn(server.serve(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            serve.await.context("server task")??;
        }
        result = &mut serve => {
            // The server stopped on its own: idle self-termination
            // or an image install.
            result.context("server task")??;
        }
    }
    info!("worker stopped");
    Ok(())
}

fn run_migrate(db: &std::path::Path) -> anyhow::Result<()> {
    if let Some(parent) = db.parent() {
        std::fs::create_dir_all(parent).context("create database directory")?;
    }
    let store = TaskStore::open(db).context("open task store")?;
    store.migrate().context("create tables")?;
    info!(db = %db.display(), "task store migrated");
    Ok(())
}
