//! sandpool - main entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sandpool::backend::{ContainerBackend, DockerBackend};
use sandpool::config::Config;
use sandpool::gateway::{Gateway, GatewayState};
use sandpool::pool::Orchestrator;
use sandpool::store::{MemoryStore, PoolStore, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "sandpool")]
#[command(about = "Warm pool orchestrator for ephemeral sandbox containers")]
#[command(version)]
struct Args {
    /// Keep state in memory only (skip the SQLite store)
    #[arg(long)]
    no_db: bool,

    /// Use the in-process stub backend instead of Docker (for local testing)
    #[arg(long)]
    no_docker: bool,

    /// Override the gateway port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sandpool=info,tower_http=debug"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting sandpool...");

    let config = Config::from_env()?;
    let port = args.port.unwrap_or(config.http.port);

    let store: Arc<dyn PoolStore> = if args.no_db {
        tracing::warn!("Running without durable store; pool state will not survive restarts");
        Arc::new(MemoryStore::new())
    } else {
        let store = SqliteStore::connect(&config.store.path).await?;
        tracing::info!(path = %config.store.path.display(), "SQLite store ready");
        Arc::new(store)
    };

    let backend: Arc<dyn ContainerBackend> = if args.no_docker {
        tracing::warn!("Running with stub backend; no real containers will start");
        Arc::new(sandpool::testing::StubBackend::new())
    } else {
        Arc::new(DockerBackend::new(config.docker.clone()))
    };

    let pool = Orchestrator::spawn(store, Arc::clone(&backend), config.pool.to_settings()).await?;
    tracing::info!(
        min_size = config.pool.min_size,
        max_size = config.pool.max_size,
        buffer_size = config.pool.buffer_size,
        "Pool orchestrator running"
    );

    Gateway::start(GatewayState { pool, backend }, port)
        .await
        .map_err(|e| anyhow::anyhow!("gateway server failed: {e}"))?;

    tracing::info!("sandpool shutdown complete");
    Ok(())
}
