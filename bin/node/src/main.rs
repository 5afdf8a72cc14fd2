//! Hash path node
//!
//! Synchronises a sparse Merkle tree with a local block source and serves
//! tree state and hash paths over HTTP:
//! - `GET /` liveness
//! - `GET /get-tree-state`
//! - `GET /get-hash-path/:index`

mod api;
mod config;

use std::sync::Arc;

use anyhow::Context;
use hashpath_core::{
    ExternalWorldStateDb, InternalWorldStateDb, JsonFileServerStateDb, KvServerStateDb,
    LocalBlockSource, Server, WorldStateDb,
};
use hashpath_tree::KvStore;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, WorldStateKind};

type SharedStore = Arc<dyn KvStore>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env();
    info!("Starting hash path node...");
    info!("  Data dir: {}", config.data_dir.display());
    info!("  Blocks: {}", config.blocks_path.display());
    info!("  World state: {:?}", config.world_state);

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let blocks = LocalBlockSource::open(&config.blocks_path).await?;

    match config.world_state {
        WorldStateKind::Internal => {
            let store = open_store(&config)?;
            let world_state = InternalWorldStateDb::open_named(
                store.clone(),
                &config.tree_name,
                config.tree_depth,
            )?;
            let server = Server::new(world_state, KvServerStateDb::new(store), blocks);
            serve(&config, Arc::new(server)).await
        }
        WorldStateKind::External => {
            let args = [
                config.tree_name.clone(),
                config.tree_depth.to_string(),
                config.external_store_path().display().to_string(),
            ];
            let world_state = ExternalWorldStateDb::spawn(&config.db_cli_path, args)
                .await
                .with_context(|| format!("spawning {}", config.db_cli_path.display()))?;
            let state_db = JsonFileServerStateDb::new(config.server_state_path());
            let server = Arc::new(Server::new(world_state, state_db, blocks));
            serve(&config, server.clone()).await?;
            server.world_state().write().await.stop().await?;
            Ok(())
        }
    }
}

#[cfg(feature = "rocksdb")]
fn open_store(config: &Config) -> anyhow::Result<SharedStore> {
    let path = config.store_path();
    let store = hashpath_tree::RocksDbStore::open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    info!("  Store: {}", path.display());
    Ok(Arc::new(store))
}

#[cfg(not(feature = "rocksdb"))]
fn open_store(_config: &Config) -> anyhow::Result<SharedStore> {
    warn!("Built without rocksdb, world state is kept in memory and lost on exit");
    Ok(Arc::new(hashpath_tree::MemoryStore::new()))
}

/// Sync, serve until a shutdown signal, then stop ingestion
async fn serve<W: WorldStateDb + 'static>(
    config: &Config,
    server: Arc<Server<W>>,
) -> anyhow::Result<()> {
    server.start().await.context("initial sync")?;

    let app = api::router(server.clone(), &config.api_prefix);
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    server.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(%err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("Shutting down...");
}
