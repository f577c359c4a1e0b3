//! workspace-sync server: WebSocket sessions plus the pull-sync endpoint.
//!
//! Configured through `WORKSPACE_SYNC_*` environment variables (see
//! [`ServerConfig`]); tokens come from `WORKSPACE_SYNC_TOKENS`.

use std::sync::Arc;
use tokio::net::TcpListener;

use workspace_sync::coordinator::CoordinatorContext;
use workspace_sync::storage::{ChatLog, MemoryStore, RocksStore, StoreConfig};
use workspace_sync::{
    pull, RoomRegistry, ServerConfig, SocketPool, StaticAccessControl, SyncServer, WorkspaceStore,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    let access = StaticAccessControl::from_env()?;
    if access.token_count() == 0 {
        log::warn!("WORKSPACE_SYNC_TOKENS is empty; every connection will be refused");
    }

    let (store, chat_log): (WorkspaceStore, Arc<dyn ChatLog>) = match &config.storage_path {
        Some(path) => {
            let backend = Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?);
            log::info!("Workspace storage at {}", path.display());
            let chat_log: Arc<dyn ChatLog> = backend.clone();
            (WorkspaceStore::from_backend(backend), chat_log)
        }
        None => {
            log::warn!("No storage path configured, workspaces live in memory only");
            let backend = Arc::new(MemoryStore::new());
            let chat_log: Arc<dyn ChatLog> = backend.clone();
            (WorkspaceStore::from_backend(backend), chat_log)
        }
    };

    let registry = Arc::new(RoomRegistry::new(CoordinatorContext {
        store: Arc::new(store),
        pool: Arc::new(SocketPool::new()),
        access: Arc::new(access),
        chat_log,
        flush_interval: config.flush_interval(),
        hibernate_after: config.hibernate_after(),
        mailbox_capacity: config.mailbox_capacity,
    }));

    let ws_listener = TcpListener::bind(&config.ws_bind_addr).await?;
    let http_listener = TcpListener::bind(&config.http_bind_addr).await?;
    log::info!("Sync server listening on {}", ws_listener.local_addr()?);

    let server = SyncServer::new(registry.clone(), config.outbound_buffer);
    tokio::select! {
        result = server.serve(ws_listener) => result?,
        result = pull::serve(http_listener, registry.clone()) => result?,
        _ = tokio::signal::ctrl_c() => log::info!("Shutting down"),
    }

    registry.hibernate_all().await;
    log::info!("All room hosts flushed");
    Ok(())
}
