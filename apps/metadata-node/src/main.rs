use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::Router;
use common::{unix_ts, NodeId};
use tracing::info;

mod anti_entropy;
mod api;
mod auth;
mod clock;
mod config;
mod data;
mod gc;
mod gossip;
mod health;
mod internal;
mod model;
mod peers;
mod registry;
mod repair;
mod resolve;
mod sn_client;
mod state;
mod store;

use config::NodeConfig;
use peers::PeerRegistry;
use registry::StorageRegistry;
use state::AppState;
use store::MetaStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_target(false)
        .compact()
        .init();

    let config = NodeConfig::from_env();
    let node_id = NodeId::acquire(std::env::var("REDCLOUD_NODE_ID").ok(), unix_ts());

    let bind_addr: SocketAddr = std::env::var("REDCLOUD_METADATA_BIND")
        .unwrap_or_else(|_| format!("0.0.0.0:{}", common::METADATA_PORT))
        .parse()
        .context("invalid REDCLOUD_METADATA_BIND")?;
    let advertise_addr = std::env::var("REDCLOUD_ADVERTISE_ADDR")
        .unwrap_or_else(|_| format!("127.0.0.1:{}", bind_addr.port()));

    let db_path = std::env::var("REDCLOUD_DB_PATH")
        .unwrap_or_else(|_| format!("./data/metadata-{node_id}/redcloud.db"));
    // an unreadable or corrupt store is unrecoverable; exit non-zero
    let store = MetaStore::open(&db_path)?;

    // restore the topology view persisted by the previous run
    let storage = StorageRegistry::load(store.all_storage_nodes()?);
    let mut peer_registry = PeerRegistry::new(node_id.clone(), advertise_addr.clone());
    for record in store.all_peers()? {
        peer_registry.upsert(record.node_id, record.address);
    }

    let state = AppState::new(
        node_id.clone(),
        advertise_addr.clone(),
        config,
        store,
        peer_registry,
        storage,
    );

    // DNS bootstrap: introduce ourselves to every resolvable peer. An
    // explicitly configured alias that cannot resolve, or an address
    // collision with a registered peer, aborts startup.
    peers::bootstrap(&state).await?;

    gossip::spawn_gossip_loop(state.clone());
    anti_entropy::spawn_anti_entropy_loop(state.clone());
    health::spawn_health_loop(state.clone());
    repair::spawn_repair_loop(state.clone());
    gc::spawn_gc_loop(state.clone());
    peers::spawn_refresh_loop(state.clone());
    peers::spawn_reconcile_loop(state.clone());

    // uploads buffer whole files; lift axum's default 2 MiB body cap
    let app = Router::new()
        .merge(api::router())
        .merge(internal::router())
        .layer(axum::extract::DefaultBodyLimit::max(1024 * 1024 * 1024))
        .with_state(state);

    info!(%bind_addr, %node_id, %advertise_addr, "metadata node listening");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
