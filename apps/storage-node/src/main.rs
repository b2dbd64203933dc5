use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use common::protocol::{
    AckResponse, ChunkListing, ReplicateChunkRequest, HDR_CHECKSUM, HDR_FILE_ID, HDR_ORDINAL,
    HDR_SIZE,
};
use common::{frame, unix_ts, NodeId};
use serde::Serialize;
use tracing::{error, info, warn};

mod heartbeat;
mod store;

use store::{ChunkStore, WriteError, WriteOutcome};

pub struct NodeState {
    node_id: NodeId,
    advertise_addr: String,
    store: ChunkStore,
    http: reqwest::Client,
    config: NodeConfig,
}

pub struct NodeConfig {
    metadata_alias: String,
    metadata_port: u16,
    metadata_addr_override: Option<String>,
    heartbeat_period_secs: u64,
    heartbeat_deadline_secs: u64,
    capacity_bytes: u64,
}

impl NodeConfig {
    fn from_env() -> Self {
        Self {
            metadata_alias: std::env::var("REDCLOUD_METADATA_ALIAS")
                .unwrap_or_else(|_| common::METADATA_SERVICE_ALIAS.to_string()),
            metadata_port: env_parse("REDCLOUD_METADATA_PORT", common::METADATA_PORT),
            metadata_addr_override: std::env::var("REDCLOUD_METADATA_ADDR").ok(),
            heartbeat_period_secs: env_parse("REDCLOUD_HEARTBEAT_PERIOD", 10),
            heartbeat_deadline_secs: env_parse("REDCLOUD_HEARTBEAT_DEADLINE", 5),
            capacity_bytes: env_parse("REDCLOUD_CAPACITY_BYTES", 64 * 1024 * 1024 * 1024),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        )
        .with_target(false)
        .compact()
        .init();

    let config = NodeConfig::from_env();
    let node_id = NodeId::acquire(std::env::var("REDCLOUD_NODE_ID").ok(), unix_ts());

    let bind_addr: SocketAddr = std::env::var("REDCLOUD_STORAGE_BIND")
        .unwrap_or_else(|_| format!("0.0.0.0:{}", common::STORAGE_PORT))
        .parse()
        .context("invalid REDCLOUD_STORAGE_BIND")?;
    let advertise_addr = std::env::var("REDCLOUD_ADVERTISE_ADDR")
        .unwrap_or_else(|_| format!("127.0.0.1:{}", bind_addr.port()));

    let data_dir = std::env::var("REDCLOUD_DATA_DIR")
        .unwrap_or_else(|_| format!("./data/storage-{node_id}"));
    let store = ChunkStore::init(&data_dir).await?;

    let state = Arc::new(NodeState {
        node_id: node_id.clone(),
        advertise_addr,
        store,
        http: reqwest::Client::new(),
        config,
    });

    heartbeat::spawn_heartbeat_loop(state.clone());

    // a framed chunk body can exceed axum's default 2 MiB cap
    let app = Router::new()
        .route("/ping", get(ping))
        .route("/chunks", get(list_chunks))
        .route("/chunks/{chunk_id}", put(write_chunk).get(read_chunk).delete(delete_chunk))
        .route("/chunks/{chunk_id}/replicate", post(replicate_chunk))
        .layer(axum::extract::DefaultBodyLimit::max(128 * 1024 * 1024))
        .with_state(state);

    info!(%bind_addr, %node_id, "storage node listening");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

async fn ping(State(state): State<Arc<NodeState>>) -> Json<common::node::HealthStatus> {
    Json(common::node::HealthStatus {
        node_id: state.node_id.clone(),
        role: "storage-node".to_string(),
        online: true,
    })
}

async fn list_chunks(State(state): State<Arc<NodeState>>) -> Response {
    match state.store.list().await {
        Ok(listings) => (StatusCode::OK, Json(listings)).into_response(),
        Err(err) => {
            error!(error = %err, "failed to list chunks");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn write_chunk(
    State(state): State<Arc<NodeState>>,
    Path(chunk_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(listing) = listing_from_headers(&chunk_id, &headers) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: "missing or invalid chunk metadata headers".to_string(),
            }),
        )
            .into_response();
    };

    let payload = match frame::decode(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(chunk_id = %chunk_id, error = %err, "rejecting malformed chunk stream");
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: err.to_string(),
                }),
            )
                .into_response();
        }
    };

    if payload.len() as u64 != listing.size {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: format!(
                    "size mismatch: declared {} received {}",
                    listing.size,
                    payload.len()
                ),
            }),
        )
            .into_response();
    }

    match state.store.write(&listing, payload).await {
        Ok(outcome) => {
            info!(
                chunk_id = %chunk_id,
                size = listing.size,
                idempotent = matches!(outcome, WriteOutcome::AlreadyPresent),
                "stored chunk"
            );
            (StatusCode::CREATED, Json(AckResponse { ok: true })).into_response()
        }
        Err(err @ WriteError::ChecksumMismatch { .. }) => {
            warn!(chunk_id = %chunk_id, error = %err, "rejected chunk write");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorBody {
                    error: err.to_string(),
                }),
            )
                .into_response()
        }
        Err(err @ WriteError::Conflict { .. }) => {
            warn!(chunk_id = %chunk_id, error = %err, "rejected conflicting overwrite");
            (
                StatusCode::CONFLICT,
                Json(ErrorBody {
                    error: err.to_string(),
                }),
            )
                .into_response()
        }
        Err(WriteError::StorageFull) => (
            StatusCode::INSUFFICIENT_STORAGE,
            Json(ErrorBody {
                error: "storage full".to_string(),
            }),
        )
            .into_response(),
        Err(WriteError::Internal(err)) => {
            error!(chunk_id = %chunk_id, error = %err, "chunk write failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn read_chunk(
    State(state): State<Arc<NodeState>>,
    Path(chunk_id): Path<String>,
) -> Response {
    match state.store.read(&chunk_id).await {
        Ok(Some((listing, payload))) => {
            let framed = frame::encode(&payload);
            Response::builder()
                .status(StatusCode::OK)
                .header(HDR_FILE_ID, listing.file_id)
                .header(HDR_ORDINAL, listing.ordinal.to_string())
                .header(HDR_SIZE, listing.size.to_string())
                .header(HDR_CHECKSUM, listing.checksum)
                .body(Body::from(framed))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!(chunk_id = %chunk_id, error = %err, "chunk read failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn delete_chunk(
    State(state): State<Arc<NodeState>>,
    Path(chunk_id): Path<String>,
) -> Response {
    match state.store.delete(&chunk_id).await {
        Ok(true) => (StatusCode::OK, Json(AckResponse { ok: true })).into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!(chunk_id = %chunk_id, error = %err, "chunk delete failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Pull a chunk from a peer storage node and store it locally.
/// Repair on the metadata nodes drives this; racing repairs are safe
/// because the write path treats identical bytes as a no-op.
async fn replicate_chunk(
    State(state): State<Arc<NodeState>>,
    Path(chunk_id): Path<String>,
    Json(request): Json<ReplicateChunkRequest>,
) -> Response {
    let url = format!("http://{}/chunks/{}", request.source_address, chunk_id);

    let response = match state.http.get(&url).send().await {
        Ok(response) => response,
        Err(err) => {
            warn!(chunk_id = %chunk_id, source = %request.source_address, error = %err, "replication fetch failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return StatusCode::NOT_FOUND.into_response();
    }
    if !response.status().is_success() {
        warn!(chunk_id = %chunk_id, status = %response.status(), "replication source returned error");
        return StatusCode::BAD_GATEWAY.into_response();
    }

    let Some(listing) = listing_from_response(&chunk_id, &response) else {
        warn!(chunk_id = %chunk_id, "replication source omitted chunk metadata");
        return StatusCode::BAD_GATEWAY.into_response();
    };

    let body = match response.bytes().await {
        Ok(body) => body,
        Err(err) => {
            warn!(chunk_id = %chunk_id, error = %err, "failed reading replication payload");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let payload = match frame::decode(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(chunk_id = %chunk_id, error = %err, "replication payload failed frame validation");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    match state.store.write(&listing, payload).await {
        Ok(_) => {
            info!(chunk_id = %chunk_id, source = %request.source_address, "replicated chunk from peer");
            (StatusCode::OK, Json(AckResponse { ok: true })).into_response()
        }
        Err(err) => {
            warn!(chunk_id = %chunk_id, error = %err, "failed storing replicated chunk");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn listing_from_headers(chunk_id: &str, headers: &HeaderMap) -> Option<ChunkListing> {
    let get = |name: &str| headers.get(name)?.to_str().ok().map(str::to_string);

    Some(ChunkListing {
        chunk_id: chunk_id.to_string(),
        file_id: get(HDR_FILE_ID)?,
        ordinal: get(HDR_ORDINAL)?.parse().ok()?,
        size: get(HDR_SIZE)?.parse().ok()?,
        checksum: get(HDR_CHECKSUM)?,
    })
}

fn listing_from_response(chunk_id: &str, response: &reqwest::Response) -> Option<ChunkListing> {
    let get = |name: &str| {
        response
            .headers()
            .get(name)?
            .to_str()
            .ok()
            .map(str::to_string)
    };

    Some(ChunkListing {
        chunk_id: chunk_id.to_string(),
        file_id: get(HDR_FILE_ID)?,
        ordinal: get(HDR_ORDINAL)?.parse().ok()?,
        size: get(HDR_SIZE)?.parse().ok()?,
        checksum: get(HDR_CHECKSUM)?,
    })
}
