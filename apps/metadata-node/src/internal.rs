//! Node-to-node control surface: peer discovery, gossip receipt,
//! anti-entropy summaries, and the storage-node heartbeat sink.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::protocol::{
    AckResponse, HeartbeatRequest, HeartbeatResponse, PeerListResponse, RegisterPeerRequest,
};
use tracing::{error, info};

use crate::anti_entropy::{FetchEntitiesRequest, FetchEntitiesResponse, StateSummaryResponse};
use crate::gossip::apply_batch;
use crate::model::{EntityPayload, GossipBatch, OpKind};
use crate::peers;
use crate::registry::HeartbeatOutcome;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/internal/peers", get(list_peers))
        .route("/internal/peers/register", post(register_peer))
        .route("/internal/gossip/receive", post(receive_gossip))
        .route("/internal/gossip/state-summary", get(state_summary))
        .route("/internal/gossip/fetch-entities", post(fetch_entities))
        .route("/internal/storage/heartbeat", post(storage_heartbeat))
}

async fn list_peers(State(state): State<AppState>) -> Json<PeerListResponse> {
    let peers = state.peers.lock().await;
    Json(PeerListResponse {
        self_info: peers.self_info(),
        peers: peers.all(),
    })
}

async fn register_peer(
    State(state): State<AppState>,
    Json(request): Json<RegisterPeerRequest>,
) -> Response {
    match peers::register_peer(&state, request.node_id, request.address).await {
        Ok(_) => (StatusCode::OK, Json(AckResponse { ok: true })).into_response(),
        Err(err) => {
            error!(error = %err, "peer registration failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn receive_gossip(
    State(state): State<AppState>,
    Json(batch): Json<GossipBatch>,
) -> Response {
    let GossipBatch {
        sender_id,
        sender_address,
        entries,
    } = batch;

    // the sender is a live peer whatever the batch contains
    {
        let mut peers = state.peers.lock().await;
        peers.upsert(sender_id.clone(), sender_address);
        peers.touch(&sender_id);
    }

    match apply_batch(&state, &sender_id, entries).await {
        Ok(_) => (StatusCode::OK, Json(AckResponse { ok: true })).into_response(),
        Err(err) => {
            error!(sender = %sender_id, error = %err, "failed applying gossip batch");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn state_summary(State(state): State<AppState>) -> Response {
    match state.store.state_summary() {
        Ok(summary) => (StatusCode::OK, Json(StateSummaryResponse { summary })).into_response(),
        Err(err) => {
            error!(error = %err, "failed building state summary");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn fetch_entities(
    State(state): State<AppState>,
    Json(request): Json<FetchEntitiesRequest>,
) -> Response {
    match state.store.fetch_entities(request.kind, &request.ids) {
        Ok(payloads) => (StatusCode::OK, Json(FetchEntitiesResponse { payloads })).into_response(),
        Err(err) => {
            error!(error = %err, "failed fetching entities");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn storage_heartbeat(
    State(state): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> Response {
    let (outcome, record) = {
        let mut storage = state.storage.lock().await;
        storage.observe_heartbeat(
            request.node_id,
            request.address,
            request.capacity_bytes,
            request.used_bytes,
        )
    };

    if let Err(err) = state.store.upsert_storage_node(&record) {
        error!(storage_node = %record.node_id, error = %err, "failed persisting heartbeat");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    // relay through gossip so peers converge on liveness without waiting
    // for anti-entropy
    if let Err(err) = crate::gossip::emit(
        &state,
        OpKind::HeartbeatRelay,
        EntityPayload::StorageNode(record.clone()),
    ) {
        error!(storage_node = %record.node_id, error = %err, "failed relaying heartbeat");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    match outcome {
        HeartbeatOutcome::Registered => {
            info!(storage_node = %record.node_id, address = %record.address, "storage node joined");
        }
        HeartbeatOutcome::Recovered => {
            info!(storage_node = %record.node_id, "storage node recovered via heartbeat");
        }
        HeartbeatOutcome::Refreshed => {}
    }

    // A joining or recovering node may carry blobs the metadata layer has
    // no facts for; fold its listing back in off the request path.
    if matches!(
        outcome,
        HeartbeatOutcome::Registered | HeartbeatOutcome::Recovered
    ) {
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = crate::data::reconcile_storage_listing(&state, &record).await {
                tracing::warn!(
                    storage_node = %record.node_id,
                    error = %err,
                    "storage listing reconciliation failed"
                );
            }
        });
    }

    (StatusCode::OK, Json(HeartbeatResponse { ok: true })).into_response()
}
