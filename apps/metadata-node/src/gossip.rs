//! Push gossip: every period, send pending log entries to a few random
//! peers and record their acknowledgements. The receive path (shared with
//! anti-entropy) applies updates through the conflict resolver and
//! re-propagates every first observation.

use std::time::Duration;

use anyhow::Result;
use common::protocol::PeerInfo;
use common::NodeId;
use tracing::{debug, warn};

use crate::model::{EntityPayload, GossipBatch, GossipEntry, OpKind};
use crate::resolve::{resolve, Resolution};
use crate::state::AppState;

pub fn spawn_gossip_loop(state: AppState) {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(state.config.gossip_period_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(err) = gossip_round(&state).await {
                warn!(error = %err, "gossip round failed");
            }
        }
    });
}

pub async fn gossip_round(state: &AppState) -> Result<()> {
    // Shuffle the whole registry, then walk it until `fanout` peers with
    // pending entries have been served; peers that acknowledged everything
    // do not consume a fanout slot.
    let candidates: Vec<PeerInfo> = {
        let peers = state.peers.lock().await;
        peers.sample(peers.len())
    };

    let mut served = 0usize;
    for peer in candidates {
        if served >= state.config.gossip_fanout {
            break;
        }

        let pending = state
            .store
            .pending_entries_for_peer(&peer.node_id, state.config.gossip_entry_cap)?;
        if pending.is_empty() {
            continue;
        }
        served += 1;

        match push_entries(state, &peer, &pending).await {
            Ok(()) => {
                let op_ids: Vec<String> =
                    pending.iter().map(|entry| entry.op_id.clone()).collect();
                state.store.mark_entries_acked(&op_ids, &peer.node_id)?;
                state.peers.lock().await.touch(&peer.node_id);
                debug!(peer = %peer.node_id, entries = op_ids.len(), "gossip push acknowledged");
            }
            // liveness is the health monitor's job; just log and let the
            // next cycle retry
            Err(err) => {
                warn!(peer = %peer.node_id, error = %err, "gossip push failed");
            }
        }
    }

    Ok(())
}

async fn push_entries(state: &AppState, peer: &PeerInfo, entries: &[GossipEntry]) -> Result<()> {
    let batch = GossipBatch {
        sender_id: state.node_id.clone(),
        sender_address: state.advertise_addr.clone(),
        entries: entries.to_vec(),
    };

    state
        .http
        .post(format!("http://{}/internal/gossip/receive", peer.address))
        .json(&batch)
        .timeout(Duration::from_secs(state.config.gossip_deadline_secs))
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

/// Shared receive path for gossip pushes and anti-entropy payloads.
/// Returns the number of entries that were new to this node.
pub async fn apply_batch(
    state: &AppState,
    sender: &NodeId,
    entries: Vec<GossipEntry>,
) -> Result<usize> {
    let mut fresh = 0usize;

    for entry in entries {
        // A known op id means this entry was already applied and already
        // re-propagated; duplicate delivery is a no-op.
        if !state.store.record_remote_entry(&entry, sender)? {
            continue;
        }
        fresh += 1;

        if let Err(err) = apply_resolved(state, &entry.payload).await {
            warn!(
                entity = %entry.entity_id,
                op = entry.op.as_str(),
                error = %err,
                "failed applying gossiped update"
            );
        }
    }

    if fresh > 0 {
        debug!(sender = %sender, fresh, "absorbed gossip entries");
    }
    Ok(fresh)
}

/// Store-if-absent, otherwise run the conflict resolver and keep the
/// winner. Returns `true` when the local row changed.
pub async fn apply_resolved(state: &AppState, remote: &EntityPayload) -> Result<bool> {
    let kind = remote.kind();
    let entity_id = remote.entity_id();

    let changed = match state.store.get_entity(kind, &entity_id)? {
        None => {
            state.store.apply_payload(remote)?;
            true
        }
        Some(local) => match resolve(&local, remote) {
            Resolution::KeepLocal => false,
            Resolution::Take(winner) => {
                state.store.apply_payload(&winner)?;
                true
            }
        },
    };

    if changed {
        post_apply(state, remote).await?;
    }
    Ok(changed)
}

/// Registry side effects and derived repairs after a row change.
async fn post_apply(state: &AppState, payload: &EntityPayload) -> Result<()> {
    match payload {
        EntityPayload::File(record) => {
            // Two partitions may each have created a live file under the
            // same (owner, name); every node repairs the duplicate the same
            // way, so no gossip is needed for the outcome.
            let losers = state
                .store
                .reconcile_name_collision(&record.owner_id, &record.name)?;
            for loser in losers {
                debug!(
                    file_id = %loser.file_id,
                    name = %loser.name,
                    "name collision resolved against this record"
                );
            }
        }
        EntityPayload::StorageNode(record) => {
            let mut storage = state.storage.lock().await;
            storage.absorb(record.clone());
        }
        EntityPayload::Peer(record) => {
            if record.node_id != state.node_id {
                let mut peers = state.peers.lock().await;
                peers.upsert(record.node_id.clone(), record.address.clone());
            }
        }
        _ => {}
    }
    Ok(())
}

/// Record a locally originated mutation so the push loop spreads it.
pub fn emit(state: &AppState, op: OpKind, payload: EntityPayload) -> Result<()> {
    let entry = state.gossip_entry(op, payload);
    state.store.append_entry(&entry)?;
    Ok(())
}

/// Anti-entropy push: wrap full payloads as fresh entries and deliver them
/// through the regular receive endpoint.
pub async fn push_summary_entries(
    state: &AppState,
    peer: &PeerInfo,
    payloads: Vec<EntityPayload>,
) -> Result<()> {
    if payloads.is_empty() {
        return Ok(());
    }

    let entries: Vec<GossipEntry> = payloads
        .into_iter()
        .map(|payload| state.gossip_entry(OpKind::Update, payload))
        .collect();

    let batch = GossipBatch {
        sender_id: state.node_id.clone(),
        sender_address: state.advertise_addr.clone(),
        entries,
    };

    state
        .http
        .post(format!("http://{}/internal/gossip/receive", peer.address))
        .json(&batch)
        .timeout(Duration::from_secs(
            state.config.anti_entropy_deadline_secs,
        ))
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}
