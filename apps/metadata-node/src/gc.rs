//! Tombstone collector.
//!
//! Finishes what the delete path started: re-sends chunk deletes that were
//! never acknowledged, garbage-collects chunk descriptors once their
//! location set is empty, purges old file tombstones when a retention
//! window is configured, and evicts storage nodes that have been silent far
//! beyond the heartbeat timeout (clearing their location facts).

use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::data::release_file_chunks;
use crate::model::{EntityPayload, OpKind};
use crate::state::AppState;

pub fn spawn_gc_loop(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(state.config.gc_period_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(err) = collect_once(&state).await {
                warn!(error = %err, "gc cycle failed");
            }
        }
    });
}

pub async fn collect_once(state: &AppState) -> Result<()> {
    evict_silent_storage_nodes(state).await?;
    collect_tombstoned_files(state).await?;
    Ok(())
}

async fn collect_tombstoned_files(state: &AppState) -> Result<()> {
    let tombstoned = state.store.tombstoned_files(i64::MAX)?;
    let retention_ms = (state.config.tombstone_retention_secs as i64) * 1000;
    let now = common::unix_ts_ms();

    for file in tombstoned {
        // keep nudging unacknowledged deletes
        let released = release_file_chunks(state, &file.file_id).await.unwrap_or(0);
        if released > 0 {
            info!(file_id = %file.file_id, released, "released lingering chunk replicas");
        }

        // a descriptor is collectible once no storage node is recorded as
        // holding it, i.e. every registered node acknowledged the delete
        let chunks = state.store.chunks_for_file(&file.file_id)?;
        let mut all_clear = true;
        for chunk in &chunks {
            if state
                .store
                .live_locations_for_chunk(&chunk.chunk_id)?
                .is_empty()
            {
                state.store.delete_chunk_descriptor(&chunk.chunk_id)?;
            } else {
                all_clear = false;
            }
        }

        // with no retention window configured, tombstones persist for the
        // cluster session so conflict resolution keeps working
        if retention_ms > 0 && all_clear {
            let expired = file
                .deleted_at_ms
                .map(|stamp| now - stamp > retention_ms)
                .unwrap_or(false);
            if expired {
                state.store.purge_file(&file.file_id)?;
                info!(file_id = %file.file_id, "purged expired file tombstone");
            }
        }
    }

    Ok(())
}

/// Storage nodes silent far beyond the heartbeat timeout leave the registry
/// entirely; their location facts are cleared so repair stops counting them
/// as replicas.
async fn evict_silent_storage_nodes(state: &AppState) -> Result<()> {
    let evictable = {
        let storage = state.storage.lock().await;
        storage.evictable(state.config.storage_eviction_secs)
    };

    for record in evictable {
        {
            let mut storage = state.storage.lock().await;
            storage.remove(&record.node_id);
        }
        state.store.remove_storage_node(&record.node_id)?;

        let held = state.store.live_locations_for_node(&record.node_id)?;
        let cleared = held.len();
        for location in held {
            crate::data::clear_location(state, &location).await?;
        }

        crate::gossip::emit(
            state,
            OpKind::Update,
            EntityPayload::StorageNode(crate::model::StorageNodeRecord {
                status: crate::model::StorageNodeStatus::Failed,
                ..record.clone()
            }),
        )?;

        info!(
            storage_node = %record.node_id,
            cleared_locations = cleared,
            "evicted long-silent storage node"
        );
    }

    Ok(())
}
