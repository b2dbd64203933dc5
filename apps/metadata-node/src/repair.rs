//! Background full-replication repair: for every live chunk, ask storage
//! nodes that miss it to copy it from a node that has it. Handles new-node
//! joins (missing everything), recovered nodes (missing the gap), and
//! writes that committed with fewer than all replicas.
//!
//! Repair is idempotent: multiple metadata nodes racing on the same chunk
//! is safe because the storage-node write path treats identical bytes as a
//! no-op and location facts are set-valued.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use common::{unix_ts_ms, NodeId};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::clock::VectorClock;
use crate::model::{EntityPayload, LocationRecord, OpKind, StorageNodeRecord};
use crate::sn_client::StorageClient;
use crate::state::AppState;

pub fn spawn_repair_loop(state: AppState) {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(state.config.repair_period_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match repair_cycle(&state).await {
                Ok(report) if report.attempted > 0 => {
                    info!(
                        attempted = report.attempted,
                        repaired = report.repaired,
                        failed = report.failed,
                        "repair cycle complete"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "repair cycle failed"),
            }
        }
    });
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RepairReport {
    pub attempted: usize,
    pub repaired: usize,
    pub failed: usize,
}

/// One repair pass. Source selection round-robins over each chunk's
/// replica set so no single storage node serves every copy.
pub async fn repair_cycle(state: &AppState) -> Result<RepairReport> {
    let active = {
        let storage = state.storage.lock().await;
        storage.active()
    };
    if active.is_empty() {
        debug!("no active storage nodes, skipping repair");
        return Ok(RepairReport::default());
    }

    let active_ids: HashSet<NodeId> = active.iter().map(|n| n.node_id.clone()).collect();
    let chunks = state.store.live_chunks()?;
    let client = StorageClient::new(state.http.clone());
    let deadline = Duration::from_secs(state.config.write_deadline_secs);

    let mut tasks = Vec::new();

    for (round, chunk) in chunks.iter().enumerate() {
        let locations = state.store.live_locations_for_chunk(&chunk.chunk_id)?;
        let holders: Vec<&LocationRecord> = locations
            .iter()
            .filter(|location| active_ids.contains(&location.node_id))
            .collect();
        if holders.is_empty() {
            // every replica is on failed nodes; nothing to copy from yet
            continue;
        }

        let holder_ids: HashSet<&NodeId> =
            locations.iter().map(|location| &location.node_id).collect();
        let missing: Vec<&StorageNodeRecord> = active
            .iter()
            .filter(|node| !holder_ids.contains(&node.node_id))
            .collect();
        if missing.is_empty() {
            continue;
        }

        // rotate the source across chunks to spread copy load
        let source = holders[round % holders.len()];
        let source_address = {
            let storage = state.storage.lock().await;
            storage.get(&source.node_id).map(|record| record.address)
        };
        let Some(source_address) = source_address else {
            continue;
        };

        for target in missing {
            let client = client.clone();
            let state = state.clone();
            let chunk_id = chunk.chunk_id.clone();
            let source_address = source_address.clone();
            let target = (*target).clone();

            tasks.push(async move {
                let Ok(permit) = state.repair_gate.clone().acquire_owned().await else {
                    return false;
                };
                let outcome = client
                    .replicate_chunk(&target.address, &chunk_id, &source_address, deadline)
                    .await;
                drop(permit);

                match outcome {
                    Ok(()) => {
                        if let Err(err) = record_repaired_location(&state, &chunk_id, &target).await
                        {
                            warn!(chunk_id = %chunk_id, error = %err, "failed recording repaired location");
                            return false;
                        }
                        debug!(chunk_id = %chunk_id, target = %target.node_id, "chunk repaired");
                        true
                    }
                    Err(err) => {
                        // deferred to the next cycle
                        warn!(
                            chunk_id = %chunk_id,
                            target = %target.node_id,
                            error = %err,
                            "chunk replication failed"
                        );
                        false
                    }
                }
            });
        }
    }

    let attempted = tasks.len();
    let outcomes = join_all(tasks).await;
    let repaired = outcomes.iter().filter(|ok| **ok).count();

    Ok(RepairReport {
        attempted,
        repaired,
        failed: attempted - repaired,
    })
}

async fn record_repaired_location(
    state: &AppState,
    chunk_id: &str,
    target: &StorageNodeRecord,
) -> Result<()> {
    // Re-replication must causally dominate any earlier fact for the same
    // (chunk, node) pair, or a cleared location could never come back.
    let entity_id = LocationRecord::entity_id(chunk_id, &target.node_id);
    let (base_clock, version) = match state
        .store
        .get_entity(crate::model::EntityKind::ChunkLocation, &entity_id)?
    {
        Some(EntityPayload::ChunkLocation(previous)) => (previous.clock, previous.version + 1),
        _ => (VectorClock::new(), 1),
    };

    let location = LocationRecord {
        chunk_id: chunk_id.to_string(),
        node_id: target.node_id.clone(),
        discovered_at_ms: unix_ts_ms(),
        removed: false,
        clock: base_clock.incremented(state.node_id.as_str()),
        last_modified_by: state.node_id.to_string(),
        version,
    };

    let entry = state.gossip_entry(OpKind::Update, EntityPayload::ChunkLocation(location.clone()));
    state.store.record_location(&location, &entry)?;
    Ok(())
}
