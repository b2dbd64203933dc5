//! Storage-node health monitor: a periodic sweep over the registry that
//! fails nodes whose heartbeat went silent and reactivates them on fresh
//! reports. Transitions are logged, persisted, and gossiped so every
//! metadata node converges on the same liveness view; the read and
//! placement paths only ever consult the latest local snapshot.

use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::model::{EntityPayload, OpKind, StorageNodeStatus};
use crate::state::AppState;

pub fn spawn_health_loop(state: AppState) {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(state.config.health_period_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(err) = sweep_once(&state).await {
                warn!(error = %err, "storage health sweep failed");
            }
        }
    });
}

pub async fn sweep_once(state: &AppState) -> Result<usize> {
    let transitions = {
        let mut storage = state.storage.lock().await;
        storage.sweep(state.config.heartbeat_timeout_secs)
    };

    for record in &transitions {
        match record.status {
            StorageNodeStatus::Failed => {
                warn!(storage_node = %record.node_id, "storage node failed heartbeat timeout");
            }
            StorageNodeStatus::Active => {
                info!(storage_node = %record.node_id, "storage node recovered");
            }
        }

        state.store.upsert_storage_node(record)?;
        crate::gossip::emit(
            state,
            OpKind::HeartbeatRelay,
            EntityPayload::StorageNode(record.clone()),
        )?;
    }

    Ok(transitions.len())
}
