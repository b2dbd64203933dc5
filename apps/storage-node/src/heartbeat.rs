use std::sync::Arc;
use std::time::Duration;

use common::discovery::resolve_service_lenient;
use common::protocol::HeartbeatRequest;
use tracing::{debug, warn};

use crate::NodeState;

/// Periodically announces this node to the metadata service.
///
/// The request goes to the DNS alias; round-robin resolution picks one
/// metadata node, which relays the registration to its peers via gossip.
pub fn spawn_heartbeat_loop(state: Arc<NodeState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(state.config.heartbeat_period_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(err) = send_heartbeat(&state).await {
                warn!(error = %err, "heartbeat delivery failed");
            }
        }
    });
}

async fn send_heartbeat(state: &NodeState) -> anyhow::Result<()> {
    let used_bytes = state.store.used_bytes().await.unwrap_or(0);

    let request = HeartbeatRequest {
        node_id: state.node_id.clone(),
        address: state.advertise_addr.clone(),
        capacity_bytes: state.config.capacity_bytes,
        used_bytes,
    };

    let targets = if let Some(addr) = &state.config.metadata_addr_override {
        vec![addr.clone()]
    } else {
        resolve_service_lenient(&state.config.metadata_alias, state.config.metadata_port).await
    };

    if targets.is_empty() {
        warn!(alias = %state.config.metadata_alias, "no metadata node resolvable for heartbeat");
        return Ok(());
    }

    let mut last_err = None;
    for target in targets {
        let url = format!("http://{target}/internal/storage/heartbeat");
        let send = state
            .http
            .post(&url)
            .json(&request)
            .timeout(Duration::from_secs(state.config.heartbeat_deadline_secs))
            .send()
            .await;

        match send {
            Ok(response) if response.status().is_success() => {
                debug!(target = %target, used_bytes, "heartbeat delivered");
                return Ok(());
            }
            Ok(response) => last_err = Some(anyhow::anyhow!("status {}", response.status())),
            Err(err) => last_err = Some(err.into()),
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no heartbeat target accepted the report")))
}
