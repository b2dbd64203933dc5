//! Pull anti-entropy: periodically exchange vector-clock digests with one
//! random peer, push entities the local replica dominates or holds
//! concurrently, and pull entities the remote strictly dominates. This is
//! the liveness backstop when gossip pushes are lost.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use common::protocol::PeerInfo;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{Causality, VectorClock};
use crate::gossip::{apply_resolved, push_summary_entries};
use crate::model::{EntityKind, EntityPayload, OpKind};
use crate::state::AppState;

pub type StateSummary = BTreeMap<EntityKind, BTreeMap<String, VectorClock>>;

#[derive(Debug, Serialize, Deserialize)]
pub struct StateSummaryResponse {
    pub summary: StateSummary,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchEntitiesRequest {
    pub kind: EntityKind,
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchEntitiesResponse {
    pub payloads: Vec<EntityPayload>,
}

pub fn spawn_anti_entropy_loop(state: AppState) {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(state.config.anti_entropy_period_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(err) = anti_entropy_round(&state).await {
                warn!(error = %err, "anti-entropy round failed");
            }
        }
    });
}

pub async fn anti_entropy_round(state: &AppState) -> Result<()> {
    let Some(peer) = state.peers.lock().await.sample(1).into_iter().next() else {
        debug!("no peers for anti-entropy");
        return Ok(());
    };

    match sync_with_peer(state, &peer).await {
        Ok((pushed, pulled)) => {
            if pushed > 0 || pulled > 0 {
                info!(peer = %peer.node_id, pushed, pulled, "anti-entropy reconciled state");
            }
            state.peers.lock().await.touch(&peer.node_id);
            Ok(())
        }
        Err(err) => {
            warn!(peer = %peer.node_id, error = %err, "anti-entropy exchange failed");
            Ok(())
        }
    }
}

async fn sync_with_peer(state: &AppState, peer: &PeerInfo) -> Result<(usize, usize)> {
    let deadline = Duration::from_secs(state.config.anti_entropy_deadline_secs);

    let remote: StateSummaryResponse = state
        .http
        .get(format!(
            "http://{}/internal/gossip/state-summary",
            peer.address
        ))
        .timeout(deadline)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let local = state.store.state_summary()?;
    let (to_push, to_pull) = compute_deltas(&local, &remote.summary);

    let mut pulled = 0usize;
    for (kind, ids) in to_pull {
        let response: FetchEntitiesResponse = state
            .http
            .post(format!(
                "http://{}/internal/gossip/fetch-entities",
                peer.address
            ))
            .json(&FetchEntitiesRequest { kind, ids })
            .timeout(deadline)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        for payload in response.payloads {
            // Apply through the regular resolve path; a state change is a
            // first observation and must re-enter the push fanout. The
            // emitted payload is the post-merge row, not the raw remote one.
            if apply_resolved(state, &payload).await? {
                if let Some(current) = state
                    .store
                    .get_entity(payload.kind(), &payload.entity_id())?
                {
                    crate::gossip::emit(state, OpKind::Update, current)?;
                }
                pulled += 1;
            }
        }
    }

    let mut pushed = 0usize;
    for (kind, ids) in to_push {
        let payloads = state.store.fetch_entities(kind, &ids)?;
        pushed += payloads.len();
        push_summary_entries(state, peer, payloads).await?;
    }

    Ok((pushed, pulled))
}

/// Split the digest comparison into the two transfer directions:
/// `to_push` — entities where the local replica strictly dominates or is
/// concurrent; `to_pull` — entities where the remote strictly dominates
/// (or the local replica lacks the entity entirely).
pub fn compute_deltas(
    local: &StateSummary,
    remote: &StateSummary,
) -> (
    Vec<(EntityKind, Vec<String>)>,
    Vec<(EntityKind, Vec<String>)>,
) {
    let mut to_push = Vec::new();
    let mut to_pull = Vec::new();

    for kind in EntityKind::ALL {
        let empty = BTreeMap::new();
        let local_entries = local.get(&kind).unwrap_or(&empty);
        let remote_entries = remote.get(&kind).unwrap_or(&empty);

        let mut push_ids = Vec::new();
        let mut pull_ids = Vec::new();

        for (id, local_clock) in local_entries {
            match remote_entries.get(id) {
                None => push_ids.push(id.clone()),
                Some(remote_clock) => match local_clock.compare(remote_clock) {
                    Causality::After | Causality::Concurrent => push_ids.push(id.clone()),
                    Causality::Before => pull_ids.push(id.clone()),
                    Causality::Equal => {}
                },
            }
        }
        for id in remote_entries.keys() {
            if !local_entries.contains_key(id) {
                pull_ids.push(id.clone());
            }
        }

        if !push_ids.is_empty() {
            to_push.push((kind, push_ids));
        }
        if !pull_ids.is_empty() {
            to_pull.push((kind, pull_ids));
        }
    }

    (to_push, to_pull)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(kind: EntityKind, entries: &[(&str, VectorClock)]) -> StateSummary {
        let mut summary = StateSummary::new();
        summary.insert(
            kind,
            entries
                .iter()
                .map(|(id, clock)| (id.to_string(), clock.clone()))
                .collect(),
        );
        summary
    }

    #[test]
    fn identical_summaries_produce_no_deltas() {
        let clock = VectorClock::new().incremented("m1");
        let local = summary(EntityKind::File, &[("f1", clock.clone())]);
        let remote = summary(EntityKind::File, &[("f1", clock)]);

        let (to_push, to_pull) = compute_deltas(&local, &remote);
        assert!(to_push.is_empty());
        assert!(to_pull.is_empty());
    }

    #[test]
    fn missing_entities_flow_in_both_directions() {
        let clock = VectorClock::new().incremented("m1");
        let local = summary(EntityKind::File, &[("local-only", clock.clone())]);
        let remote = summary(EntityKind::File, &[("remote-only", clock)]);

        let (to_push, to_pull) = compute_deltas(&local, &remote);
        assert_eq!(to_push, vec![(EntityKind::File, vec!["local-only".to_string()])]);
        assert_eq!(to_pull, vec![(EntityKind::File, vec!["remote-only".to_string()])]);
    }

    #[test]
    fn dominance_decides_direction() {
        let older = VectorClock::new().incremented("m1");
        let newer = older.incremented("m1");

        let local = summary(EntityKind::User, &[("u1", newer.clone()), ("u2", older.clone())]);
        let remote = summary(EntityKind::User, &[("u1", older), ("u2", newer)]);

        let (to_push, to_pull) = compute_deltas(&local, &remote);
        assert_eq!(to_push, vec![(EntityKind::User, vec!["u1".to_string()])]);
        assert_eq!(to_pull, vec![(EntityKind::User, vec!["u2".to_string()])]);
    }

    #[test]
    fn concurrent_entities_are_pushed() {
        let left = VectorClock::new().incremented("m1");
        let right = VectorClock::new().incremented("m2");

        let local = summary(EntityKind::Tag, &[("f1/x", left)]);
        let remote = summary(EntityKind::Tag, &[("f1/x", right)]);

        let (to_push, to_pull) = compute_deltas(&local, &remote);
        assert_eq!(to_push.len(), 1);
        assert!(to_pull.is_empty());
    }

    #[test]
    fn summary_wire_shape_roundtrips() {
        let clock = VectorClock::new().incremented("m1");
        let response = StateSummaryResponse {
            summary: summary(EntityKind::ChunkLocation, &[("c1@s1", clock)]),
        };

        let encoded = serde_json::to_string(&response).unwrap();
        assert!(encoded.contains("chunk_location"));

        let decoded: StateSummaryResponse = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            decoded.summary[&EntityKind::ChunkLocation].len(),
            1
        );
    }
}
