//! Metadata-peer registry and DNS-alias bootstrap.
//!
//! At start a node resolves the metadata alias, asks every distinct address
//! for its identity and peer list, and registers itself there; the remote
//! side appends the registration to its gossip log so the whole cluster
//! learns about the newcomer. A refresh loop repeats the resolution, a TTL
//! sweep drops silent peers, and a reconciliation task repairs drift
//! between the in-memory registry and the persisted peer table.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use common::discovery::{resolve_service, resolve_service_lenient};
use common::protocol::{PeerInfo, PeerListResponse, RegisterPeerRequest};
use common::{unix_ts_ms, NodeId};
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::model::{EntityPayload, OpKind, PeerRecord};
use crate::state::AppState;

pub struct PeerRegistry {
    self_id: NodeId,
    self_addr: String,
    peers: HashMap<NodeId, PeerEntry>,
}

#[derive(Debug, Clone)]
struct PeerEntry {
    address: String,
    last_seen_ms: i64,
}

impl PeerRegistry {
    pub fn new(self_id: NodeId, self_addr: String) -> Self {
        Self {
            self_id,
            self_addr,
            peers: HashMap::new(),
        }
    }

    pub fn self_info(&self) -> PeerInfo {
        PeerInfo {
            node_id: self.self_id.clone(),
            address: self.self_addr.clone(),
        }
    }

    /// Insert or refresh a peer. Returns `true` when the peer was not known
    /// before, so registering the same peer twice stays a no-op.
    pub fn upsert(&mut self, node_id: NodeId, address: String) -> bool {
        if node_id == self.self_id {
            return false;
        }
        let now = unix_ts_ms();
        match self.peers.insert(
            node_id,
            PeerEntry {
                address,
                last_seen_ms: now,
            },
        ) {
            None => true,
            Some(_) => false,
        }
    }

    pub fn touch(&mut self, node_id: &NodeId) {
        if let Some(entry) = self.peers.get_mut(node_id) {
            entry.last_seen_ms = unix_ts_ms();
        }
    }

    pub fn remove(&mut self, node_id: &NodeId) -> bool {
        self.peers.remove(node_id).is_some()
    }

    pub fn all(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .peers
            .iter()
            .map(|(node_id, entry)| PeerInfo {
                node_id: node_id.clone(),
                address: entry.address.clone(),
            })
            .collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    pub fn records(&self) -> Vec<PeerRecord> {
        self.peers
            .iter()
            .map(|(node_id, entry)| PeerRecord {
                node_id: node_id.clone(),
                address: entry.address.clone(),
                last_seen_ms: entry.last_seen_ms,
                clock_digest: None,
            })
            .collect()
    }

    pub fn sample(&self, count: usize) -> Vec<PeerInfo> {
        let mut peers = self.all();
        let mut rng = rand::thread_rng();
        peers.shuffle(&mut rng);
        peers.truncate(count);
        peers
    }

    /// Drop peers not seen within the TTL. Returns the evicted ids.
    pub fn evict_stale(&mut self, ttl_secs: u64) -> Vec<NodeId> {
        let cutoff = unix_ts_ms() - (ttl_secs as i64) * 1000;
        let stale: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|(_, entry)| entry.last_seen_ms < cutoff)
            .map(|(node_id, _)| node_id.clone())
            .collect();
        for node_id in &stale {
            self.peers.remove(node_id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Raised when another node already advertises our address; starting up
/// anyway would corrupt vector-clock attribution, so the caller aborts.
#[derive(Debug)]
pub struct AddressCollision {
    pub address: String,
    pub holder: common::NodeId,
}

impl std::fmt::Display for AddressCollision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "address collision: {} already registered by {}",
            self.address, self.holder
        )
    }
}

impl std::error::Error for AddressCollision {}

/// Resolve the alias and introduce ourselves to every distinct address.
/// Fails hard when an explicitly configured alias does not resolve, or when
/// some peer already advertises our address under a different node id.
pub async fn bootstrap(state: &AppState) -> Result<()> {
    let alias = &state.config.metadata_alias;
    let addresses = match resolve_service(alias, state.config.metadata_port).await {
        Ok(addresses) => addresses,
        Err(err) if state.config.alias_explicit => {
            return Err(err).context("metadata alias unresolvable at startup");
        }
        Err(err) => {
            warn!(alias = %alias, error = %err, "metadata alias unresolvable, starting solo");
            return Ok(());
        }
    };

    for address in addresses {
        if address == state.advertise_addr {
            continue;
        }
        if let Err(err) = introduce_to(state, &address).await {
            if err.downcast_ref::<AddressCollision>().is_some() {
                return Err(err);
            }
            debug!(peer = %address, error = %err, "bootstrap introduction failed");
        }
    }

    let known = state.peers.lock().await.len();
    info!(peers = known, "peer bootstrap complete");
    Ok(())
}

async fn introduce_to(state: &AppState, address: &str) -> Result<()> {
    let listing: PeerListResponse = state
        .http
        .get(format!("http://{address}/internal/peers"))
        .timeout(Duration::from_secs(5))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    if listing.self_info.address == state.advertise_addr
        && listing.self_info.node_id != state.node_id
    {
        return Err(AddressCollision {
            address: state.advertise_addr.clone(),
            holder: listing.self_info.node_id,
        }
        .into());
    }

    {
        let mut peers = state.peers.lock().await;
        peers.upsert(
            listing.self_info.node_id.clone(),
            listing.self_info.address.clone(),
        );
        for peer in listing.peers {
            if peer.node_id != state.node_id {
                peers.upsert(peer.node_id, peer.address);
            }
        }
    }

    state
        .http
        .post(format!("http://{address}/internal/peers/register"))
        .timeout(Duration::from_secs(5))
        .json(&RegisterPeerRequest {
            node_id: state.node_id.clone(),
            address: state.advertise_addr.clone(),
        })
        .send()
        .await?
        .error_for_status()?;

    info!(peer = %address, "registered with peer");
    Ok(())
}

/// Periodic DNS refresh plus TTL eviction.
pub fn spawn_refresh_loop(state: AppState) {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(state.config.peer_refresh_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // skip the immediate tick; bootstrap just ran
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let addresses = resolve_service_lenient(
                &state.config.metadata_alias,
                state.config.metadata_port,
            )
            .await;

            let known: Vec<String> = {
                let peers = state.peers.lock().await;
                peers.all().into_iter().map(|p| p.address).collect()
            };

            for address in addresses {
                if address == state.advertise_addr || known.contains(&address) {
                    continue;
                }
                if let Err(err) = introduce_to(&state, &address).await {
                    debug!(peer = %address, error = %err, "peer refresh introduction failed");
                }
            }

            let evicted = {
                let mut peers = state.peers.lock().await;
                peers.evict_stale(state.config.peer_ttl_secs)
            };
            for node_id in evicted {
                info!(peer = %node_id, "evicted silent metadata peer");
            }
        }
    });
}

/// Repair drift between the in-memory registry and the persisted peer
/// table, in both directions.
pub fn spawn_reconcile_loop(state: AppState) {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(state.config.peer_reconcile_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(err) = reconcile_once(&state).await {
                warn!(error = %err, "peer reconciliation failed");
            }
        }
    });
}

pub async fn reconcile_once(state: &AppState) -> Result<()> {
    let persisted = state.store.all_peers()?;
    let cutoff = unix_ts_ms() - (state.config.peer_ttl_secs as i64) * 1000;

    let mut peers = state.peers.lock().await;

    // db -> memory: resurrect rows the registry lost (e.g. after restart)
    for record in &persisted {
        if record.node_id != state.node_id && record.last_seen_ms >= cutoff {
            peers.upsert(record.node_id.clone(), record.address.clone());
        }
    }

    // memory -> db: persist the live view, drop expired rows
    for record in peers.records() {
        state.store.upsert_peer(&record)?;
    }
    for record in persisted {
        if record.last_seen_ms < cutoff {
            state.store.remove_peer(&record.node_id)?;
        }
    }

    Ok(())
}

/// Handle a registration from another metadata node: update the registry,
/// persist, and gossip the fact so every node converges on the membership.
pub async fn register_peer(state: &AppState, node_id: NodeId, address: String) -> Result<bool> {
    if node_id == state.node_id {
        return Ok(false);
    }

    let newly_added = {
        let mut peers = state.peers.lock().await;
        let added = peers.upsert(node_id.clone(), address.clone());
        peers.touch(&node_id);
        added
    };

    let record = PeerRecord {
        node_id: node_id.clone(),
        address,
        last_seen_ms: unix_ts_ms(),
        clock_digest: None,
    };
    state.store.upsert_peer(&record)?;

    if newly_added {
        let entry = state.gossip_entry(OpKind::PeerRegister, EntityPayload::Peer(record));
        state.store.append_entry(&entry)?;
        info!(peer = %node_id, "registered metadata peer");
    }

    Ok(newly_added)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PeerRegistry {
        PeerRegistry::new(NodeId::from_string("m1"), "10.0.0.1:8000".to_string())
    }

    #[test]
    fn registering_same_peer_twice_is_noop() {
        let mut peers = registry();
        assert!(peers.upsert(NodeId::from_string("m2"), "10.0.0.2:8000".to_string()));
        assert!(!peers.upsert(NodeId::from_string("m2"), "10.0.0.2:8000".to_string()));
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn self_is_never_a_peer() {
        let mut peers = registry();
        assert!(!peers.upsert(NodeId::from_string("m1"), "10.0.0.1:8000".to_string()));
        assert!(peers.is_empty());
    }

    #[test]
    fn sample_is_bounded_and_distinct() {
        let mut peers = registry();
        for i in 2..=6 {
            peers.upsert(
                NodeId::from_string(&format!("m{i}")),
                format!("10.0.0.{i}:8000"),
            );
        }

        let sampled = peers.sample(2);
        assert_eq!(sampled.len(), 2);
        assert_ne!(sampled[0].node_id, sampled[1].node_id);

        // asking for more than exist returns everyone
        assert_eq!(peers.sample(50).len(), 5);
    }

    #[test]
    fn stale_peers_are_evicted() {
        let mut peers = registry();
        peers.upsert(NodeId::from_string("m2"), "10.0.0.2:8000".to_string());
        peers
            .peers
            .get_mut(&NodeId::from_string("m2"))
            .unwrap()
            .last_seen_ms -= 600_000;

        let evicted = peers.evict_stale(300);
        assert_eq!(evicted, vec![NodeId::from_string("m2")]);
        assert!(peers.is_empty());
    }
}
