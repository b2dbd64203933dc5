//! In-memory storage-node registry.
//!
//! The heartbeat handler is the only writer; every other loop reads
//! snapshots. Rows are written through to the metadata store so a restarted
//! node recovers its topology view.

use std::collections::HashMap;

use common::{unix_ts_ms, NodeId};

use crate::model::{StorageNodeRecord, StorageNodeStatus};

#[derive(Default)]
pub struct StorageRegistry {
    nodes: HashMap<NodeId, StorageNodeRecord>,
}

/// Result of folding one heartbeat into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Registered,
    Refreshed,
    Recovered,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(records: Vec<StorageNodeRecord>) -> Self {
        Self {
            nodes: records
                .into_iter()
                .map(|record| (record.node_id.clone(), record))
                .collect(),
        }
    }

    pub fn observe_heartbeat(
        &mut self,
        node_id: NodeId,
        address: String,
        capacity_bytes: u64,
        used_bytes: u64,
    ) -> (HeartbeatOutcome, StorageNodeRecord) {
        let now = unix_ts_ms();
        let outcome = match self.nodes.get(&node_id) {
            None => HeartbeatOutcome::Registered,
            Some(existing) if existing.status == StorageNodeStatus::Failed => {
                HeartbeatOutcome::Recovered
            }
            Some(_) => HeartbeatOutcome::Refreshed,
        };

        let record = StorageNodeRecord {
            node_id: node_id.clone(),
            address,
            last_heartbeat_ms: now,
            capacity_bytes,
            used_bytes,
            status: StorageNodeStatus::Active,
        };
        self.nodes.insert(node_id, record.clone());
        (outcome, record)
    }

    /// Apply a gossiped registry fact from a peer metadata node.
    pub fn absorb(&mut self, record: StorageNodeRecord) {
        match self.nodes.get(&record.node_id) {
            Some(existing) if existing.last_heartbeat_ms >= record.last_heartbeat_ms => {}
            _ => {
                self.nodes.insert(record.node_id.clone(), record);
            }
        }
    }

    /// Sweep for heartbeat timeouts. Returns the records whose status
    /// changed in either direction so callers can log and gossip them.
    pub fn sweep(&mut self, heartbeat_timeout_secs: u64) -> Vec<StorageNodeRecord> {
        let now = unix_ts_ms();
        let cutoff = now - (heartbeat_timeout_secs as i64) * 1000;
        let mut transitions = Vec::new();

        for record in self.nodes.values_mut() {
            let stale = record.last_heartbeat_ms < cutoff;
            match (stale, record.status) {
                (true, StorageNodeStatus::Active) => {
                    record.status = StorageNodeStatus::Failed;
                    transitions.push(record.clone());
                }
                (false, StorageNodeStatus::Failed) => {
                    record.status = StorageNodeStatus::Active;
                    transitions.push(record.clone());
                }
                _ => {}
            }
        }

        transitions
    }

    /// Nodes silent past the eviction horizon; candidates for removal.
    pub fn evictable(&self, eviction_secs: u64) -> Vec<StorageNodeRecord> {
        let cutoff = unix_ts_ms() - (eviction_secs as i64) * 1000;
        self.nodes
            .values()
            .filter(|record| record.last_heartbeat_ms < cutoff)
            .cloned()
            .collect()
    }

    pub fn remove(&mut self, node_id: &NodeId) -> Option<StorageNodeRecord> {
        self.nodes.remove(node_id)
    }

    pub fn get(&self, node_id: &NodeId) -> Option<StorageNodeRecord> {
        self.nodes.get(node_id).cloned()
    }

    pub fn all(&self) -> Vec<StorageNodeRecord> {
        let mut nodes: Vec<_> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// The placement target set: every active storage node. Full
    /// replication has no upper cap; fewer than all is a transient state
    /// the repair loop closes.
    pub fn active(&self) -> Vec<StorageNodeRecord> {
        let mut nodes: Vec<_> = self
            .nodes
            .values()
            .filter(|record| record.status == StorageNodeStatus::Active)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn is_active(&self, node_id: &NodeId) -> bool {
        self.nodes
            .get(node_id)
            .map(|record| record.status == StorageNodeStatus::Active)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(registry: &mut StorageRegistry, id: &str) -> HeartbeatOutcome {
        registry
            .observe_heartbeat(NodeId::from_string(id), "10.0.0.1:9000".to_string(), 1_000, 10)
            .0
    }

    #[test]
    fn first_heartbeat_registers_then_refreshes() {
        let mut registry = StorageRegistry::new();
        assert_eq!(heartbeat(&mut registry, "s1"), HeartbeatOutcome::Registered);
        assert_eq!(heartbeat(&mut registry, "s1"), HeartbeatOutcome::Refreshed);
        assert_eq!(registry.active().len(), 1);
    }

    #[test]
    fn sweep_fails_silent_nodes_and_recovers_on_heartbeat() {
        let mut registry = StorageRegistry::new();
        heartbeat(&mut registry, "s1");

        // backdate the heartbeat past the timeout
        let id = NodeId::from_string("s1");
        if let Some(record) = registry.nodes.get_mut(&id) {
            record.last_heartbeat_ms -= 60_000;
        }

        let transitions = registry.sweep(30);
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].status, StorageNodeStatus::Failed);
        assert!(registry.active().is_empty());
        assert!(!registry.is_active(&id));

        assert_eq!(heartbeat(&mut registry, "s1"), HeartbeatOutcome::Recovered);
        assert_eq!(registry.active().len(), 1);
    }

    #[test]
    fn sweep_is_quiet_when_nothing_changes() {
        let mut registry = StorageRegistry::new();
        heartbeat(&mut registry, "s1");
        assert!(registry.sweep(30).is_empty());
        assert!(registry.sweep(30).is_empty());
    }

    #[test]
    fn absorb_keeps_the_freshest_report() {
        let mut registry = StorageRegistry::new();
        let (_, record) = registry.observe_heartbeat(
            NodeId::from_string("s1"),
            "10.0.0.1:9000".to_string(),
            1_000,
            10,
        );

        let mut stale = record.clone();
        stale.last_heartbeat_ms -= 5_000;
        stale.status = StorageNodeStatus::Failed;
        registry.absorb(stale);
        assert!(registry.is_active(&NodeId::from_string("s1")));

        let mut fresh = record;
        fresh.last_heartbeat_ms += 5_000;
        fresh.used_bytes = 999;
        registry.absorb(fresh);
        assert_eq!(
            registry.get(&NodeId::from_string("s1")).unwrap().used_bytes,
            999
        );
    }

    #[test]
    fn evictable_spots_long_silent_nodes() {
        let mut registry = StorageRegistry::new();
        heartbeat(&mut registry, "s1");
        heartbeat(&mut registry, "s2");

        let id = NodeId::from_string("s1");
        if let Some(record) = registry.nodes.get_mut(&id) {
            record.last_heartbeat_ms -= 700_000;
        }

        let evictable = registry.evictable(600);
        assert_eq!(evictable.len(), 1);
        assert_eq!(evictable[0].node_id, id);
    }
}
