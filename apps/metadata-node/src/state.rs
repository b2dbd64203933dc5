use std::collections::HashMap;
use std::sync::Arc;

use common::{unix_ts_ms, NodeId};
use tokio::sync::{Mutex, Semaphore};

use crate::config::NodeConfig;
use crate::model::{EntityPayload, GossipEntry, OpKind};
use crate::peers::PeerRegistry;
use crate::registry::StorageRegistry;
use crate::store::MetaStore;

/// Shared handle every request handler and background loop operates on.
/// Registries are mutated only by their owning loop; everyone else takes
/// snapshots through the mutex.
#[derive(Clone)]
pub struct AppState {
    pub node_id: NodeId,
    pub advertise_addr: String,
    pub config: Arc<NodeConfig>,
    pub store: Arc<MetaStore>,
    pub peers: Arc<Mutex<PeerRegistry>>,
    pub storage: Arc<Mutex<StorageRegistry>>,
    write_gates: Arc<Mutex<HashMap<NodeId, Arc<Semaphore>>>>,
    pub repair_gate: Arc<Semaphore>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(
        node_id: NodeId,
        advertise_addr: String,
        config: NodeConfig,
        store: MetaStore,
        peers: PeerRegistry,
        storage: StorageRegistry,
    ) -> Self {
        let repair_gate = Arc::new(Semaphore::new(config.inflight_repairs));
        Self {
            node_id,
            advertise_addr,
            config: Arc::new(config),
            store: Arc::new(store),
            peers: Arc::new(Mutex::new(peers)),
            storage: Arc::new(Mutex::new(storage)),
            write_gates: Arc::new(Mutex::new(HashMap::new())),
            repair_gate,
            http: reqwest::Client::new(),
        }
    }

    /// Build a gossip-log entry for a locally originated mutation.
    pub fn gossip_entry(&self, op: OpKind, payload: EntityPayload) -> GossipEntry {
        GossipEntry {
            seq: 0,
            op_id: uuid::Uuid::new_v4().to_string(),
            entity_kind: payload.kind(),
            entity_id: payload.entity_id(),
            op,
            clock: payload.clock(),
            payload,
            emitted_at_ms: unix_ts_ms(),
            acked_by: Default::default(),
        }
    }

    /// Per-storage-node in-flight write cap.
    pub async fn write_gate(&self, node_id: &NodeId) -> Arc<Semaphore> {
        let mut gates = self.write_gates.lock().await;
        gates
            .entry(node_id.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.inflight_writes_per_sn)))
            .clone()
    }
}
