//! Replicated metadata entities and the gossip-log entry shape.
//!
//! Every payload travelling through gossip or anti-entropy is one of the
//! tagged variants below; the receiving side never sees free-form maps.

use std::collections::BTreeSet;

use common::NodeId;
use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    File,
    Tag,
    Chunk,
    ChunkLocation,
    StorageNode,
    Peer,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::User,
        EntityKind::File,
        EntityKind::Tag,
        EntityKind::Chunk,
        EntityKind::ChunkLocation,
        EntityKind::StorageNode,
        EntityKind::Peer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::File => "file",
            Self::Tag => "tag",
            Self::Chunk => "chunk",
            Self::ChunkLocation => "chunk_location",
            Self::StorageNode => "storage_node",
            Self::Peer => "peer",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Create,
    Update,
    SoftDelete,
    TombstoneTag,
    PeerRegister,
    HeartbeatRelay,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::SoftDelete => "soft_delete",
            Self::TombstoneTag => "tombstone_tag",
            Self::PeerRegister => "peer_register",
            Self::HeartbeatRelay => "heartbeat_relay",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [
            Self::Create,
            Self::Update,
            Self::SoftDelete,
            Self::TombstoneTag,
            Self::PeerRegister,
            Self::HeartbeatRelay,
        ]
        .into_iter()
        .find(|op| op.as_str() == raw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub username: String,
    pub password_hash: String,
    pub token: Option<String>,
    pub created_at_ms: i64,
    pub token_rotated_at_ms: Option<i64>,
    pub clock: VectorClock,
    pub last_modified_by: String,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: String,
    pub owner_id: String,
    pub name: String,
    pub size: u64,
    pub created_at_ms: i64,
    pub deleted: bool,
    pub deleted_at_ms: Option<i64>,
    pub clock: VectorClock,
    pub last_modified_by: String,
    pub version: i64,
}

/// One (file, tag) association. Removal leaves a tombstone so a removed tag
/// cannot resurrect through later anti-entropy exchanges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagRecord {
    pub file_id: String,
    pub tag: String,
    pub deleted: bool,
    pub stamp_ms: i64,
    pub clock: VectorClock,
    pub last_modified_by: String,
    pub version: i64,
}

impl TagRecord {
    pub fn entity_id(file_id: &str, tag: &str) -> String {
        format!("{file_id}/{tag}")
    }
}

/// Immutable once created; only its location set changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub file_id: String,
    pub ordinal: u32,
    pub size: u64,
    pub checksum: String,
    pub clock: VectorClock,
    pub last_modified_by: String,
    pub version: i64,
}

/// Assertion that a storage node holds a chunk. Removal is monotone: once a
/// location has been cleared it never re-enters through merges (repair
/// re-creates a fresh fact when the chunk is re-replicated).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub chunk_id: String,
    pub node_id: NodeId,
    pub discovered_at_ms: i64,
    pub removed: bool,
    pub clock: VectorClock,
    pub last_modified_by: String,
    pub version: i64,
}

impl LocationRecord {
    pub fn entity_id(chunk_id: &str, node_id: &NodeId) -> String {
        format!("{chunk_id}@{node_id}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageNodeStatus {
    Active,
    Failed,
}

impl StorageNodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "failed" => Self::Failed,
            _ => Self::Active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageNodeRecord {
    pub node_id: NodeId,
    pub address: String,
    pub last_heartbeat_ms: i64,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub status: StorageNodeStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub address: String,
    pub last_seen_ms: i64,
    pub clock_digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityPayload {
    User(UserRecord),
    File(FileRecord),
    Tag(TagRecord),
    Chunk(ChunkRecord),
    ChunkLocation(LocationRecord),
    StorageNode(StorageNodeRecord),
    Peer(PeerRecord),
}

impl EntityPayload {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::User(_) => EntityKind::User,
            Self::File(_) => EntityKind::File,
            Self::Tag(_) => EntityKind::Tag,
            Self::Chunk(_) => EntityKind::Chunk,
            Self::ChunkLocation(_) => EntityKind::ChunkLocation,
            Self::StorageNode(_) => EntityKind::StorageNode,
            Self::Peer(_) => EntityKind::Peer,
        }
    }

    pub fn entity_id(&self) -> String {
        match self {
            Self::User(record) => record.user_id.clone(),
            Self::File(record) => record.file_id.clone(),
            Self::Tag(record) => TagRecord::entity_id(&record.file_id, &record.tag),
            Self::Chunk(record) => record.chunk_id.clone(),
            Self::ChunkLocation(record) => {
                LocationRecord::entity_id(&record.chunk_id, &record.node_id)
            }
            Self::StorageNode(record) => record.node_id.to_string(),
            Self::Peer(record) => record.node_id.to_string(),
        }
    }

    /// Vector clock attached to the payload. Storage-node and peer records
    /// are registry facts reconciled by freshness, not causality; they carry
    /// no clock of their own.
    pub fn clock(&self) -> VectorClock {
        match self {
            Self::User(record) => record.clock.clone(),
            Self::File(record) => record.clock.clone(),
            Self::Tag(record) => record.clock.clone(),
            Self::Chunk(record) => record.clock.clone(),
            Self::ChunkLocation(record) => record.clock.clone(),
            Self::StorageNode(_) | Self::Peer(_) => VectorClock::new(),
        }
    }
}

/// One row of the replicated operation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipEntry {
    /// Local sequence; not replicated.
    #[serde(skip_serializing, default)]
    pub seq: i64,
    /// Globally unique id; makes re-application a no-op.
    pub op_id: String,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub op: OpKind,
    pub payload: EntityPayload,
    pub clock: VectorClock,
    pub emitted_at_ms: i64,
    #[serde(skip_serializing, default)]
    pub acked_by: BTreeSet<String>,
}

/// Wire form pushed between metadata nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipBatch {
    pub sender_id: NodeId,
    pub sender_address: String,
    pub entries: Vec<GossipEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_roundtrips_through_strings() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityKind::parse("nope"), None);
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let payload = EntityPayload::Tag(TagRecord {
            file_id: "f1".to_string(),
            tag: "alpha".to_string(),
            deleted: false,
            stamp_ms: 10,
            clock: VectorClock::new(),
            last_modified_by: "m1".to_string(),
            version: 1,
        });

        let encoded = serde_json::to_string(&payload).unwrap();
        assert!(encoded.contains("\"kind\":\"tag\""));

        let decoded: EntityPayload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.entity_id(), "f1/alpha");
        assert_eq!(decoded.kind(), EntityKind::Tag);
    }

    #[test]
    fn gossip_entry_wire_form_drops_local_fields() {
        let entry = GossipEntry {
            seq: 42,
            op_id: "op-1".to_string(),
            entity_kind: EntityKind::File,
            entity_id: "f1".to_string(),
            op: OpKind::Create,
            payload: EntityPayload::File(FileRecord {
                file_id: "f1".to_string(),
                owner_id: "u1".to_string(),
                name: "a.txt".to_string(),
                size: 3,
                created_at_ms: 1,
                deleted: false,
                deleted_at_ms: None,
                clock: VectorClock::new(),
                last_modified_by: "m1".to_string(),
                version: 1,
            }),
            clock: VectorClock::new(),
            emitted_at_ms: 1,
            acked_by: ["m2".to_string()].into_iter().collect(),
        };

        let encoded = serde_json::to_string(&entry).unwrap();
        assert!(!encoded.contains("acked_by"));
        assert!(!encoded.contains("\"seq\""));

        let decoded: GossipEntry = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.seq, 0);
        assert!(decoded.acked_by.is_empty());
        assert_eq!(decoded.op_id, "op-1");
    }
}
