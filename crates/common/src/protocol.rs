//! Wire types shared between metadata and storage nodes.

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Header names carried alongside a framed chunk body.
pub const HDR_FILE_ID: &str = "x-redcloud-file-id";
pub const HDR_ORDINAL: &str = "x-redcloud-ordinal";
pub const HDR_SIZE: &str = "x-redcloud-size";
pub const HDR_CHECKSUM: &str = "x-redcloud-checksum";

/// Periodic report a storage node posts to any metadata node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: NodeId,
    pub address: String,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
}

/// One chunk as reported by a storage node's listing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkListing {
    pub chunk_id: String,
    pub file_id: String,
    pub ordinal: u32,
    pub size: u64,
    pub checksum: String,
}

/// Ask a storage node to copy a chunk from a peer storage node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateChunkRequest {
    pub source_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub address: String,
}

/// Response of the metadata-node peer listing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerListResponse {
    pub self_info: PeerInfo,
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPeerRequest {
    pub node_id: NodeId,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
}
