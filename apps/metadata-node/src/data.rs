//! Data-plane coordination: chunking, parallel write fan-out, ordered
//! reads, and delete fan-out. The metadata node is the coordinator; storage
//! nodes only store, serve, and copy blobs.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use common::checksum::checksum_hex;
use common::protocol::ChunkListing;
use common::{unix_ts_ms, NodeId};
use futures::future::join_all;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::model::{
    ChunkRecord, EntityKind, EntityPayload, FileRecord, LocationRecord, OpKind, StorageNodeRecord,
    TagRecord,
};
use crate::sn_client::StorageClient;
use crate::state::AppState;

#[derive(Debug)]
pub enum DataError {
    NoCapacity,
    Unavailable(String),
    Backpressure,
    Internal(anyhow::Error),
}

impl std::fmt::Display for DataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoCapacity => write!(f, "no storage available"),
            Self::Unavailable(what) => write!(f, "unavailable: {what}"),
            Self::Backpressure => write!(f, "write capacity exhausted, retry later"),
            Self::Internal(err) => write!(f, "internal error: {err}"),
        }
    }
}

impl std::error::Error for DataError {}

impl From<anyhow::Error> for DataError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

pub struct UploadOutcome {
    pub file: FileRecord,
    pub tags: Vec<String>,
    pub replaced_file_id: Option<String>,
}

/// Split a payload into fixed-size chunks with fresh ids and content
/// checksums. The ordinal sequence is contiguous from zero.
pub fn split_into_chunks(
    file_id: &str,
    payload: &Bytes,
    chunk_size: usize,
    node_id: &NodeId,
) -> Vec<(ChunkRecord, Bytes)> {
    let mut chunks = Vec::new();
    let mut offset = 0usize;
    let mut ordinal = 0u32;

    while offset < payload.len() || (payload.is_empty() && ordinal == 0) {
        let end = (offset + chunk_size).min(payload.len());
        let piece = payload.slice(offset..end);

        chunks.push((
            ChunkRecord {
                chunk_id: Uuid::new_v4().to_string(),
                file_id: file_id.to_string(),
                ordinal,
                size: piece.len() as u64,
                checksum: checksum_hex(&piece),
                clock: VectorClock::new().incremented(node_id.as_str()),
                last_modified_by: node_id.to_string(),
                version: 1,
            },
            piece,
        ));

        ordinal += 1;
        if end == payload.len() {
            break;
        }
        offset = end;
    }

    chunks
}

pub async fn upload_file(
    state: &AppState,
    owner_id: &str,
    name: &str,
    tags: Vec<String>,
    payload: Bytes,
) -> Result<UploadOutcome, DataError> {
    let targets = {
        let storage = state.storage.lock().await;
        storage.active()
    };
    if targets.is_empty() {
        return Err(DataError::NoCapacity);
    }

    // every target's write queue full means the node is saturated; reject
    // the write as transient instead of queueing unboundedly
    let mut saturated = true;
    for target in &targets {
        if state.write_gate(&target.node_id).await.available_permits() > 0 {
            saturated = false;
            break;
        }
    }
    if saturated {
        return Err(DataError::Backpressure);
    }

    let now = unix_ts_ms();
    let file_id = Uuid::new_v4().to_string();
    let chunks = split_into_chunks(&file_id, &payload, state.config.chunk_size_bytes, &state.node_id);
    let client = StorageClient::new(state.http.clone());
    let deadline = Duration::from_secs(state.config.write_deadline_secs);

    let mut locations: Vec<LocationRecord> = Vec::new();
    let mut written: Vec<(String, Vec<StorageNodeRecord>)> = Vec::new();

    for (chunk, piece) in &chunks {
        let listing = ChunkListing {
            chunk_id: chunk.chunk_id.clone(),
            file_id: chunk.file_id.clone(),
            ordinal: chunk.ordinal,
            size: chunk.size,
            checksum: chunk.checksum.clone(),
        };

        let writes = targets.iter().map(|target| {
            let client = client.clone();
            let listing = listing.clone();
            let piece = piece.clone();
            let target = target.clone();
            let state = state.clone();
            async move {
                let gate = state.write_gate(&target.node_id).await;
                let permit = match tokio::time::timeout(deadline, gate.acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    _ => return (target, Err(crate::sn_client::WriteChunkError::Unreachable(
                        anyhow::anyhow!("write slot unavailable within deadline"),
                    ))),
                };
                let outcome = client
                    .write_chunk(&target.address, &listing, piece, deadline)
                    .await;
                drop(permit);
                (target, outcome)
            }
        });

        let mut acked: Vec<StorageNodeRecord> = Vec::new();
        for (target, outcome) in join_all(writes).await {
            match outcome {
                Ok(()) => acked.push(target),
                Err(err) => {
                    warn!(
                        chunk_id = %chunk.chunk_id,
                        storage_node = %target.node_id,
                        error = %err,
                        "chunk write not acknowledged"
                    );
                }
            }
        }

        if acked.len() < state.config.min_write_acks {
            // compensate: best-effort removal of every blob this upload
            // placed, including earlier chunks
            written.push((chunk.chunk_id.clone(), acked));
            compensate_partial_upload(&client, &written).await;
            return Err(DataError::Unavailable(format!(
                "chunk {} reached {} of {} required acks",
                chunk.ordinal,
                written.last().map(|(_, a)| a.len()).unwrap_or(0),
                state.config.min_write_acks
            )));
        }

        for target in &acked {
            locations.push(LocationRecord {
                chunk_id: chunk.chunk_id.clone(),
                node_id: target.node_id.clone(),
                discovered_at_ms: now,
                removed: false,
                clock: VectorClock::new().incremented(state.node_id.as_str()),
                last_modified_by: state.node_id.to_string(),
                version: 1,
            });
        }
        written.push((chunk.chunk_id.clone(), acked));
    }

    let file = FileRecord {
        file_id: file_id.clone(),
        owner_id: owner_id.to_string(),
        name: name.to_string(),
        size: payload.len() as u64,
        created_at_ms: now,
        deleted: false,
        deleted_at_ms: None,
        clock: VectorClock::new().incremented(state.node_id.as_str()),
        last_modified_by: state.node_id.to_string(),
        version: 1,
    };

    let tag_records: Vec<TagRecord> = tags
        .iter()
        .map(|tag| TagRecord {
            file_id: file_id.clone(),
            tag: tag.clone(),
            deleted: false,
            stamp_ms: now,
            clock: VectorClock::new().incremented(state.node_id.as_str()),
            last_modified_by: state.node_id.to_string(),
            version: 1,
        })
        .collect();

    // Uploading a name the owner already holds replaces the previous file.
    let replaced = state
        .store
        .live_file_by_owner_and_name(owner_id, name)?
        .map(|mut previous| {
            previous.deleted = true;
            previous.deleted_at_ms = Some(now);
            previous.clock = previous.clock.incremented(state.node_id.as_str());
            previous.last_modified_by = state.node_id.to_string();
            previous.version += 1;
            previous
        });

    let chunk_records: Vec<ChunkRecord> = chunks.iter().map(|(chunk, _)| chunk.clone()).collect();

    let mut entries = vec![state.gossip_entry(OpKind::Create, EntityPayload::File(file.clone()))];
    for tag in &tag_records {
        entries.push(state.gossip_entry(OpKind::Create, EntityPayload::Tag(tag.clone())));
    }
    for chunk in &chunk_records {
        entries.push(state.gossip_entry(OpKind::Create, EntityPayload::Chunk(chunk.clone())));
    }
    for location in &locations {
        entries.push(state.gossip_entry(
            OpKind::Create,
            EntityPayload::ChunkLocation(location.clone()),
        ));
    }
    if let Some(previous) = &replaced {
        entries.push(state.gossip_entry(OpKind::SoftDelete, EntityPayload::File(previous.clone())));
    }

    state
        .store
        .commit_upload(
            &file,
            &tag_records,
            &chunk_records,
            &locations,
            replaced.as_ref(),
            &entries,
        )
        .map_err(DataError::Internal)?;

    info!(
        file_id = %file_id,
        name = %name,
        size = payload.len(),
        chunks = chunk_records.len(),
        replicas = targets.len(),
        "committed upload"
    );

    Ok(UploadOutcome {
        file,
        tags,
        replaced_file_id: replaced.map(|previous| previous.file_id),
    })
}

async fn compensate_partial_upload(
    client: &StorageClient,
    written: &[(String, Vec<StorageNodeRecord>)],
) {
    let deadline = Duration::from_secs(10);
    for (chunk_id, targets) in written {
        for target in targets {
            if let Err(err) = client.delete_chunk(&target.address, chunk_id, deadline).await {
                warn!(
                    chunk_id = %chunk_id,
                    storage_node = %target.node_id,
                    error = %err,
                    "compensating delete failed"
                );
            }
        }
    }
}

/// Assemble a file's bytes, trying healthy replicas before failed ones and
/// verifying each chunk's checksum on the way through.
pub async fn download_file(state: &AppState, file: &FileRecord) -> Result<Bytes, DataError> {
    let chunks = state.store.chunks_for_file(&file.file_id)?;
    let client = StorageClient::new(state.http.clone());
    let deadline = Duration::from_secs(state.config.read_deadline_secs);

    let mut assembled = BytesMut::with_capacity(file.size as usize);

    for chunk in &chunks {
        let locations = state.store.live_locations_for_chunk(&chunk.chunk_id)?;

        let ordered = {
            let storage = state.storage.lock().await;
            let mut healthy = Vec::new();
            let mut rest = Vec::new();
            for location in locations {
                match storage.get(&location.node_id) {
                    Some(record) if storage.is_active(&location.node_id) => {
                        healthy.push(record)
                    }
                    Some(record) => rest.push(record),
                    None => {}
                }
            }
            healthy.extend(rest);
            healthy
        };

        let mut payload = None;
        for target in &ordered {
            match client
                .read_chunk(&target.address, &chunk.chunk_id, &chunk.checksum, deadline)
                .await
            {
                Ok(bytes) => {
                    payload = Some(bytes);
                    break;
                }
                Err(err) => {
                    warn!(
                        chunk_id = %chunk.chunk_id,
                        storage_node = %target.node_id,
                        error = %err,
                        "chunk read failed, trying next replica"
                    );
                }
            }
        }

        match payload {
            Some(bytes) => assembled.extend_from_slice(&bytes),
            // holders may only be temporarily unreachable; keep the facts
            None => {
                return Err(DataError::Unavailable(format!(
                    "chunk {} of file {} has no reachable replica",
                    chunk.ordinal, file.file_id
                )))
            }
        }
    }

    Ok(assembled.freeze())
}

/// Tombstone the given files and fan out chunk deletes to their current
/// holders. Unacknowledged deletes are retried by the collector loop.
pub async fn delete_files(
    state: &AppState,
    files: Vec<FileRecord>,
) -> Result<Vec<String>, DataError> {
    if files.is_empty() {
        return Ok(Vec::new());
    }

    let now = unix_ts_ms();
    let mut tombstoned = Vec::new();
    let mut entries = Vec::new();
    let mut deleted_ids = Vec::new();

    for mut file in files {
        file.deleted = true;
        file.deleted_at_ms = Some(now);
        file.clock = file.clock.incremented(state.node_id.as_str());
        file.last_modified_by = state.node_id.to_string();
        file.version += 1;

        entries.push(state.gossip_entry(OpKind::SoftDelete, EntityPayload::File(file.clone())));
        deleted_ids.push(file.file_id.clone());
        tombstoned.push(file);
    }

    state
        .store
        .commit_mutations(&tombstoned, &[], &entries)
        .map_err(DataError::Internal)?;

    for file in &tombstoned {
        if let Err(err) = release_file_chunks(state, &file.file_id).await {
            warn!(file_id = %file.file_id, error = %err, "chunk delete fan-out incomplete");
        }
    }

    Ok(deleted_ids)
}

/// Best-effort delete of every replica of every chunk of a tombstoned file.
/// Each acknowledgement clears the matching location fact.
pub async fn release_file_chunks(state: &AppState, file_id: &str) -> anyhow::Result<usize> {
    let chunks = state.store.chunks_for_file(file_id)?;
    let client = StorageClient::new(state.http.clone());
    let deadline = Duration::from_secs(state.config.write_deadline_secs);
    let mut released = 0usize;

    for chunk in chunks {
        let locations = state.store.live_locations_for_chunk(&chunk.chunk_id)?;
        for location in locations {
            let address = {
                let storage = state.storage.lock().await;
                storage.get(&location.node_id).map(|record| record.address)
            };
            let Some(address) = address else { continue };

            match client.delete_chunk(&address, &chunk.chunk_id, deadline).await {
                Ok(_) => {
                    clear_location(state, &location).await?;
                    released += 1;
                }
                Err(err) => {
                    warn!(
                        chunk_id = %chunk.chunk_id,
                        storage_node = %location.node_id,
                        error = %err,
                        "chunk delete not acknowledged"
                    );
                }
            }
        }
    }

    Ok(released)
}

/// Fold a storage node's chunk listing into the location facts. Runs when
/// a node registers or recovers, covering blobs that survived a restart the
/// metadata layer had written off.
pub async fn reconcile_storage_listing(
    state: &AppState,
    node: &StorageNodeRecord,
) -> anyhow::Result<usize> {
    let client = StorageClient::new(state.http.clone());
    let deadline = Duration::from_secs(state.config.read_deadline_secs);
    let listings = client.list_chunks(&node.address, deadline).await?;

    let mut recorded = 0usize;
    for listing in listings {
        // only chunks the metadata layer knows become facts
        if state
            .store
            .get_entity(EntityKind::Chunk, &listing.chunk_id)?
            .is_none()
        {
            continue;
        }

        let entity_id = LocationRecord::entity_id(&listing.chunk_id, &node.node_id);
        let existing = state.store.get_entity(EntityKind::ChunkLocation, &entity_id)?;
        if matches!(&existing, Some(EntityPayload::ChunkLocation(fact)) if !fact.removed) {
            continue;
        }

        let (base_clock, version) = match existing {
            Some(EntityPayload::ChunkLocation(previous)) => {
                (previous.clock, previous.version + 1)
            }
            _ => (VectorClock::new(), 1),
        };

        let location = LocationRecord {
            chunk_id: listing.chunk_id.clone(),
            node_id: node.node_id.clone(),
            discovered_at_ms: unix_ts_ms(),
            removed: false,
            clock: base_clock.incremented(state.node_id.as_str()),
            last_modified_by: state.node_id.to_string(),
            version,
        };
        let entry =
            state.gossip_entry(OpKind::Update, EntityPayload::ChunkLocation(location.clone()));
        state.store.record_location(&location, &entry)?;
        recorded += 1;
    }

    if recorded > 0 {
        info!(
            storage_node = %node.node_id,
            recorded,
            "recovered location facts from storage listing"
        );
    }
    Ok(recorded)
}

/// Mark a location fact removed with a dominating clock and gossip the
/// clear.
pub(crate) async fn clear_location(
    state: &AppState,
    location: &LocationRecord,
) -> anyhow::Result<()> {
    let mut removed = location.clone();
    removed.removed = true;
    removed.clock = removed.clock.incremented(state.node_id.as_str());
    removed.last_modified_by = state.node_id.to_string();
    removed.version += 1;

    let entry = state.gossip_entry(OpKind::Update, EntityPayload::ChunkLocation(removed.clone()));
    state.store.record_location(&removed, &entry)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> NodeId {
        NodeId::from_string("m1")
    }

    #[test]
    fn chunking_splits_on_fixed_boundaries() {
        let payload = Bytes::from(vec![9u8; 9 * 1024 * 1024]);
        let chunks = split_into_chunks("f1", &payload, 4 * 1024 * 1024, &node());

        assert_eq!(chunks.len(), 3);
        let sizes: Vec<u64> = chunks.iter().map(|(c, _)| c.size).collect();
        assert_eq!(sizes, vec![4 * 1024 * 1024, 4 * 1024 * 1024, 1024 * 1024]);

        let ordinals: Vec<u32> = chunks.iter().map(|(c, _)| c.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[test]
    fn chunking_exact_multiple_has_no_empty_tail() {
        let payload = Bytes::from(vec![1u8; 8 * 1024]);
        let chunks = split_into_chunks("f1", &payload, 4 * 1024, &node());
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|(c, _)| c.size == 4 * 1024));
    }

    #[test]
    fn empty_payload_yields_single_empty_chunk() {
        let payload = Bytes::new();
        let chunks = split_into_chunks("f1", &payload, 4 * 1024, &node());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].0.size, 0);
    }

    #[test]
    fn chunk_checksums_cover_each_piece() {
        let payload = Bytes::from_static(b"0123456789");
        let chunks = split_into_chunks("f1", &payload, 4, &node());
        assert_eq!(chunks.len(), 3);
        for (record, piece) in &chunks {
            assert_eq!(record.checksum, checksum_hex(piece));
        }
        assert_ne!(chunks[0].0.checksum, chunks[1].0.checksum);
    }
}
