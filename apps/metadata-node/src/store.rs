//! Per-node relational metadata store.
//!
//! A single SQLite connection behind a mutex is the node's serialization
//! point. Multi-row changes (file + tags + chunk descriptors + location
//! facts + gossip-log appends) commit in one transaction; background loops
//! and request handlers otherwise read committed snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use common::NodeId;
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::clock::VectorClock;
use crate::model::{
    ChunkRecord, EntityKind, EntityPayload, FileRecord, GossipEntry, LocationRecord, OpKind,
    PeerRecord, StorageNodeRecord, StorageNodeStatus, TagRecord, UserRecord,
};

pub struct MetaStore {
    conn: Mutex<Connection>,
}

impl MetaStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open metadata store {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                token TEXT,
                created_at_ms INTEGER NOT NULL,
                token_rotated_at_ms INTEGER,
                vector_clock TEXT NOT NULL DEFAULT '{}',
                last_modified_by TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS files (
                file_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                size INTEGER NOT NULL,
                created_at_ms INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                deleted_at_ms INTEGER,
                vector_clock TEXT NOT NULL DEFAULT '{}',
                last_modified_by TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_files_owner_name ON files(owner_id, name);

            CREATE TABLE IF NOT EXISTS tags (
                file_id TEXT NOT NULL,
                tag TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                stamp_ms INTEGER NOT NULL,
                vector_clock TEXT NOT NULL DEFAULT '{}',
                last_modified_by TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (file_id, tag)
            );
            CREATE INDEX IF NOT EXISTS idx_tags_tag ON tags(tag);

            CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT PRIMARY KEY,
                file_id TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                size INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                vector_clock TEXT NOT NULL DEFAULT '{}',
                last_modified_by TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                UNIQUE (file_id, ordinal)
            );

            CREATE TABLE IF NOT EXISTS chunk_locations (
                chunk_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                discovered_at_ms INTEGER NOT NULL,
                removed INTEGER NOT NULL DEFAULT 0,
                vector_clock TEXT NOT NULL DEFAULT '{}',
                last_modified_by TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (chunk_id, node_id)
            );

            CREATE TABLE IF NOT EXISTS storage_nodes (
                node_id TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                last_heartbeat_ms INTEGER NOT NULL,
                capacity_bytes INTEGER NOT NULL DEFAULT 0,
                used_bytes INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active'
            );

            CREATE TABLE IF NOT EXISTS metadata_peers (
                node_id TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                last_seen_ms INTEGER NOT NULL,
                clock_digest TEXT
            );

            CREATE TABLE IF NOT EXISTS gossip_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                op_id TEXT UNIQUE NOT NULL,
                entity_kind TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                op TEXT NOT NULL,
                payload TEXT NOT NULL,
                vector_clock TEXT NOT NULL,
                emitted_at_ms INTEGER NOT NULL,
                acked_by TEXT NOT NULL DEFAULT '[]'
            );
            "#,
        )
        .context("metadata store schema init failed; store may be corrupt")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- users ---

    pub fn create_user(&self, user: &UserRecord, entry: &GossipEntry) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO users
             (user_id, username, password_hash, token, created_at_ms, token_rotated_at_ms,
              vector_clock, last_modified_by, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                user.user_id,
                user.username,
                user.password_hash,
                user.token,
                user.created_at_ms,
                user.token_rotated_at_ms,
                user.clock.to_json(),
                user.last_modified_by,
                user.version,
            ],
        )?;

        if inserted == 0 {
            return Ok(false);
        }

        append_entry(&tx, entry)?;
        tx.commit()?;
        Ok(true)
    }

    pub fn update_user(&self, user: &UserRecord, entry: &GossipEntry) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        upsert_user(&tx, user)?;
        append_entry(&tx, entry)?;
        tx.commit()?;
        Ok(())
    }

    pub fn user_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        let conn = self.lock();
        conn.query_row(
            &format!("{USER_SELECT} WHERE username = ?1"),
            params![username],
            user_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn user_by_token(&self, token: &str) -> Result<Option<UserRecord>> {
        let conn = self.lock();
        conn.query_row(
            &format!("{USER_SELECT} WHERE token = ?1"),
            params![token],
            user_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    // --- files / uploads ---

    /// Atomic commit of a client upload: the file record, its tag set, all
    /// chunk descriptors, the location facts observed during fan-out, the
    /// optional soft-delete of a replaced same-name file, and one gossip
    /// entry per touched entity.
    #[allow(clippy::too_many_arguments)]
    pub fn commit_upload(
        &self,
        file: &FileRecord,
        tags: &[TagRecord],
        chunks: &[ChunkRecord],
        locations: &[LocationRecord],
        replaced: Option<&FileRecord>,
        entries: &[GossipEntry],
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        upsert_file(&tx, file)?;
        for tag in tags {
            upsert_tag(&tx, tag)?;
        }
        for chunk in chunks {
            upsert_chunk(&tx, chunk)?;
        }
        for location in locations {
            upsert_location(&tx, location)?;
        }
        if let Some(previous) = replaced {
            upsert_file(&tx, previous)?;
        }
        for entry in entries {
            append_entry(&tx, entry)?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn file_by_id(&self, file_id: &str) -> Result<Option<FileRecord>> {
        let conn = self.lock();
        conn.query_row(
            &format!("{FILE_SELECT} WHERE file_id = ?1"),
            params![file_id],
            file_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn live_file_by_owner_and_name(
        &self,
        owner_id: &str,
        name: &str,
    ) -> Result<Option<FileRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{FILE_SELECT} WHERE owner_id = ?1 AND name = ?2 AND deleted = 0
             ORDER BY created_at_ms DESC, last_modified_by DESC, file_id DESC LIMIT 1"
        ))?;
        stmt.query_row(params![owner_id, name], file_from_row)
            .optional()
            .map_err(Into::into)
    }

    /// Files owned by `owner_id` carrying every tag in `tags` (AND query).
    /// Soft-deleted files and tombstoned tags never match.
    pub fn files_by_tags(&self, owner_id: &str, tags: &[String]) -> Result<Vec<FileRecord>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.lock();
        let placeholders = std::iter::repeat("?")
            .take(tags.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "{FILE_SELECT} WHERE owner_id = ? AND deleted = 0 AND file_id IN (
                 SELECT file_id FROM tags
                 WHERE deleted = 0 AND tag IN ({placeholders})
                 GROUP BY file_id
                 HAVING COUNT(DISTINCT tag) = ?
             )
             ORDER BY name, created_at_ms"
        );

        let mut stmt = conn.prepare(&sql)?;
        let mut bind: Vec<&dyn rusqlite::ToSql> = vec![&owner_id];
        for tag in tags {
            bind.push(tag);
        }
        let expected = tags.len() as i64;
        bind.push(&expected);

        let rows = stmt.query_map(bind.as_slice(), file_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn live_tags_for_file(&self, file_id: &str) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT tag FROM tags WHERE file_id = ?1 AND deleted = 0 ORDER BY tag",
        )?;
        let rows = stmt.query_map(params![file_id], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn live_tag_count(&self, file_id: &str) -> Result<usize> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tags WHERE file_id = ?1 AND deleted = 0",
            params![file_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Apply a batch of tag/file mutations plus their gossip entries in one
    /// transaction (add-tags, remove-tags, delete-by-tags paths).
    pub fn commit_mutations(
        &self,
        files: &[FileRecord],
        tags: &[TagRecord],
        entries: &[GossipEntry],
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for file in files {
            upsert_file(&tx, file)?;
        }
        for tag in tags {
            upsert_tag(&tx, tag)?;
        }
        for entry in entries {
            append_entry(&tx, entry)?;
        }
        tx.commit()?;
        Ok(())
    }

    // --- chunks / locations ---

    pub fn chunks_for_file(&self, file_id: &str) -> Result<Vec<ChunkRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{CHUNK_SELECT} WHERE file_id = ?1 ORDER BY ordinal"
        ))?;
        let rows = stmt.query_map(params![file_id], chunk_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Chunks whose owning file is not tombstoned; the repair loop's work
    /// list.
    pub fn live_chunks(&self) -> Result<Vec<ChunkRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{CHUNK_SELECT} WHERE file_id IN (SELECT file_id FROM files WHERE deleted = 0)
             ORDER BY chunk_id"
        ))?;
        let rows = stmt.query_map([], chunk_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn live_locations_for_chunk(&self, chunk_id: &str) -> Result<Vec<LocationRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{LOCATION_SELECT} WHERE chunk_id = ?1 AND removed = 0 ORDER BY node_id"
        ))?;
        let rows = stmt.query_map(params![chunk_id], location_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn record_location(&self, location: &LocationRecord, entry: &GossipEntry) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        upsert_location(&tx, location)?;
        append_entry(&tx, entry)?;
        tx.commit()?;
        Ok(())
    }

    /// Location facts still naming `node_id` (input to storage-node
    /// eviction, which clears them one by one so the clears gossip with
    /// proper clocks).
    pub fn live_locations_for_node(&self, node_id: &NodeId) -> Result<Vec<LocationRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{LOCATION_SELECT} WHERE node_id = ?1 AND removed = 0 ORDER BY chunk_id"
        ))?;
        let rows = stmt.query_map(params![node_id.as_str()], location_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn delete_chunk_descriptor(&self, chunk_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM chunk_locations WHERE chunk_id = ?1", params![chunk_id])?;
        conn.execute("DELETE FROM chunks WHERE chunk_id = ?1", params![chunk_id])?;
        Ok(())
    }

    /// Tombstoned files older than the retention cutoff (ms). A cutoff of
    /// `i64::MAX` matches every tombstone.
    pub fn tombstoned_files(&self, cutoff_ms: i64) -> Result<Vec<FileRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{FILE_SELECT} WHERE deleted = 1 AND COALESCE(deleted_at_ms, 0) <= ?1
             ORDER BY file_id"
        ))?;
        let rows = stmt.query_map(params![cutoff_ms], file_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn purge_file(&self, file_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM tags WHERE file_id = ?1", params![file_id])?;
        conn.execute("DELETE FROM files WHERE file_id = ?1", params![file_id])?;
        Ok(())
    }

    // --- storage-node registry persistence ---

    pub fn upsert_storage_node(&self, record: &StorageNodeRecord) -> Result<()> {
        let conn = self.lock();
        upsert_storage_node_row(&conn, record)?;
        Ok(())
    }

    pub fn all_storage_nodes(&self) -> Result<Vec<StorageNodeRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT node_id, address, last_heartbeat_ms, capacity_bytes, used_bytes, status
             FROM storage_nodes ORDER BY node_id",
        )?;
        let rows = stmt.query_map([], storage_node_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn remove_storage_node(&self, node_id: &NodeId) -> Result<bool> {
        let conn = self.lock();
        let removed = conn.execute(
            "DELETE FROM storage_nodes WHERE node_id = ?1",
            params![node_id.as_str()],
        )?;
        Ok(removed > 0)
    }

    // --- peer registry persistence ---

    pub fn upsert_peer(&self, peer: &PeerRecord) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO metadata_peers (node_id, address, last_seen_ms, clock_digest)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(node_id) DO UPDATE SET
                 address = excluded.address,
                 last_seen_ms = excluded.last_seen_ms,
                 clock_digest = excluded.clock_digest",
            params![
                peer.node_id.as_str(),
                peer.address,
                peer.last_seen_ms,
                peer.clock_digest
            ],
        )?;
        Ok(())
    }

    pub fn all_peers(&self) -> Result<Vec<PeerRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT node_id, address, last_seen_ms, clock_digest
             FROM metadata_peers ORDER BY node_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PeerRecord {
                node_id: NodeId::from_string(row.get::<_, String>(0)?),
                address: row.get(1)?,
                last_seen_ms: row.get(2)?,
                clock_digest: row.get(3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn remove_peer(&self, node_id: &NodeId) -> Result<bool> {
        let conn = self.lock();
        let removed = conn.execute(
            "DELETE FROM metadata_peers WHERE node_id = ?1",
            params![node_id.as_str()],
        )?;
        Ok(removed > 0)
    }

    // --- gossip log ---

    pub fn append_entry(&self, entry: &GossipEntry) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        append_entry(&tx, entry)?;
        tx.commit()?;
        Ok(())
    }

    /// Record a remotely observed entry. Returns `false` when the op id was
    /// already known, making duplicate delivery a no-op.
    pub fn record_remote_entry(&self, entry: &GossipEntry, sender: &NodeId) -> Result<bool> {
        let conn = self.lock();
        let mut acked: BTreeSet<String> = entry.acked_by.clone();
        acked.insert(sender.to_string());

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO gossip_log
             (op_id, entity_kind, entity_id, op, payload, vector_clock, emitted_at_ms, acked_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.op_id,
                entry.entity_kind.as_str(),
                entry.entity_id,
                entry.op.as_str(),
                serde_json::to_string(&entry.payload)?,
                entry.clock.to_json(),
                entry.emitted_at_ms,
                serde_json::to_string(&acked)?,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Entries not yet acknowledged by `peer_id`, oldest first, bounded by
    /// the per-call cap.
    pub fn pending_entries_for_peer(&self, peer_id: &NodeId, cap: usize) -> Result<Vec<GossipEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, op_id, entity_kind, entity_id, op, payload, vector_clock,
                    emitted_at_ms, acked_by
             FROM gossip_log ORDER BY seq",
        )?;
        let rows = stmt.query_map([], entry_from_row)?;

        let mut pending = Vec::new();
        for row in rows {
            let entry = row?;
            if !entry.acked_by.contains(peer_id.as_str()) {
                pending.push(entry);
                if pending.len() >= cap {
                    break;
                }
            }
        }
        Ok(pending)
    }

    pub fn mark_entries_acked(&self, op_ids: &[String], peer_id: &NodeId) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for op_id in op_ids {
            let acked_raw: Option<String> = tx
                .query_row(
                    "SELECT acked_by FROM gossip_log WHERE op_id = ?1",
                    params![op_id],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(raw) = acked_raw {
                let mut acked: BTreeSet<String> =
                    serde_json::from_str(&raw).unwrap_or_default();
                if acked.insert(peer_id.to_string()) {
                    tx.execute(
                        "UPDATE gossip_log SET acked_by = ?1 WHERE op_id = ?2",
                        params![serde_json::to_string(&acked)?, op_id],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn gossip_log_len(&self) -> Result<usize> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM gossip_log", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // --- entity access for gossip apply / anti-entropy ---

    pub fn get_entity(&self, kind: EntityKind, entity_id: &str) -> Result<Option<EntityPayload>> {
        let conn = self.lock();
        get_entity_inner(&conn, kind, entity_id)
    }

    pub fn apply_payload(&self, payload: &EntityPayload) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        apply_payload_inner(&tx, payload)?;
        tx.commit()?;
        Ok(())
    }

    pub fn fetch_entities(&self, kind: EntityKind, ids: &[String]) -> Result<Vec<EntityPayload>> {
        let conn = self.lock();
        let mut payloads = Vec::new();
        for id in ids {
            if let Some(payload) = get_entity_inner(&conn, kind, id)? {
                payloads.push(payload);
            }
        }
        Ok(payloads)
    }

    /// Vector-clock digest of every replicated entity, keyed by kind then
    /// entity id; the anti-entropy wire summary.
    pub fn state_summary(&self) -> Result<BTreeMap<EntityKind, BTreeMap<String, VectorClock>>> {
        let conn = self.lock();
        let mut summary = BTreeMap::new();

        let mut per_kind = |kind: EntityKind, sql: &str| -> Result<()> {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    VectorClock::from_json(&row.get::<_, String>(1)?),
                ))
            })?;
            let entries: BTreeMap<String, VectorClock> =
                rows.collect::<rusqlite::Result<_>>()?;
            summary.insert(kind, entries);
            Ok(())
        };

        per_kind(EntityKind::User, "SELECT user_id, vector_clock FROM users")?;
        per_kind(EntityKind::File, "SELECT file_id, vector_clock FROM files")?;
        per_kind(
            EntityKind::Tag,
            "SELECT file_id || '/' || tag, vector_clock FROM tags",
        )?;
        per_kind(EntityKind::Chunk, "SELECT chunk_id, vector_clock FROM chunks")?;
        per_kind(
            EntityKind::ChunkLocation,
            "SELECT chunk_id || '@' || node_id, vector_clock FROM chunk_locations",
        )?;
        Ok(summary)
    }

    /// Deterministic repair of duplicate live (owner, name) pairs after a
    /// partition merge: every replica keeps the same winner visible and
    /// soft-deletes the rest. Returns the losers that were tombstoned.
    pub fn reconcile_name_collision(&self, owner_id: &str, name: &str) -> Result<Vec<FileRecord>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let mut duplicates: Vec<FileRecord> = {
            let mut stmt = tx.prepare(&format!(
                "{FILE_SELECT} WHERE owner_id = ?1 AND name = ?2 AND deleted = 0"
            ))?;
            let rows = stmt.query_map(params![owner_id, name], file_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        if duplicates.len() <= 1 {
            return Ok(Vec::new());
        }

        duplicates.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| b.last_modified_by.cmp(&a.last_modified_by))
                .then_with(|| b.file_id.cmp(&a.file_id))
        });

        let tombstone_stamp = duplicates
            .iter()
            .map(|f| f.created_at_ms)
            .max()
            .unwrap_or(0);

        let mut losers = Vec::new();
        for loser in duplicates.into_iter().skip(1) {
            let mut tombstoned = loser.clone();
            tombstoned.deleted = true;
            tombstoned.deleted_at_ms = Some(tombstone_stamp);
            upsert_file(&tx, &tombstoned)?;
            losers.push(tombstoned);
        }

        tx.commit()?;
        Ok(losers)
    }
}

// --- row helpers ---

const USER_SELECT: &str = "SELECT user_id, username, password_hash, token, created_at_ms,
    token_rotated_at_ms, vector_clock, last_modified_by, version FROM users";

const FILE_SELECT: &str = "SELECT file_id, owner_id, name, size, created_at_ms, deleted,
    deleted_at_ms, vector_clock, last_modified_by, version FROM files";

const CHUNK_SELECT: &str = "SELECT chunk_id, file_id, ordinal, size, checksum, vector_clock,
    last_modified_by, version FROM chunks";

const LOCATION_SELECT: &str = "SELECT chunk_id, node_id, discovered_at_ms, removed,
    vector_clock, last_modified_by, version FROM chunk_locations";

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        user_id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        token: row.get(3)?,
        created_at_ms: row.get(4)?,
        token_rotated_at_ms: row.get(5)?,
        clock: VectorClock::from_json(&row.get::<_, String>(6)?),
        last_modified_by: row.get(7)?,
        version: row.get(8)?,
    })
}

fn file_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        file_id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        size: row.get::<_, i64>(3)? as u64,
        created_at_ms: row.get(4)?,
        deleted: row.get::<_, i64>(5)? != 0,
        deleted_at_ms: row.get(6)?,
        clock: VectorClock::from_json(&row.get::<_, String>(7)?),
        last_modified_by: row.get(8)?,
        version: row.get(9)?,
    })
}

fn tag_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TagRecord> {
    Ok(TagRecord {
        file_id: row.get(0)?,
        tag: row.get(1)?,
        deleted: row.get::<_, i64>(2)? != 0,
        stamp_ms: row.get(3)?,
        clock: VectorClock::from_json(&row.get::<_, String>(4)?),
        last_modified_by: row.get(5)?,
        version: row.get(6)?,
    })
}

fn chunk_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRecord> {
    Ok(ChunkRecord {
        chunk_id: row.get(0)?,
        file_id: row.get(1)?,
        ordinal: row.get::<_, i64>(2)? as u32,
        size: row.get::<_, i64>(3)? as u64,
        checksum: row.get(4)?,
        clock: VectorClock::from_json(&row.get::<_, String>(5)?),
        last_modified_by: row.get(6)?,
        version: row.get(7)?,
    })
}

fn location_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocationRecord> {
    Ok(LocationRecord {
        chunk_id: row.get(0)?,
        node_id: NodeId::from_string(row.get::<_, String>(1)?),
        discovered_at_ms: row.get(2)?,
        removed: row.get::<_, i64>(3)? != 0,
        clock: VectorClock::from_json(&row.get::<_, String>(4)?),
        last_modified_by: row.get(5)?,
        version: row.get(6)?,
    })
}

fn storage_node_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StorageNodeRecord> {
    Ok(StorageNodeRecord {
        node_id: NodeId::from_string(row.get::<_, String>(0)?),
        address: row.get(1)?,
        last_heartbeat_ms: row.get(2)?,
        capacity_bytes: row.get::<_, i64>(3)? as u64,
        used_bytes: row.get::<_, i64>(4)? as u64,
        status: StorageNodeStatus::parse(&row.get::<_, String>(5)?),
    })
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GossipEntry> {
    let kind_raw: String = row.get(2)?;
    let op_raw: String = row.get(4)?;
    let payload_raw: String = row.get(5)?;
    let acked_raw: String = row.get(8)?;

    Ok(GossipEntry {
        seq: row.get(0)?,
        op_id: row.get(1)?,
        entity_kind: EntityKind::parse(&kind_raw).unwrap_or(EntityKind::File),
        entity_id: row.get(3)?,
        op: OpKind::parse(&op_raw).unwrap_or(OpKind::Update),
        payload: serde_json::from_str(&payload_raw).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })?,
        clock: VectorClock::from_json(&row.get::<_, String>(6)?),
        emitted_at_ms: row.get(7)?,
        acked_by: serde_json::from_str(&acked_raw).unwrap_or_default(),
    })
}

fn append_entry(tx: &Transaction<'_>, entry: &GossipEntry) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO gossip_log
         (op_id, entity_kind, entity_id, op, payload, vector_clock, emitted_at_ms, acked_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.op_id,
            entry.entity_kind.as_str(),
            entry.entity_id,
            entry.op.as_str(),
            serde_json::to_string(&entry.payload)?,
            entry.clock.to_json(),
            entry.emitted_at_ms,
            serde_json::to_string(&entry.acked_by)?,
        ],
    )?;
    Ok(())
}

fn upsert_user(conn: &Connection, user: &UserRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO users
         (user_id, username, password_hash, token, created_at_ms, token_rotated_at_ms,
          vector_clock, last_modified_by, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            user.user_id,
            user.username,
            user.password_hash,
            user.token,
            user.created_at_ms,
            user.token_rotated_at_ms,
            user.clock.to_json(),
            user.last_modified_by,
            user.version,
        ],
    )?;
    Ok(())
}

fn upsert_file(conn: &Connection, file: &FileRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO files
         (file_id, owner_id, name, size, created_at_ms, deleted, deleted_at_ms,
          vector_clock, last_modified_by, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            file.file_id,
            file.owner_id,
            file.name,
            file.size as i64,
            file.created_at_ms,
            file.deleted as i64,
            file.deleted_at_ms,
            file.clock.to_json(),
            file.last_modified_by,
            file.version,
        ],
    )?;
    Ok(())
}

fn upsert_tag(conn: &Connection, tag: &TagRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO tags
         (file_id, tag, deleted, stamp_ms, vector_clock, last_modified_by, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            tag.file_id,
            tag.tag,
            tag.deleted as i64,
            tag.stamp_ms,
            tag.clock.to_json(),
            tag.last_modified_by,
            tag.version,
        ],
    )?;
    Ok(())
}

fn upsert_chunk(conn: &Connection, chunk: &ChunkRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO chunks
         (chunk_id, file_id, ordinal, size, checksum, vector_clock, last_modified_by, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            chunk.chunk_id,
            chunk.file_id,
            chunk.ordinal as i64,
            chunk.size as i64,
            chunk.checksum,
            chunk.clock.to_json(),
            chunk.last_modified_by,
            chunk.version,
        ],
    )?;
    Ok(())
}

fn upsert_location(conn: &Connection, location: &LocationRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO chunk_locations
         (chunk_id, node_id, discovered_at_ms, removed, vector_clock, last_modified_by, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            location.chunk_id,
            location.node_id.as_str(),
            location.discovered_at_ms,
            location.removed as i64,
            location.clock.to_json(),
            location.last_modified_by,
            location.version,
        ],
    )?;
    Ok(())
}

fn upsert_storage_node_row(conn: &Connection, record: &StorageNodeRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO storage_nodes
         (node_id, address, last_heartbeat_ms, capacity_bytes, used_bytes, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.node_id.as_str(),
            record.address,
            record.last_heartbeat_ms,
            record.capacity_bytes as i64,
            record.used_bytes as i64,
            record.status.as_str(),
        ],
    )?;
    Ok(())
}

fn get_entity_inner(
    conn: &Connection,
    kind: EntityKind,
    entity_id: &str,
) -> Result<Option<EntityPayload>> {
    let payload = match kind {
        EntityKind::User => conn
            .query_row(
                &format!("{USER_SELECT} WHERE user_id = ?1"),
                params![entity_id],
                user_from_row,
            )
            .optional()?
            .map(EntityPayload::User),
        EntityKind::File => conn
            .query_row(
                &format!("{FILE_SELECT} WHERE file_id = ?1"),
                params![entity_id],
                file_from_row,
            )
            .optional()?
            .map(EntityPayload::File),
        EntityKind::Tag => {
            let Some((file_id, tag)) = entity_id.split_once('/') else {
                return Ok(None);
            };
            conn.query_row(
                "SELECT file_id, tag, deleted, stamp_ms, vector_clock, last_modified_by, version
                 FROM tags WHERE file_id = ?1 AND tag = ?2",
                params![file_id, tag],
                tag_from_row,
            )
            .optional()?
            .map(EntityPayload::Tag)
        }
        EntityKind::Chunk => conn
            .query_row(
                &format!("{CHUNK_SELECT} WHERE chunk_id = ?1"),
                params![entity_id],
                chunk_from_row,
            )
            .optional()?
            .map(EntityPayload::Chunk),
        EntityKind::ChunkLocation => {
            let Some((chunk_id, node_id)) = entity_id.split_once('@') else {
                return Ok(None);
            };
            conn.query_row(
                &format!("{LOCATION_SELECT} WHERE chunk_id = ?1 AND node_id = ?2"),
                params![chunk_id, node_id],
                location_from_row,
            )
            .optional()?
            .map(EntityPayload::ChunkLocation)
        }
        EntityKind::StorageNode => conn
            .query_row(
                "SELECT node_id, address, last_heartbeat_ms, capacity_bytes, used_bytes, status
                 FROM storage_nodes WHERE node_id = ?1",
                params![entity_id],
                storage_node_from_row,
            )
            .optional()?
            .map(EntityPayload::StorageNode),
        EntityKind::Peer => conn
            .query_row(
                "SELECT node_id, address, last_seen_ms, clock_digest
                 FROM metadata_peers WHERE node_id = ?1",
                params![entity_id],
                |row| {
                    Ok(PeerRecord {
                        node_id: NodeId::from_string(row.get::<_, String>(0)?),
                        address: row.get(1)?,
                        last_seen_ms: row.get(2)?,
                        clock_digest: row.get(3)?,
                    })
                },
            )
            .optional()?
            .map(EntityPayload::Peer),
    };
    Ok(payload)
}

fn apply_payload_inner(conn: &Connection, payload: &EntityPayload) -> Result<()> {
    match payload {
        EntityPayload::User(record) => upsert_user(conn, record),
        EntityPayload::File(record) => upsert_file(conn, record),
        EntityPayload::Tag(record) => upsert_tag(conn, record),
        EntityPayload::Chunk(record) => upsert_chunk(conn, record),
        EntityPayload::ChunkLocation(record) => upsert_location(conn, record),
        EntityPayload::StorageNode(record) => upsert_storage_node_row(conn, record),
        EntityPayload::Peer(record) => {
            conn.execute(
                "INSERT OR REPLACE INTO metadata_peers (node_id, address, last_seen_ms, clock_digest)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.node_id.as_str(),
                    record.address,
                    record.last_seen_ms,
                    record.clock_digest
                ],
            )?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_for(payload: EntityPayload, op: OpKind) -> GossipEntry {
        GossipEntry {
            seq: 0,
            op_id: uuid::Uuid::new_v4().to_string(),
            entity_kind: payload.kind(),
            entity_id: payload.entity_id(),
            op,
            clock: payload.clock(),
            payload,
            emitted_at_ms: 1,
            acked_by: BTreeSet::new(),
        }
    }

    fn sample_file(file_id: &str, name: &str, created: i64) -> FileRecord {
        FileRecord {
            file_id: file_id.to_string(),
            owner_id: "u1".to_string(),
            name: name.to_string(),
            size: 9,
            created_at_ms: created,
            deleted: false,
            deleted_at_ms: None,
            clock: VectorClock::new().incremented("m1"),
            last_modified_by: "m1".to_string(),
            version: 1,
        }
    }

    fn sample_tag(file_id: &str, tag: &str) -> TagRecord {
        TagRecord {
            file_id: file_id.to_string(),
            tag: tag.to_string(),
            deleted: false,
            stamp_ms: 1,
            clock: VectorClock::new().incremented("m1"),
            last_modified_by: "m1".to_string(),
            version: 1,
        }
    }

    fn sample_chunk(chunk_id: &str, file_id: &str, ordinal: u32) -> ChunkRecord {
        ChunkRecord {
            chunk_id: chunk_id.to_string(),
            file_id: file_id.to_string(),
            ordinal,
            size: 3,
            checksum: "abc".to_string(),
            clock: VectorClock::new().incremented("m1"),
            last_modified_by: "m1".to_string(),
            version: 1,
        }
    }

    fn commit_sample_upload(store: &MetaStore, file_id: &str, name: &str, tags: &[&str]) {
        let file = sample_file(file_id, name, 100);
        let tag_records: Vec<TagRecord> =
            tags.iter().map(|tag| sample_tag(file_id, tag)).collect();
        let chunks = vec![
            sample_chunk(&format!("{file_id}-c0"), file_id, 0),
            sample_chunk(&format!("{file_id}-c1"), file_id, 1),
        ];
        let locations = vec![LocationRecord {
            chunk_id: chunks[0].chunk_id.clone(),
            node_id: NodeId::from_string("s1"),
            discovered_at_ms: 100,
            removed: false,
            clock: VectorClock::new().incremented("m1"),
            last_modified_by: "m1".to_string(),
            version: 1,
        }];

        let mut entries = vec![entry_for(EntityPayload::File(file.clone()), OpKind::Create)];
        for tag in &tag_records {
            entries.push(entry_for(EntityPayload::Tag(tag.clone()), OpKind::Create));
        }
        for chunk in &chunks {
            entries.push(entry_for(EntityPayload::Chunk(chunk.clone()), OpKind::Create));
        }

        store
            .commit_upload(&file, &tag_records, &chunks, &locations, None, &entries)
            .unwrap();
    }

    #[test]
    fn upload_commit_is_atomic_and_queryable() {
        let store = MetaStore::open_in_memory().unwrap();
        commit_sample_upload(&store, "f1", "a.txt", &["t1", "t2"]);

        let files = store
            .files_by_tags("u1", &["t1".to_string(), "t2".to_string()])
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_id, "f1");

        let chunks = store.chunks_for_file("f1").unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[1].ordinal, 1);

        // one entry per file/tag/chunk
        assert_eq!(store.gossip_log_len().unwrap(), 5);
    }

    #[test]
    fn tag_query_uses_and_semantics() {
        let store = MetaStore::open_in_memory().unwrap();
        commit_sample_upload(&store, "f1", "a.txt", &["t1", "t2"]);
        commit_sample_upload(&store, "f2", "b.txt", &["t1"]);

        let both = store
            .files_by_tags("u1", &["t1".to_string(), "t2".to_string()])
            .unwrap();
        assert_eq!(both.len(), 1);

        let t1_only = store.files_by_tags("u1", &["t1".to_string()]).unwrap();
        assert_eq!(t1_only.len(), 2);

        assert!(store.files_by_tags("u2", &["t1".to_string()]).unwrap().is_empty());
    }

    #[test]
    fn soft_deleted_files_are_invisible() {
        let store = MetaStore::open_in_memory().unwrap();
        commit_sample_upload(&store, "f1", "a.txt", &["t1"]);

        let mut file = store.file_by_id("f1").unwrap().unwrap();
        file.deleted = true;
        file.deleted_at_ms = Some(200);
        file.clock = file.clock.incremented("m1");
        store
            .commit_mutations(
                &[file.clone()],
                &[],
                &[entry_for(EntityPayload::File(file), OpKind::SoftDelete)],
            )
            .unwrap();

        assert!(store.files_by_tags("u1", &["t1".to_string()]).unwrap().is_empty());
        assert!(store
            .live_file_by_owner_and_name("u1", "a.txt")
            .unwrap()
            .is_none());
        assert_eq!(store.tombstoned_files(i64::MAX).unwrap().len(), 1);
        // repair must not touch chunks of tombstoned files
        assert!(store.live_chunks().unwrap().is_empty());
    }

    #[test]
    fn tombstoned_tags_do_not_match_queries() {
        let store = MetaStore::open_in_memory().unwrap();
        commit_sample_upload(&store, "f1", "a.txt", &["t1", "t2"]);

        let mut tag = sample_tag("f1", "t1");
        tag.deleted = true;
        tag.stamp_ms = 2;
        tag.clock = tag.clock.incremented("m1");
        store
            .commit_mutations(
                &[],
                &[tag.clone()],
                &[entry_for(EntityPayload::Tag(tag), OpKind::TombstoneTag)],
            )
            .unwrap();

        assert!(store.files_by_tags("u1", &["t1".to_string()]).unwrap().is_empty());
        assert_eq!(store.live_tags_for_file("f1").unwrap(), vec!["t2"]);
    }

    #[test]
    fn duplicate_remote_entry_is_noop() {
        let store = MetaStore::open_in_memory().unwrap();
        let sender = NodeId::from_string("m2");
        let entry = entry_for(
            EntityPayload::File(sample_file("f1", "a.txt", 100)),
            OpKind::Create,
        );

        assert!(store.record_remote_entry(&entry, &sender).unwrap());
        assert!(!store.record_remote_entry(&entry, &sender).unwrap());
        assert_eq!(store.gossip_log_len().unwrap(), 1);
    }

    #[test]
    fn pending_entries_respect_acks_and_cap() {
        let store = MetaStore::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .append_entry(&entry_for(
                    EntityPayload::File(sample_file(&format!("f{i}"), &format!("{i}.txt"), 100)),
                    OpKind::Create,
                ))
                .unwrap();
        }

        let peer = NodeId::from_string("m2");
        let pending = store.pending_entries_for_peer(&peer, 3).unwrap();
        assert_eq!(pending.len(), 3);

        let op_ids: Vec<String> = pending.iter().map(|e| e.op_id.clone()).collect();
        store.mark_entries_acked(&op_ids, &peer).unwrap();

        let rest = store.pending_entries_for_peer(&peer, 10).unwrap();
        assert_eq!(rest.len(), 2);
        // a different peer still sees everything
        let other = NodeId::from_string("m3");
        assert_eq!(store.pending_entries_for_peer(&other, 10).unwrap().len(), 5);
    }

    #[test]
    fn remote_entries_are_not_pushed_back_to_sender() {
        let store = MetaStore::open_in_memory().unwrap();
        let sender = NodeId::from_string("m2");
        let entry = entry_for(
            EntityPayload::File(sample_file("f1", "a.txt", 100)),
            OpKind::Create,
        );
        store.record_remote_entry(&entry, &sender).unwrap();

        assert!(store.pending_entries_for_peer(&sender, 10).unwrap().is_empty());
        assert_eq!(
            store
                .pending_entries_for_peer(&NodeId::from_string("m3"), 10)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn state_summary_covers_replicated_kinds() {
        let store = MetaStore::open_in_memory().unwrap();
        commit_sample_upload(&store, "f1", "a.txt", &["t1"]);

        let summary = store.state_summary().unwrap();
        assert_eq!(summary[&EntityKind::File].len(), 1);
        assert_eq!(summary[&EntityKind::Tag].len(), 1);
        assert_eq!(summary[&EntityKind::Chunk].len(), 2);
        assert_eq!(summary[&EntityKind::ChunkLocation].len(), 1);
        assert!(summary[&EntityKind::Tag].contains_key("f1/t1"));
    }

    #[test]
    fn fetch_entities_returns_payloads_by_kind() {
        let store = MetaStore::open_in_memory().unwrap();
        commit_sample_upload(&store, "f1", "a.txt", &["t1"]);

        let payloads = store
            .fetch_entities(EntityKind::Tag, &["f1/t1".to_string(), "f1/nope".to_string()])
            .unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].entity_id(), "f1/t1");
    }

    #[test]
    fn name_collision_keeps_deterministic_winner() {
        let store = MetaStore::open_in_memory().unwrap();

        let older = sample_file("f-old", "p.bin", 100);
        let newer = sample_file("f-new", "p.bin", 200);
        store.apply_payload(&EntityPayload::File(older)).unwrap();
        store.apply_payload(&EntityPayload::File(newer)).unwrap();

        let losers = store.reconcile_name_collision("u1", "p.bin").unwrap();
        assert_eq!(losers.len(), 1);
        assert_eq!(losers[0].file_id, "f-old");

        let visible = store.live_file_by_owner_and_name("u1", "p.bin").unwrap().unwrap();
        assert_eq!(visible.file_id, "f-new");
        // both records survive for conflict resolution
        assert!(store.file_by_id("f-old").unwrap().unwrap().deleted);
    }

    #[test]
    fn locations_index_by_node_and_clear_individually() {
        let store = MetaStore::open_in_memory().unwrap();
        commit_sample_upload(&store, "f1", "a.txt", &["t1"]);

        let node = NodeId::from_string("s1");
        let held = store.live_locations_for_node(&node).unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].chunk_id, "f1-c0");

        let mut cleared = held[0].clone();
        cleared.removed = true;
        cleared.clock = cleared.clock.incremented("m1");
        store
            .record_location(
                &cleared,
                &entry_for(EntityPayload::ChunkLocation(cleared.clone()), OpKind::Update),
            )
            .unwrap();

        assert!(store.live_locations_for_node(&node).unwrap().is_empty());
        assert!(store.live_locations_for_chunk("f1-c0").unwrap().is_empty());
    }

    #[test]
    fn reopened_store_retains_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redcloud.db");

        {
            let store = MetaStore::open(&path).unwrap();
            commit_sample_upload(&store, "f1", "a.txt", &["t1"]);
            store
                .upsert_peer(&PeerRecord {
                    node_id: NodeId::from_string("m2"),
                    address: "10.0.0.2:8000".to_string(),
                    last_seen_ms: 1,
                    clock_digest: None,
                })
                .unwrap();
        }

        let reopened = MetaStore::open(&path).unwrap();
        assert_eq!(
            reopened.files_by_tags("u1", &["t1".to_string()]).unwrap().len(),
            1
        );
        assert_eq!(reopened.all_peers().unwrap().len(), 1);
        assert_eq!(reopened.gossip_log_len().unwrap(), 5);
    }

    #[test]
    fn username_uniqueness_is_enforced() {
        let store = MetaStore::open_in_memory().unwrap();
        let user = UserRecord {
            user_id: "u1".to_string(),
            username: "alice".to_string(),
            password_hash: "hash".to_string(),
            token: Some("tok".to_string()),
            created_at_ms: 1,
            token_rotated_at_ms: None,
            clock: VectorClock::new().incremented("m1"),
            last_modified_by: "m1".to_string(),
            version: 1,
        };

        let entry = entry_for(EntityPayload::User(user.clone()), OpKind::Create);
        assert!(store.create_user(&user, &entry).unwrap());

        let mut duplicate = user.clone();
        duplicate.user_id = "u2".to_string();
        let entry2 = entry_for(EntityPayload::User(duplicate.clone()), OpKind::Create);
        assert!(!store.create_user(&duplicate, &entry2).unwrap());
        assert_eq!(store.gossip_log_len().unwrap(), 1);
    }
}
