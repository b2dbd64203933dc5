use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use common::checksum::checksum_hex;
use common::protocol::ChunkListing;
use tokio::fs;

/// Content-addressed blob store for chunk payloads.
///
/// Each chunk lives as `<root>/<id>.chk` with a `<root>/<id>.meta.json`
/// sidecar carrying the descriptor the chunk was written with. Writes are
/// idempotent by chunk id: identical bytes are a no-op, different bytes are
/// rejected as a protocol error.
pub struct ChunkStore {
    root: PathBuf,
}

#[derive(Debug)]
pub enum WriteError {
    ChecksumMismatch { expected: String, actual: String },
    Conflict { chunk_id: String },
    StorageFull,
    Internal(anyhow::Error),
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected={expected} actual={actual}")
            }
            Self::Conflict { chunk_id } => {
                write!(f, "chunk {chunk_id} already stored with different bytes")
            }
            Self::StorageFull => write!(f, "storage full"),
            Self::Internal(err) => write!(f, "internal store error: {err}"),
        }
    }
}

impl std::error::Error for WriteError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Stored,
    AlreadyPresent,
}

impl ChunkStore {
    pub async fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create chunk directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn write(
        &self,
        listing: &ChunkListing,
        payload: Bytes,
    ) -> Result<WriteOutcome, WriteError> {
        let actual = checksum_hex(&payload);
        if actual != listing.checksum {
            return Err(WriteError::ChecksumMismatch {
                expected: listing.checksum.clone(),
                actual,
            });
        }

        let blob_path = self.blob_path(&listing.chunk_id);
        match fs::read(&blob_path).await {
            Ok(existing) => {
                return if checksum_hex(&existing) == listing.checksum {
                    Ok(WriteOutcome::AlreadyPresent)
                } else {
                    Err(WriteError::Conflict {
                        chunk_id: listing.chunk_id.clone(),
                    })
                };
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(WriteError::Internal(err.into())),
        }

        if let Err(err) = write_atomic(&blob_path, &payload).await {
            return Err(classify_io(err));
        }

        let meta_path = self.meta_path(&listing.chunk_id);
        let meta_payload = match serde_json::to_vec_pretty(listing) {
            Ok(bytes) => bytes,
            Err(err) => return Err(WriteError::Internal(err.into())),
        };
        if let Err(err) = write_atomic(&meta_path, &meta_payload).await {
            return Err(classify_io(err));
        }

        Ok(WriteOutcome::Stored)
    }

    pub async fn read(&self, chunk_id: &str) -> Result<Option<(ChunkListing, Bytes)>> {
        let blob_path = self.blob_path(chunk_id);
        let payload = match fs::read(&blob_path).await {
            Ok(payload) => payload,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let meta = self
            .read_meta(chunk_id)
            .await?
            .with_context(|| format!("chunk {chunk_id} has a blob but no descriptor"))?;

        Ok(Some((meta, Bytes::from(payload))))
    }

    pub async fn delete(&self, chunk_id: &str) -> Result<bool> {
        let blob_path = self.blob_path(chunk_id);
        let existed = match fs::remove_file(&blob_path).await {
            Ok(()) => true,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => return Err(err.into()),
        };

        match fs::remove_file(self.meta_path(chunk_id)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        Ok(existed)
    }

    pub async fn list(&self) -> Result<Vec<ChunkListing>> {
        let mut listings = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(chunk_id) = name.strip_suffix(".meta.json") else {
                continue;
            };
            if let Some(meta) = self.read_meta(chunk_id).await? {
                listings.push(meta);
            }
        }

        listings.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));
        Ok(listings)
    }

    pub async fn used_bytes(&self) -> Result<u64> {
        let mut total = 0u64;
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("chk") {
                total += fs::metadata(&path).await?.len();
            }
        }

        Ok(total)
    }

    async fn read_meta(&self, chunk_id: &str) -> Result<Option<ChunkListing>> {
        let meta_path = self.meta_path(chunk_id);
        let payload = match fs::read(&meta_path).await {
            Ok(payload) => payload,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let meta = serde_json::from_slice::<ChunkListing>(&payload)
            .with_context(|| format!("invalid chunk descriptor {}", meta_path.display()))?;
        Ok(Some(meta))
    }

    fn blob_path(&self, chunk_id: &str) -> PathBuf {
        self.root.join(format!("{chunk_id}.chk"))
    }

    fn meta_path(&self, chunk_id: &str) -> PathBuf {
        self.root.join(format!("{chunk_id}.meta.json"))
    }
}

fn classify_io(err: std::io::Error) -> WriteError {
    if err.raw_os_error() == Some(28) {
        WriteError::StorageFull
    } else {
        WriteError::Internal(err.into())
    }
}

async fn write_atomic(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    fs::write(&tmp, payload).await?;
    fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(chunk_id: &str, payload: &[u8]) -> ChunkListing {
        ChunkListing {
            chunk_id: chunk_id.to_string(),
            file_id: "file-1".to_string(),
            ordinal: 0,
            size: payload.len() as u64,
            checksum: checksum_hex(payload),
        }
    }

    #[tokio::test]
    async fn write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::init(dir.path()).await.unwrap();

        let payload = Bytes::from_static(b"chunk payload");
        let meta = listing("c1", &payload);
        assert_eq!(
            store.write(&meta, payload.clone()).await.unwrap(),
            WriteOutcome::Stored
        );

        let (read_meta, read_payload) = store.read("c1").await.unwrap().unwrap();
        assert_eq!(read_meta, meta);
        assert_eq!(read_payload, payload);
    }

    #[tokio::test]
    async fn rewrite_same_bytes_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::init(dir.path()).await.unwrap();

        let payload = Bytes::from_static(b"same bytes");
        let meta = listing("c1", &payload);
        store.write(&meta, payload.clone()).await.unwrap();
        assert_eq!(
            store.write(&meta, payload).await.unwrap(),
            WriteOutcome::AlreadyPresent
        );
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rewrite_different_bytes_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::init(dir.path()).await.unwrap();

        let payload = Bytes::from_static(b"original");
        store.write(&listing("c1", &payload), payload).await.unwrap();

        let other = Bytes::from_static(b"different");
        let err = store.write(&listing("c1", &other), other).await.unwrap_err();
        assert!(matches!(err, WriteError::Conflict { .. }));
    }

    #[tokio::test]
    async fn corrupted_upload_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::init(dir.path()).await.unwrap();

        let mut meta = listing("c1", b"expected payload");
        meta.checksum = checksum_hex(b"something else");
        let err = store
            .write(&meta, Bytes::from_static(b"expected payload"))
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::ChecksumMismatch { .. }));
        assert!(store.read("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::init(dir.path()).await.unwrap();

        let payload = Bytes::from_static(b"to delete");
        store.write(&listing("c1", &payload), payload).await.unwrap();

        assert!(store.delete("c1").await.unwrap());
        assert!(!store.delete("c1").await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_reports_all_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::init(dir.path()).await.unwrap();

        for id in ["a", "b", "c"] {
            let payload = Bytes::from(format!("payload-{id}"));
            store.write(&listing(id, &payload), payload).await.unwrap();
        }

        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.chunk_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
