//! HTTP client for the storage-node data surface. Every call carries its
//! own deadline; callers never retry inline against the same node within a
//! cycle.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use common::checksum::checksum_hex;
use common::protocol::{
    ChunkListing, ReplicateChunkRequest, HDR_CHECKSUM, HDR_FILE_ID, HDR_ORDINAL, HDR_SIZE,
};
use common::frame;

#[derive(Debug)]
pub enum WriteChunkError {
    ChecksumRejected,
    StorageFull,
    Unreachable(anyhow::Error),
}

impl std::fmt::Display for WriteChunkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChecksumRejected => write!(f, "storage node rejected checksum"),
            Self::StorageFull => write!(f, "storage node is full"),
            Self::Unreachable(err) => write!(f, "storage node unreachable: {err}"),
        }
    }
}

impl std::error::Error for WriteChunkError {}

#[derive(Clone)]
pub struct StorageClient {
    http: reqwest::Client,
}

impl StorageClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub async fn write_chunk(
        &self,
        address: &str,
        listing: &ChunkListing,
        payload: Bytes,
        deadline: Duration,
    ) -> Result<(), WriteChunkError> {
        let url = format!("http://{address}/chunks/{}", listing.chunk_id);
        let framed = frame::encode(&payload);

        let response = self
            .http
            .put(&url)
            .header(HDR_FILE_ID, &listing.file_id)
            .header(HDR_ORDINAL, listing.ordinal.to_string())
            .header(HDR_SIZE, listing.size.to_string())
            .header(HDR_CHECKSUM, &listing.checksum)
            .body(framed)
            .timeout(deadline)
            .send()
            .await
            .map_err(|err| WriteChunkError::Unreachable(err.into()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            reqwest::StatusCode::UNPROCESSABLE_ENTITY | reqwest::StatusCode::CONFLICT => {
                Err(WriteChunkError::ChecksumRejected)
            }
            reqwest::StatusCode::INSUFFICIENT_STORAGE => Err(WriteChunkError::StorageFull),
            status => Err(WriteChunkError::Unreachable(anyhow!(
                "unexpected status {status}"
            ))),
        }
    }

    /// Fetch a chunk and verify its content checksum on the way through.
    pub async fn read_chunk(
        &self,
        address: &str,
        chunk_id: &str,
        expected_checksum: &str,
        deadline: Duration,
    ) -> Result<Bytes> {
        let url = format!("http://{address}/chunks/{chunk_id}");
        let response = self
            .http
            .get(&url)
            .timeout(deadline)
            .send()
            .await?
            .error_for_status()?;

        let body = response.bytes().await?;
        let payload = frame::decode(&body).map_err(|err| anyhow!("bad chunk stream: {err}"))?;

        let actual = checksum_hex(&payload);
        if actual != expected_checksum {
            bail!("chunk {chunk_id} checksum mismatch from {address}: {actual}");
        }

        Ok(payload)
    }

    /// Returns `true` when the node held the chunk, `false` on not-found.
    pub async fn delete_chunk(
        &self,
        address: &str,
        chunk_id: &str,
        deadline: Duration,
    ) -> Result<bool> {
        let url = format!("http://{address}/chunks/{chunk_id}");
        let response = self.http.delete(&url).timeout(deadline).send().await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status => bail!("delete of {chunk_id} on {address} failed: {status}"),
        }
    }

    pub async fn list_chunks(&self, address: &str, deadline: Duration) -> Result<Vec<ChunkListing>> {
        let url = format!("http://{address}/chunks");
        let listings = self
            .http
            .get(&url)
            .timeout(deadline)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(listings)
    }

    /// Ask `target` to pull a chunk from `source` (SN-to-SN byte copy).
    pub async fn replicate_chunk(
        &self,
        target_address: &str,
        chunk_id: &str,
        source_address: &str,
        deadline: Duration,
    ) -> Result<()> {
        let url = format!("http://{target_address}/chunks/{chunk_id}/replicate");
        self.http
            .post(&url)
            .json(&ReplicateChunkRequest {
                source_address: source_address.to_string(),
            })
            .timeout(deadline)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn ping(&self, address: &str, deadline: Duration) -> Result<()> {
        let url = format!("http://{address}/ping");
        self.http
            .get(&url)
            .timeout(deadline)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
