pub mod checksum;
pub mod discovery;
pub mod frame;
pub mod node;
pub mod protocol;

pub use node::NodeId;

use std::time::{SystemTime, UNIX_EPOCH};

/// Default size of a file chunk stored on a storage node.
pub const CHUNK_SIZE_BYTES: usize = 4 * 1024 * 1024;

/// Default size of a single streamed piece inside a chunk transfer.
pub const PIECE_SIZE_BYTES: usize = 64 * 1024;

/// Default DNS alias under which metadata nodes register.
pub const METADATA_SERVICE_ALIAS: &str = "metadata-service";

/// Default DNS alias under which storage nodes register.
pub const STORAGE_SERVICE_ALIAS: &str = "storage-service";

pub const METADATA_PORT: u16 = 8000;
pub const STORAGE_PORT: u16 = 9000;

pub fn unix_ts_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn unix_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
