//! Content checksums for chunk payloads (256-bit blake3, hex encoded).

pub const CHECKSUM_LEN: usize = 32;

pub fn checksum_hex(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

pub fn checksum_bytes(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    *blake3::hash(data).as_bytes()
}

/// Incremental checksum over streamed pieces.
pub struct ChecksumAccumulator {
    hasher: blake3::Hasher,
}

impl ChecksumAccumulator {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
        }
    }

    pub fn update(&mut self, piece: &[u8]) {
        self.hasher.update(piece);
    }

    pub fn finalize_hex(self) -> String {
        self.hasher.finalize().to_hex().to_string()
    }

    pub fn finalize_bytes(self) -> [u8; CHECKSUM_LEN] {
        *self.hasher.finalize().as_bytes()
    }
}

impl Default for ChecksumAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
