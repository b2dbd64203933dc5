//! Piece framing for chunk transfers.
//!
//! A framed chunk body is a sequence of length-prefixed pieces followed by a
//! zero-length terminator and the cumulative 256-bit checksum of the payload:
//!
//! ```text
//! [u32 len][piece bytes] ... [u32 len][piece bytes] [u32 = 0] [32-byte checksum]
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::checksum::{checksum_bytes, ChecksumAccumulator, CHECKSUM_LEN};
use crate::PIECE_SIZE_BYTES;

#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    Truncated,
    OversizedPiece { len: usize },
    ChecksumMismatch,
    TrailingData { extra: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "framed stream ended mid-piece"),
            Self::OversizedPiece { len } => write!(f, "piece length {len} exceeds limit"),
            Self::ChecksumMismatch => write!(f, "cumulative checksum mismatch"),
            Self::TrailingData { extra } => write!(f, "{extra} bytes after terminator"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Largest piece length accepted on decode. Encoders use [`PIECE_SIZE_BYTES`];
/// the decoder tolerates anything up to four times that.
const MAX_PIECE_LEN: usize = PIECE_SIZE_BYTES * 4;

pub fn encode(payload: &[u8]) -> Bytes {
    encode_with_piece_size(payload, PIECE_SIZE_BYTES)
}

pub fn encode_with_piece_size(payload: &[u8], piece_size: usize) -> Bytes {
    let piece_size = piece_size.max(1);
    let mut out = BytesMut::with_capacity(payload.len() + 4 * (payload.len() / piece_size + 2) + CHECKSUM_LEN);

    for piece in payload.chunks(piece_size) {
        out.put_u32(piece.len() as u32);
        out.put_slice(piece);
    }

    out.put_u32(0);
    out.put_slice(&checksum_bytes(payload));
    out.freeze()
}

pub fn decode(framed: &[u8]) -> Result<Bytes, FrameError> {
    let mut payload = BytesMut::new();
    let mut acc = ChecksumAccumulator::new();
    let mut cursor = 0usize;

    loop {
        if framed.len() < cursor + 4 {
            return Err(FrameError::Truncated);
        }
        let len = u32::from_be_bytes([
            framed[cursor],
            framed[cursor + 1],
            framed[cursor + 2],
            framed[cursor + 3],
        ]) as usize;
        cursor += 4;

        if len == 0 {
            break;
        }
        if len > MAX_PIECE_LEN {
            return Err(FrameError::OversizedPiece { len });
        }
        if framed.len() < cursor + len {
            return Err(FrameError::Truncated);
        }

        let piece = &framed[cursor..cursor + len];
        acc.update(piece);
        payload.put_slice(piece);
        cursor += len;
    }

    if framed.len() < cursor + CHECKSUM_LEN {
        return Err(FrameError::Truncated);
    }
    let declared = &framed[cursor..cursor + CHECKSUM_LEN];
    cursor += CHECKSUM_LEN;

    if cursor != framed.len() {
        return Err(FrameError::TrailingData {
            extra: framed.len() - cursor,
        });
    }
    if acc.finalize_bytes() != declared {
        return Err(FrameError::ChecksumMismatch);
    }

    Ok(payload.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_empty_payload() {
        let framed = encode(b"");
        assert_eq!(decode(&framed).unwrap(), Bytes::new());
    }

    #[test]
    fn roundtrip_multi_piece_payload() {
        let payload: Vec<u8> = (0..PIECE_SIZE_BYTES * 2 + 17).map(|i| (i % 251) as u8).collect();
        let framed = encode(&payload);
        assert_eq!(decode(&framed).unwrap(), Bytes::from(payload));
    }

    #[test]
    fn corrupted_piece_fails_checksum() {
        let mut framed = encode(b"redcloud piece framing").to_vec();
        framed[6] ^= 0xff;
        assert_eq!(decode(&framed), Err(FrameError::ChecksumMismatch));
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let framed = encode(b"redcloud piece framing");
        assert_eq!(decode(&framed[..framed.len() - 1]), Err(FrameError::Truncated));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut framed = encode(b"payload").to_vec();
        framed.push(0);
        assert!(matches!(decode(&framed), Err(FrameError::TrailingData { extra: 1 })));
    }
}
