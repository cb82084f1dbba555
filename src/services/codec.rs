//! Payload encoding: optional zlib compression and the content hash taken
//! over the bytes as they are persisted.

use crate::errors::{StorageError, StorageResult};
use bytes::Bytes;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

/// Bytes ready for the backends, plus what the catalog needs to know
/// about them.
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub bytes: Bytes,
    pub compressed: bool,
    pub content_hash: String,
}

/// Compress `data` when `level` is set and the result is strictly smaller,
/// then hash whatever will be stored.
pub fn encode(data: Bytes, level: Option<u32>) -> StorageResult<EncodedPayload> {
    let (bytes, compressed) = match level {
        Some(level) if !data.is_empty() => {
            let packed = compress(&data, level)?;
            if packed.len() < data.len() {
                (Bytes::from(packed), true)
            } else {
                (data, false)
            }
        }
        _ => (data, false),
    };
    let content_hash = content_hash(&bytes);
    Ok(EncodedPayload {
        bytes,
        compressed,
        content_hash,
    })
}

/// Inverse of [`encode`] for the bytes read back from a backend.
pub fn decode(stored: Bytes, compressed: bool) -> StorageResult<Bytes> {
    if compressed {
        decompress(&stored).map(Bytes::from)
    } else {
        Ok(stored)
    }
}

pub fn compress(data: &[u8], level: u32) -> StorageResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    encoder
        .write_all(data)
        .map_err(|e| StorageError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| StorageError::Compression(e.to_string()))
}

pub fn decompress(data: &[u8]) -> StorageResult<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| StorageError::Compression(e.to_string()))?;
    Ok(out)
}

/// Lowercase hex SHA-256.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// True when `data` hashes to `expected`.
pub fn verify(data: &[u8], expected: &str) -> bool {
    content_hash(data) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repetitive_payloads_are_compressed() {
        let data = Bytes::from("abcabcabc".repeat(200));
        let encoded = encode(data.clone(), Some(6)).unwrap();
        assert!(encoded.compressed);
        assert!(encoded.bytes.len() < data.len());
        assert_eq!(encoded.content_hash, content_hash(&encoded.bytes));
        assert_eq!(decode(encoded.bytes, true).unwrap(), data);
    }

    #[test]
    fn compression_is_kept_only_when_smaller() {
        let tiny = Bytes::from_static(b"x");
        let encoded = encode(tiny.clone(), Some(9)).unwrap();
        assert!(!encoded.compressed);
        assert_eq!(encoded.bytes, tiny);

        let empty = encode(Bytes::new(), Some(6)).unwrap();
        assert!(!empty.compressed);
        assert_eq!(
            empty.content_hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn disabled_compression_passes_bytes_through() {
        let data = Bytes::from("aaaa".repeat(100));
        let encoded = encode(data.clone(), None).unwrap();
        assert!(!encoded.compressed);
        assert_eq!(encoded.bytes, data);
    }

    #[test]
    fn verify_detects_altered_bytes() {
        let encoded = encode(Bytes::from_static(b"payload"), None).unwrap();
        assert!(verify(&encoded.bytes, &encoded.content_hash));
        assert!(!verify(b"payloaD", &encoded.content_hash));
    }

    #[test]
    fn corrupt_stream_is_a_compression_error() {
        let err = decode(Bytes::from_static(b"not zlib"), true).unwrap_err();
        assert!(matches!(err, StorageError::Compression(_)));
    }
}
