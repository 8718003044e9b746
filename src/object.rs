use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// An object handed to the worker by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    /// Partition id the key was routed under.
    pub addr_id: u64,
    pub key: Vec<u8>,
    pub body: Vec<u8>,
}

impl Object {
    pub fn new(addr_id: u64, key: impl Into<Vec<u8>>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            addr_id,
            key: key.into(),
            body: body.into(),
        }
    }
}

/// Metadata entry stored in the index. The `offset` field is the
/// authoritative pointer into the AVS file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub addr_id: u64,
    pub key: Vec<u8>,
    /// Key length in bytes.
    pub ksize: u32,
    /// Body length in bytes.
    pub dsize: u32,
    /// Absolute byte offset of the record in the AVS file.
    pub offset: u64,
    /// Write timestamp, microseconds since the unix epoch.
    pub clock: u64,
    /// crc64 over key and body bytes.
    pub checksum: u64,
    /// 0 = live, non-zero = tombstone.
    pub del: u8,
}

impl Metadata {
    pub fn is_deleted(&self) -> bool {
        self.del != 0
    }
}

/// Composite index key: addr_id as a BigEndian u64 followed by the raw key
/// bytes. Keeps each partition's entries contiguous and ordered, so prefix
/// scans stay cheap.
pub fn encode_key(addr_id: u64, key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + key.len());
    buf.extend_from_slice(&addr_id.to_be_bytes());
    buf.extend_from_slice(key);
    buf
}

/// Splits a composite index key back into (addr_id, key bytes).
pub fn decode_key(encoded: &[u8]) -> Option<(u64, &[u8])> {
    if encoded.len() < 8 {
        return None;
    }
    let addr_id = BigEndian::read_u64(&encoded[..8]);
    Some((addr_id, &encoded[8..]))
}

/// Serialize a metadata entry for the index using bincode.
pub fn encode_metadata(meta: &Metadata) -> Vec<u8> {
    bincode::serialize(meta).expect("metadata serialization should not fail")
}

/// Deserialize a metadata entry from index bytes.
pub fn decode_metadata(bytes: &[u8]) -> Result<Metadata> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_roundtrip() {
        let encoded = encode_key(42, b"bucket/a");
        let (addr_id, key) = decode_key(&encoded).unwrap();
        assert_eq!(addr_id, 42);
        assert_eq!(key, b"bucket/a");
    }

    #[test]
    fn test_key_ordering_within_partition() {
        // Keys under the same addr_id must sort by raw key bytes.
        let a = encode_key(7, b"a");
        let b = encode_key(7, b"b");
        let other = encode_key(8, b"a");
        assert!(a < b);
        assert!(b < other);
    }

    #[test]
    fn test_short_key_rejected() {
        assert!(decode_key(&[0, 1, 2]).is_none());
    }

    #[test]
    fn test_metadata_roundtrip() {
        let meta = Metadata {
            addr_id: 42,
            key: b"a".to_vec(),
            ksize: 1,
            dsize: 5,
            offset: 128,
            clock: 1_700_000_000_000_000,
            checksum: 0xdead_beef,
            del: 0,
        };
        let decoded = decode_metadata(&encode_metadata(&meta)).unwrap();
        assert_eq!(meta, decoded);
    }
}
