//! Cache keys with precomputed hashes.

use std::hash::{BuildHasher, Hash, Hasher};

use bytes::Bytes;

/// Fixed seeds so that key hashes (and therefore partition routing) are
/// stable across nodes and restarts.
fn hash_bytes(bytes: &[u8]) -> u64 {
    let state = ahash::RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    );

    let mut hasher = state.build_hasher();
    hasher.write(bytes);
    hasher.finish()
}

/// Immutable key identifier with its precomputed 64-bit hash.
#[derive(Debug, Clone)]
pub struct CacheKey {
    bytes: Bytes,
    hash: u64,
}

impl CacheKey {
    /// Create a key from raw bytes, computing the hash once.
    pub fn new(bytes: Bytes) -> Self {
        let hash = hash_bytes(&bytes);
        Self { bytes, hash }
    }

    /// The precomputed hash.
    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// The raw key bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length of the key in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the key is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<&[u8]> for CacheKey {
    fn from(bytes: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(bytes))
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.bytes == other.bytes
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}
