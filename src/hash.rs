//! Key and ring hashers: stable 64-bit hashes used by the consistent-hash
//! ring and the default modulo router.
//!
//! Hashing is exposed behind traits so callers can plug in a
//! cryptographically-stronger or cross-process-stable hasher (e.g.
//! `xxhash`/`ahash`) without touching the ring or router.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::ring::ShardId;

/// Stable map from a key value to a 64-bit hash.
pub trait ShardKeyHasher<K: ?Sized>: Send + Sync {
    fn hash_key(&self, key: &K) -> u64;
}

/// Stable map from `(shardId, replicaIndex)` to a 64-bit ring hash.
pub trait ShardRingHasher: Send + Sync {
    fn hash_replica(&self, shard_id: &ShardId, replica_index: u32) -> u64;
}

fn default_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Default key hasher for any `Hash` key type. Covers the spec's permitted
/// key set (fixed-width integers, strings, UUIDs) since all three implement
/// `Hash`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultKeyHasher;

impl<K: Hash + ?Sized> ShardKeyHasher<K> for DefaultKeyHasher {
    fn hash_key(&self, key: &K) -> u64 {
        default_hash(key)
    }
}

/// Default ring hasher: hashes the `(shard_id, replica_index)` pair to
/// derive each virtual node's position on the ring.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRingHasher;

impl ShardRingHasher for DefaultRingHasher {
    fn hash_replica(&self, shard_id: &ShardId, replica_index: u32) -> u64 {
        default_hash(&(shard_id.as_str(), replica_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_hash_is_stable() {
        let hasher = DefaultKeyHasher;
        let a = ShardKeyHasher::<str>::hash_key(&hasher, "user-451");
        let b = ShardKeyHasher::<str>::hash_key(&hasher, "user-451");
        assert_eq!(a, b);
    }

    #[test]
    fn ring_hash_distinguishes_replicas() {
        let hasher = DefaultRingHasher;
        let shard = ShardId::new("shard-001").unwrap();
        let h0 = hasher.hash_replica(&shard, 0);
        let h1 = hasher.hash_replica(&shard, 1);
        assert_ne!(h0, h1);
    }
}
