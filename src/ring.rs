//! Consistent-hash ring: virtual nodes over a sorted-array snapshot
//! published through `arc_swap::ArcSwap` so reads are a single atomic load
//! and never observe a torn snapshot, even while a topology mutation is in
//! flight.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ShardisError, ShardisResult};
use crate::hash::{DefaultRingHasher, ShardRingHasher};

/// Hard cap on virtual nodes (replicas) per shard.
pub const MAX_REPLICATION_FACTOR: u32 = 10_000;

/// Opaque, non-empty, value-equal shard identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(Arc<str>);

impl ShardId {
    pub fn new(value: impl Into<String>) -> ShardisResult<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(ShardisError::InvalidConfiguration(
                "shard id must not be empty".to_string(),
            ));
        }
        Ok(Self(Arc::from(value)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata and connection descriptor for a shard. Does not own routing
/// logic (routing lives in `Router`/`ConsistentHashRing`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardInfo {
    pub shard_id: ShardId,
    pub connection_descriptor: String,
    pub metadata: std::collections::HashMap<String, String>,
}

impl ShardInfo {
    pub fn new(shard_id: ShardId, connection_descriptor: impl Into<String>) -> Self {
        Self {
            shard_id,
            connection_descriptor: connection_descriptor.into(),
            metadata: std::collections::HashMap::new(),
        }
    }
}

/// Immutable pair of sorted arrays: `hashes[i]` owns `owners[i]`.
///
/// Readers binary-search for the lowest hash >= the key hash, wrapping
/// around to index 0 when the key hash is greater than every ring hash.
#[derive(Debug, Clone)]
pub struct RingSnapshot {
    hashes: Vec<u64>,
    owners: Vec<ShardId>,
    replication_factor: u32,
}

impl RingSnapshot {
    fn empty(replication_factor: u32) -> Self {
        Self {
            hashes: Vec::new(),
            owners: Vec::new(),
            replication_factor,
        }
    }

    /// `shardFor(hash)`: O(log N) binary search with wraparound.
    pub fn shard_for_hash(&self, hash: u64) -> Option<&ShardId> {
        if self.hashes.is_empty() {
            return None;
        }
        match self.hashes.binary_search(&hash) {
            Ok(idx) => Some(&self.owners[idx]),
            Err(idx) if idx < self.hashes.len() => Some(&self.owners[idx]),
            Err(_) => Some(&self.owners[0]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.owners_set().is_empty()
    }

    pub fn contains_shard(&self, shard_id: &ShardId) -> bool {
        self.owners.iter().any(|o| o == shard_id)
    }

    pub fn shard_count(&self) -> usize {
        self.owners_set().len()
    }

    pub fn replication_factor(&self) -> u32 {
        self.replication_factor
    }

    fn owners_set(&self) -> std::collections::HashSet<&ShardId> {
        self.owners.iter().collect()
    }

    #[cfg(test)]
    fn is_well_formed(&self) -> bool {
        self.owners.len() == self.hashes.len() && self.hashes.windows(2).all(|w| w[0] < w[1])
    }
}

/// The consistent-hash ring: holds the current `RingSnapshot` behind an
/// `ArcSwap` so readers never block and never observe a torn snapshot.
/// Topology mutation (`add_shard`/`remove_shard`) builds the next snapshot
/// off-band and publishes it atomically; mutators serialize against each
/// other through an internal `Mutex` over the admin-side shard registry
/// only — the read-path snapshot load never touches that mutex.
pub struct ConsistentHashRing {
    current: ArcSwap<RingSnapshot>,
    replication_factor: u32,
    hasher: Arc<dyn ShardRingHasher>,
    /// Admin-side shard registry. Only mutators (`add_shard`/`remove_shard`)
    /// take this lock; `snapshot()` never touches it, so concurrent readers
    /// are never blocked by a topology mutation in flight.
    shard_infos: Mutex<std::collections::HashMap<ShardId, ShardInfo>>,
}

impl std::fmt::Debug for ConsistentHashRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistentHashRing")
            .field("replication_factor", &self.replication_factor)
            .finish()
    }
}

impl ConsistentHashRing {
    pub fn new(replication_factor: u32) -> ShardisResult<Self> {
        Self::with_hasher(replication_factor, Arc::new(DefaultRingHasher))
    }

    pub fn with_hasher(
        replication_factor: u32,
        hasher: Arc<dyn ShardRingHasher>,
    ) -> ShardisResult<Self> {
        if replication_factor == 0 || replication_factor > MAX_REPLICATION_FACTOR {
            return Err(ShardisError::InvalidConfiguration(format!(
                "replication factor {} out of bounds [1, {}]",
                replication_factor, MAX_REPLICATION_FACTOR
            )));
        }
        Ok(Self {
            current: ArcSwap::from_pointee(RingSnapshot::empty(replication_factor)),
            replication_factor,
            hasher,
            shard_infos: Mutex::new(std::collections::HashMap::new()),
        })
    }

    /// Cheap, lock-free snapshot read. Single atomic load.
    pub fn snapshot(&self) -> Arc<RingSnapshot> {
        self.current.load_full()
    }

    pub fn add_shard(&self, shard_info: ShardInfo) -> ShardisResult<()> {
        let mut shard_infos = self.shard_infos.lock().unwrap();
        if shard_infos.contains_key(&shard_info.shard_id) {
            return Err(ShardisError::DuplicateShard(shard_info.shard_id.clone()));
        }
        let shard_id = shard_info.shard_id.clone();
        shard_infos.insert(shard_id.clone(), shard_info);
        self.rebuild(&shard_infos);
        info!(%shard_id, "added shard to consistent-hash ring");
        Ok(())
    }

    pub fn remove_shard(&self, shard_id: &ShardId) {
        let mut shard_infos = self.shard_infos.lock().unwrap();
        if shard_infos.remove(shard_id).is_none() {
            return;
        }
        self.rebuild(&shard_infos);
        warn!(%shard_id, "removed shard from consistent-hash ring");
    }

    pub fn shard_info(&self, shard_id: &ShardId) -> Option<ShardInfo> {
        self.shard_infos.lock().unwrap().get(shard_id).cloned()
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shard_infos.lock().unwrap().keys().cloned().collect()
    }

    /// Rebuilds the `(hashes, owners)` pair off-band from the current shard
    /// set and publishes it atomically. Ties are broken by
    /// `(shardId lexicographic, replicaIndex)`.
    fn rebuild(&self, shard_infos: &std::collections::HashMap<ShardId, ShardInfo>) {
        let mut entries: Vec<(u64, ShardId, u32)> = Vec::new();
        let mut shard_ids: Vec<&ShardId> = shard_infos.keys().collect();
        shard_ids.sort();
        for shard_id in shard_ids {
            for replica in 0..self.replication_factor {
                let hash = self.hasher.hash_replica(shard_id, replica);
                entries.push((hash, shard_id.clone(), replica));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        entries.dedup_by(|a, b| a.0 == b.0 && a.1 == b.1 && a.2 == b.2);

        let hashes = entries.iter().map(|(h, _, _)| *h).collect();
        let owners = entries.into_iter().map(|(_, id, _)| id).collect();

        self.current.store(Arc::new(RingSnapshot {
            hashes,
            owners,
            replication_factor: self.replication_factor,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ShardKeyHasher;
    use std::sync::Barrier;

    fn shard(id: &str) -> ShardInfo {
        ShardInfo::new(ShardId::new(id).unwrap(), format!("conn://{id}"))
    }

    #[test]
    fn rejects_invalid_replication_factor() {
        assert!(ConsistentHashRing::new(0).is_err());
        assert!(ConsistentHashRing::new(MAX_REPLICATION_FACTOR + 1).is_err());
        assert!(ConsistentHashRing::new(1).is_ok());
    }

    #[test]
    fn rejects_duplicate_shard() {
        let ring = ConsistentHashRing::new(10).unwrap();
        ring.add_shard(shard("shard-001")).unwrap();
        assert!(matches!(
            ring.add_shard(shard("shard-001")),
            Err(ShardisError::DuplicateShard(_))
        ));
    }

    #[test]
    fn lookup_is_deterministic_and_well_formed() {
        let ring = ConsistentHashRing::new(150).unwrap();
        for i in 0..5 {
            ring.add_shard(shard(&format!("shard-{i:03}"))).unwrap();
        }
        let snap = ring.snapshot();
        assert!(snap.is_well_formed());

        let mut distribution = std::collections::HashMap::new();
        for i in 0..1000 {
            let key = format!("user_{i}");
            let hash = crate::hash::DefaultKeyHasher.hash_key(key.as_str());
            let shard_id = snap.shard_for_hash(hash).unwrap().clone();
            let again = snap.shard_for_hash(hash).unwrap().clone();
            assert_eq!(shard_id, again);
            *distribution.entry(shard_id).or_insert(0) += 1;
        }
        for (_, count) in distribution {
            assert!(count < 600, "distribution too skewed: {count}");
        }
    }

    #[test]
    fn removing_a_shard_leaves_remaining_keys_routable() {
        let ring = ConsistentHashRing::new(50).unwrap();
        ring.add_shard(shard("a")).unwrap();
        ring.add_shard(shard("b")).unwrap();
        ring.remove_shard(&ShardId::new("a").unwrap());
        let snap = ring.snapshot();
        assert_eq!(snap.shard_count(), 1);
        assert!(snap.shard_for_hash(42).is_some());
    }

    #[test]
    fn concurrent_mutation_never_exposes_a_torn_snapshot() {
        let ring = ConsistentHashRing::new(20).unwrap();
        for i in 0..8 {
            ring.add_shard(shard(&format!("s{i}"))).unwrap();
        }
        let ring = Arc::new(ring);
        let barrier = Arc::new(Barrier::new(2));

        let reader_ring = ring.clone();
        let reader_barrier = barrier.clone();
        let reader = std::thread::spawn(move || {
            reader_barrier.wait();
            for _ in 0..2000 {
                let snap = reader_ring.snapshot();
                assert!(snap.is_well_formed());
            }
        });

        let writer_ring = ring.clone();
        let writer_barrier = barrier.clone();
        let writer = std::thread::spawn(move || {
            writer_barrier.wait();
            for i in 8..30 {
                writer_ring.add_shard(shard(&format!("s{i}"))).unwrap();
            }
        });

        reader.join().unwrap();
        writer.join().unwrap();
    }
}
