//! Topology snapshots and drift-hash computation: an immutable, versioned
//! view of the full key->shard assignment set, used to detect concurrent
//! topology mutation between plan time and execute time.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::ring::ShardId;

/// Immutable mapping `ShardKey<K> -> ShardId`, plus a monotonically
/// assigned version number. Produced by enumerating a map store (or,
/// in-memory, built directly) and consumed by the migration planner.
#[derive(Debug, Clone)]
pub struct TopologySnapshot<K: Eq + Hash + Clone> {
    version: u64,
    assignments: HashMap<K, ShardId>,
}

impl<K: Eq + Hash + Clone> TopologySnapshot<K> {
    pub fn new(version: u64, assignments: HashMap<K, ShardId>) -> Self {
        Self {
            version,
            assignments,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn shard_for(&self, key: &K) -> Option<&ShardId> {
        self.assignments.get(key)
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &ShardId)> {
        self.assignments.iter()
    }

    /// Order-independent digest of the full assignment set: XOR-folds a
    /// per-entry hash so that the result does not depend on iteration
    /// order. Used by the planner/executor to detect concurrent topology
    /// mutation between plan time and execute time.
    pub fn drift_hash(&self) -> u64
    where
        K: Hash,
    {
        self.assignments.iter().fold(0u64, |acc, (key, shard_id)| {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            shard_id.hash(&mut hasher);
            acc ^ hasher.finish()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(id: &str) -> ShardId {
        ShardId::new(id).unwrap()
    }

    #[test]
    fn drift_hash_is_order_independent() {
        let mut a = HashMap::new();
        a.insert("k1".to_string(), shard("s0"));
        a.insert("k2".to_string(), shard("s1"));
        let mut b = HashMap::new();
        b.insert("k2".to_string(), shard("s1"));
        b.insert("k1".to_string(), shard("s0"));

        let snap_a = TopologySnapshot::new(1, a);
        let snap_b = TopologySnapshot::new(1, b);
        assert_eq!(snap_a.drift_hash(), snap_b.drift_hash());
    }

    #[test]
    fn drift_hash_changes_on_reassignment() {
        let mut a = HashMap::new();
        a.insert("k1".to_string(), shard("s0"));
        let snap_a = TopologySnapshot::new(1, a.clone());

        a.insert("k1".to_string(), shard("s1"));
        let snap_b = TopologySnapshot::new(2, a);

        assert_ne!(snap_a.drift_hash(), snap_b.drift_hash());
    }
}
