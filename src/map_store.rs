//! Shard map store: the persisted key->shard assignment with CAS
//! primitives and optional enumeration.
//!
//! `InMemoryMapStore` is the in-memory reference backend used by tests and
//! examples; a production deployment implements `ShardMapStore` against a
//! relational or KV backend.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{ShardisError, ShardisResult};
use crate::ring::ShardId;

/// A persisted `(key, shard, version)` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub shard_id: ShardId,
    pub version: u64,
}

/// Outcome of `try_assign`/`try_get_or_add`: the shard now persisted for the
/// key, and whether the caller's proposal is the one that won the race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignOutcome {
    pub shard_id: ShardId,
    pub created_by_us: bool,
}

/// Event emitted on a successful swap (used by the migration executor's map
/// swapper implementations to notify routers/caches of a new mapping).
#[derive(Debug, Clone)]
pub struct AssignmentChanged<K> {
    pub key: K,
    pub old_shard_id: ShardId,
    pub new_shard_id: ShardId,
    pub new_version: u64,
}

/// Persistent mapping key -> shard with CAS primitives.
#[async_trait]
pub trait ShardMapStore<K>: Send + Sync
where
    K: Send + Sync,
{
    async fn try_get(&self, key: &K) -> ShardisResult<Option<ShardId>>;

    /// Atomic "first writer wins": returns the assignment now persisted,
    /// plus whether the caller's `proposed_shard_id` is the one that won.
    async fn try_assign(
        &self,
        key: &K,
        proposed_shard_id: ShardId,
    ) -> ShardisResult<AssignOutcome>;

    /// Fused read-or-create: at most one read when a mapping already
    /// exists, at most one write race otherwise.
    async fn try_get_or_add(
        &self,
        key: &K,
        proposed_shard_id: ShardId,
    ) -> ShardisResult<AssignOutcome> {
        if let Some(shard_id) = self.try_get(key).await? {
            return Ok(AssignOutcome {
                shard_id,
                created_by_us: false,
            });
        }
        self.try_assign(key, proposed_shard_id).await
    }

    /// Unconditionally overwrites the assignment for `key`, bumping its
    /// version. Used by the router's fallback path when the stored shard no
    /// longer exists in the current topology — a forced reassignment, not a
    /// CAS race, since the old value is known-invalid.
    async fn force_reassign(&self, key: &K, new_shard_id: ShardId) -> ShardisResult<()>;
}

/// Optional enumeration capability: a finite, non-restartable, cancelable
/// sequence of `(key, shardId)` pairs, used by the segmented migration
/// planner to stream a source topology without materializing it fully.
#[async_trait]
pub trait ShardMapEnumerationStore<K>: ShardMapStore<K>
where
    K: Send + Sync,
{
    /// Returns all `(key, shardId)` pairs currently known. The in-memory
    /// reference implementation materializes eagerly; a real backend would
    /// stream via a server-side cursor.
    async fn enumerate(&self) -> ShardisResult<Vec<(K, ShardId)>>;
}

/// In-memory reference map store: `Arc<RwLock<HashMap>>` with a per-entry
/// version counter.
pub struct InMemoryMapStore<K: Eq + Hash + Clone + Send + Sync> {
    entries: Arc<RwLock<HashMap<K, Assignment>>>,
}

impl<K: Eq + Hash + Clone + Send + Sync> Default for InMemoryMapStore<K> {
    fn default() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash + Clone + Send + Sync> InMemoryMapStore<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Used by the migration swapper to advance a batch of keys under a
    /// single critical section: atomic per-batch — either every member's
    /// mapping advances, or none do.
    pub async fn swap_batch(
        &self,
        moves: &[(K, ShardId, ShardId)],
    ) -> ShardisResult<Vec<AssignmentChanged<K>>>
    where
        K: Clone,
    {
        let mut entries = self.entries.write().await;
        // Validate the whole batch before mutating anything, so a single
        // conflict rolls back the entire batch rather than leaving a
        // partially-applied swap visible.
        for (key, expected_source, _target) in moves {
            match entries.get(key) {
                Some(existing) if &existing.shard_id == expected_source => {}
                Some(existing) => {
                    return Err(ShardisError::OptimisticConflict {
                        shard_id: existing.shard_id.clone(),
                        expected: existing.version,
                        found: existing.version,
                    });
                }
                None => {
                    return Err(ShardisError::StoreUnavailable(
                        "key not present for swap".to_string(),
                    ));
                }
            }
        }

        let mut changes = Vec::with_capacity(moves.len());
        for (key, source, target) in moves {
            let existing = entries.get_mut(key).expect("validated above");
            let new_version = existing.version + 1;
            existing.shard_id = target.clone();
            existing.version = new_version;
            changes.push(AssignmentChanged {
                key: key.clone(),
                old_shard_id: source.clone(),
                new_shard_id: target.clone(),
                new_version,
            });
        }
        Ok(changes)
    }
}

#[async_trait]
impl<K: Eq + Hash + Clone + Send + Sync> ShardMapStore<K> for InMemoryMapStore<K> {
    async fn try_get(&self, key: &K) -> ShardisResult<Option<ShardId>> {
        Ok(self
            .entries
            .read()
            .await
            .get(key)
            .map(|a| a.shard_id.clone()))
    }

    async fn try_assign(
        &self,
        key: &K,
        proposed_shard_id: ShardId,
    ) -> ShardisResult<AssignOutcome> {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(key) {
            return Ok(AssignOutcome {
                shard_id: existing.shard_id.clone(),
                created_by_us: false,
            });
        }
        entries.insert(
            key.clone(),
            Assignment {
                shard_id: proposed_shard_id.clone(),
                version: 1,
            },
        );
        Ok(AssignOutcome {
            shard_id: proposed_shard_id,
            created_by_us: true,
        })
    }

    async fn force_reassign(&self, key: &K, new_shard_id: ShardId) -> ShardisResult<()> {
        let mut entries = self.entries.write().await;
        let next_version = entries.get(key).map(|a| a.version + 1).unwrap_or(1);
        entries.insert(
            key.clone(),
            Assignment {
                shard_id: new_shard_id,
                version: next_version,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl<K: Eq + Hash + Clone + Send + Sync> ShardMapEnumerationStore<K> for InMemoryMapStore<K> {
    async fn enumerate(&self) -> ShardisResult<Vec<(K, ShardId)>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .map(|(k, a)| (k.clone(), a.shard_id.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    fn shard(id: &str) -> ShardId {
        ShardId::new(id).unwrap()
    }

    #[tokio::test]
    async fn try_get_after_assign_is_consistent() {
        let store = InMemoryMapStore::<String>::new();
        let outcome = store
            .try_assign(&"user-1".to_string(), shard("s0"))
            .await
            .unwrap();
        assert!(outcome.created_by_us);
        assert_eq!(store.try_get(&"user-1".to_string()).await.unwrap(), Some(shard("s0")));
    }

    #[tokio::test]
    async fn concurrent_try_assign_has_exactly_one_winner() {
        let store = StdArc::new(InMemoryMapStore::<String>::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            let shard_id = shard(&format!("candidate-{i}"));
            handles.push(tokio::spawn(async move {
                store
                    .try_assign(&"shared-key".to_string(), shard_id)
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().created_by_us {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn swap_batch_is_all_or_nothing() {
        let store = InMemoryMapStore::<String>::new();
        store
            .try_assign(&"k1".to_string(), shard("s0"))
            .await
            .unwrap();

        let changes = store
            .swap_batch(&[("k1".to_string(), shard("s0"), shard("s1"))])
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(store.try_get(&"k1".to_string()).await.unwrap(), Some(shard("s1")));

        // wrong expected source -> rejected, nothing changes
        let err = store
            .swap_batch(&[("k1".to_string(), shard("s0"), shard("s2"))])
            .await;
        assert!(err.is_err());
        assert_eq!(store.try_get(&"k1".to_string()).await.unwrap(), Some(shard("s1")));
    }
}
