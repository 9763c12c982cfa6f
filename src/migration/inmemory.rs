//! Concrete, fully-working implementations of the migration collaborator
//! traits, sufficient to exercise the planner and executor end-to-end
//! without a real database. Test/demo scaffolding, not a production data
//! mover.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::{ShardisError, ShardisResult};
use crate::map_store::InMemoryMapStore;
use crate::ring::ShardId;

use super::plan::KeyMove;
use super::{ShardDataMover, ShardMapSwapper, VerificationStrategy};

/// A shard-partitioned in-memory record store: `shard -> key -> value`.
/// `InMemoryDataMover` copies a record between two shards' partitions;
/// `InMemoryVerifier` confirms the copy landed byte-for-byte.
pub struct InMemoryShardData<K: Eq + Hash + Clone, V: Clone> {
    partitions: RwLock<HashMap<ShardId, HashMap<K, V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> Default for InMemoryShardData<K, V> {
    fn default() -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> InMemoryShardData<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, shard_id: &ShardId, key: K, value: V) {
        self.partitions
            .write()
            .unwrap()
            .entry(shard_id.clone())
            .or_default()
            .insert(key, value);
    }

    pub fn get(&self, shard_id: &ShardId, key: &K) -> Option<V> {
        self.partitions
            .read()
            .unwrap()
            .get(shard_id)
            .and_then(|records| records.get(key))
            .cloned()
    }
}

/// Copies a record from its source partition to its target partition.
/// Fails with `CopyFailure` if the source has no record for the key — the
/// only way a real mover can fail deterministically in memory.
pub struct InMemoryDataMover<K: Eq + Hash + Clone + Send + Sync, V: Clone + Send + Sync> {
    data: Arc<InMemoryShardData<K, V>>,
}

impl<K: Eq + Hash + Clone + Send + Sync, V: Clone + Send + Sync> InMemoryDataMover<K, V> {
    pub fn new(data: Arc<InMemoryShardData<K, V>>) -> Self {
        Self { data }
    }
}

#[async_trait]
impl<K, V> ShardDataMover<K> for InMemoryDataMover<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    async fn copy(&self, key: &K, source: &ShardId, target: &ShardId) -> ShardisResult<()> {
        let value = self.data.get(source, key).ok_or_else(|| ShardisError::CopyFailure {
            index: 0,
            reason: "no record in source partition".to_string(),
        })?;
        self.data.put(target, key.clone(), value);
        Ok(())
    }
}

/// Confirms a prior `InMemoryDataMover::copy` landed by comparing the
/// target partition's record back against the source's, via `PartialEq`.
pub struct InMemoryVerifier<K: Eq + Hash + Clone + Send + Sync, V: Clone + Send + Sync + PartialEq> {
    data: Arc<InMemoryShardData<K, V>>,
}

impl<K, V> InMemoryVerifier<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync + PartialEq,
{
    pub fn new(data: Arc<InMemoryShardData<K, V>>) -> Self {
        Self { data }
    }
}

#[async_trait]
impl<K, V> VerificationStrategy<K> for InMemoryVerifier<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync + PartialEq,
{
    async fn verify(&self, key: &K, source: &ShardId, target: &ShardId) -> ShardisResult<bool> {
        let source_value = self.data.get(source, key);
        let target_value = self.data.get(target, key);
        Ok(source_value.is_some() && source_value == target_value)
    }
}

/// Advances a batch of keys' persisted assignment in `InMemoryMapStore`
/// under a single critical section.
pub struct InMemoryMapSwapper<K: Eq + Hash + Clone + Send + Sync> {
    store: Arc<InMemoryMapStore<K>>,
}

impl<K: Eq + Hash + Clone + Send + Sync> InMemoryMapSwapper<K> {
    pub fn new(store: Arc<InMemoryMapStore<K>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<K: Eq + Hash + Clone + Send + Sync> ShardMapSwapper<K> for InMemoryMapSwapper<K> {
    async fn swap(&self, moves: &[KeyMove<K>]) -> ShardisResult<()>
    where
        K: Clone,
    {
        let triples: Vec<_> = moves
            .iter()
            .map(|m| (m.key.clone(), m.source.clone(), m.target.clone()))
            .collect();
        self.store.swap_batch(&triples).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(id: &str) -> ShardId {
        ShardId::new(id).unwrap()
    }

    #[tokio::test]
    async fn mover_copies_and_verifier_confirms() {
        let data = Arc::new(InMemoryShardData::<String, String>::new());
        data.put(&shard("0"), "k1".to_string(), "payload".to_string());

        let mover = InMemoryDataMover::new(data.clone());
        mover.copy(&"k1".to_string(), &shard("0"), &shard("1")).await.unwrap();

        let verifier = InMemoryVerifier::new(data.clone());
        assert!(verifier
            .verify(&"k1".to_string(), &shard("0"), &shard("1"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn copy_without_source_record_fails() {
        let data = Arc::new(InMemoryShardData::<String, String>::new());
        let mover = InMemoryDataMover::new(data);
        let result = mover.copy(&"missing".to_string(), &shard("0"), &shard("1")).await;
        assert!(matches!(result, Err(ShardisError::CopyFailure { .. })));
    }

    #[tokio::test]
    async fn swapper_advances_map_store() {
        let store = Arc::new(InMemoryMapStore::<String>::new());
        use crate::map_store::ShardMapStore;
        store.try_assign(&"k1".to_string(), shard("0")).await.unwrap();

        let swapper = InMemoryMapSwapper::new(store.clone());
        let moves = vec![KeyMove::new("k1".to_string(), shard("0"), shard("1")).unwrap()];
        swapper.swap(&moves).await.unwrap();

        assert_eq!(store.try_get(&"k1".to_string()).await.unwrap(), Some(shard("1")));
    }
}
