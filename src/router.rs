//! Routers: resolve key -> shard using the map store, emitting the
//! single-miss-invariant metrics.
//!
//! A `RouteStrategy` (default-modulo vs. consistent-hash) sits behind a
//! shared `route()` contract; the miss-dedup set is bounded with an
//! `lru::LruCache` so it cannot grow without limit.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::ShardisResult;
use crate::hash::ShardKeyHasher;
use crate::map_store::ShardMapStore;
use crate::metrics::ShardisMetrics;
use crate::ring::{ConsistentHashRing, ShardId};

/// Default bound on the miss-dedup set.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Pluggable shard-selection strategy used on a map-store miss.
#[async_trait]
pub trait RouteStrategy<K: Send + Sync>: Send + Sync {
    async fn select_shard(&self, key: &K) -> ShardisResult<ShardId>;
}

/// `keyHash mod shardCount` strategy; shard set fixed after construction.
pub struct DefaultStrategy<K> {
    shards: Vec<ShardId>,
    hasher: Arc<dyn ShardKeyHasher<K>>,
}

impl<K> DefaultStrategy<K> {
    pub fn new(shards: Vec<ShardId>, hasher: Arc<dyn ShardKeyHasher<K>>) -> ShardisResult<Self> {
        if shards.is_empty() {
            return Err(crate::error::ShardisError::InvalidConfiguration(
                "shard set must be non-empty".to_string(),
            ));
        }
        Ok(Self { shards, hasher })
    }
}

#[async_trait]
impl<K: Send + Sync> RouteStrategy<K> for DefaultStrategy<K> {
    async fn select_shard(&self, key: &K) -> ShardisResult<ShardId> {
        let hash = self.hasher.hash_key(key);
        let index = (hash as usize) % self.shards.len();
        Ok(self.shards[index].clone())
    }
}

/// Consistent-hash strategy backed by a live `ConsistentHashRing`;
/// supports dynamic topology.
pub struct ConsistentHashStrategy<K> {
    ring: Arc<ConsistentHashRing>,
    hasher: Arc<dyn ShardKeyHasher<K>>,
}

impl<K> ConsistentHashStrategy<K> {
    pub fn new(ring: Arc<ConsistentHashRing>, hasher: Arc<dyn ShardKeyHasher<K>>) -> Self {
        Self { ring, hasher }
    }
}

#[async_trait]
impl<K: Send + Sync> RouteStrategy<K> for ConsistentHashStrategy<K> {
    async fn select_shard(&self, key: &K) -> ShardisResult<ShardId> {
        let hash = self.hasher.hash_key(key);
        let snapshot = self.ring.snapshot();
        snapshot
            .shard_for_hash(hash)
            .cloned()
            .ok_or_else(|| crate::error::ShardisError::InvalidConfiguration(
                "ring has no shards".to_string(),
            ))
    }
}

/// Outcome of a single `route()` call, distinguishing a pre-existing
/// assignment from a freshly-created one, for callers that want to mirror
/// `RouteHit`/`RouteMiss` without re-deriving it from metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub shard_id: ShardId,
    pub was_miss: bool,
}

/// Resolves key -> shard using a `RouteStrategy` + `ShardMapStore` +
/// metrics, reporting a miss at most once per key via a bounded
/// dedup set of keys for which a miss has already been reported.
pub struct Router<K: Eq + Hash + Clone + Send + Sync> {
    name: String,
    strategy: Arc<dyn RouteStrategy<K>>,
    map_store: Arc<dyn ShardMapStore<K>>,
    metrics: Arc<dyn ShardisMetrics>,
    reported_misses: Mutex<lru::LruCache<K, ()>>,
    ring: Option<Arc<ConsistentHashRing>>,
}

impl<K: Eq + Hash + Clone + Send + Sync> Router<K> {
    pub fn new(
        name: impl Into<String>,
        strategy: Arc<dyn RouteStrategy<K>>,
        map_store: Arc<dyn ShardMapStore<K>>,
        metrics: Arc<dyn ShardisMetrics>,
    ) -> Self {
        Self::with_dedup_capacity(
            name,
            strategy,
            map_store,
            metrics,
            DEFAULT_DEDUP_CAPACITY,
        )
    }

    pub fn with_dedup_capacity(
        name: impl Into<String>,
        strategy: Arc<dyn RouteStrategy<K>>,
        map_store: Arc<dyn ShardMapStore<K>>,
        metrics: Arc<dyn ShardisMetrics>,
        dedup_capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(dedup_capacity.max(1)).unwrap();
        Self {
            name: name.into(),
            strategy,
            map_store,
            metrics,
            reported_misses: Mutex::new(lru::LruCache::new(capacity)),
            ring: None,
        }
    }

    /// Attaches the live ring so the router can detect a stale stored
    /// assignment (fallback path).
    pub fn with_ring(mut self, ring: Arc<ConsistentHashRing>) -> Self {
        self.ring = Some(ring);
        self
    }

    /// Resolves `key` to a shard, consulting the map store first and
    /// falling back to the strategy on a miss or a stale stored value.
    pub async fn route(&self, key: &K) -> ShardisResult<ShardId> {
        if let Some(existing) = self.map_store.try_get(key).await? {
            if self.is_stale(&existing) {
                warn!(
                    router = %self.name,
                    shard = %existing,
                    "stored assignment points to a shard no longer in the topology; reassigning"
                );
                let candidate = self.strategy.select_shard(key).await?;
                self.map_store.force_reassign(key, candidate.clone()).await?;
                return Ok(self.record_fresh_miss(key, candidate));
            }
            self.metrics.route_hit(&self.name, &existing, true);
            return Ok(existing);
        }
        self.reassign_as_fresh_miss(key).await
    }

    fn is_stale(&self, shard_id: &ShardId) -> bool {
        match &self.ring {
            Some(ring) => !ring.snapshot().contains_shard(shard_id),
            None => false,
        }
    }

    async fn reassign_as_fresh_miss(&self, key: &K) -> ShardisResult<ShardId> {
        let candidate = self.strategy.select_shard(key).await?;
        let outcome = self.map_store.try_get_or_add(key, candidate).await?;

        if outcome.created_by_us {
            Ok(self.record_fresh_miss(key, outcome.shard_id))
        } else {
            self.metrics.route_hit(&self.name, &outcome.shard_id, true);
            Ok(outcome.shard_id)
        }
    }

    /// Reports exactly one `RouteMiss` for `key` across the router's
    /// lifetime (the dedup set is authoritative even across contending
    /// `tryGetOrAdd` winners and across the stale-reassignment path), then
    /// the paired `RouteHit(existing=false)`.
    fn record_fresh_miss(&self, key: &K, shard_id: ShardId) -> ShardId {
        let first_report = {
            let mut reported = self.reported_misses.lock().unwrap();
            if reported.contains(key) {
                false
            } else {
                reported.put(key.clone(), ());
                true
            }
        };

        if first_report {
            debug!(router = %self.name, shard = %shard_id, "route miss");
            self.metrics.route_miss(&self.name);
            self.metrics.route_hit(&self.name, &shard_id, false);
        } else {
            self.metrics.route_hit(&self.name, &shard_id, true);
        }
        shard_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::DefaultKeyHasher;
    use crate::map_store::InMemoryMapStore;
    use crate::metrics::InProcessMetrics;
    use std::sync::Arc as StdArc;

    fn shard(id: &str) -> ShardId {
        ShardId::new(id).unwrap()
    }

    fn default_router() -> Router<String> {
        let strategy = StdArc::new(
            DefaultStrategy::new(
                vec![shard("shard-001"), shard("shard-002")],
                StdArc::new(DefaultKeyHasher),
            )
            .unwrap(),
        );
        let map_store = StdArc::new(InMemoryMapStore::<String>::new());
        let metrics = InProcessMetrics::new();
        Router::new("default", strategy, map_store, metrics)
    }

    #[tokio::test]
    async fn routing_is_deterministic_across_repeated_calls() {
        let router = default_router();
        let key = "user-451".to_string();
        let first = router.route(&key).await.unwrap();
        for _ in 0..10_000 {
            assert_eq!(router.route(&key).await.unwrap(), first);
        }
    }

    #[tokio::test]
    async fn exactly_one_route_miss_is_recorded_under_concurrency() {
        let strategy = StdArc::new(
            DefaultStrategy::new(
                vec![shard("shard-001"), shard("shard-002")],
                StdArc::new(DefaultKeyHasher),
            )
            .unwrap(),
        );
        let map_store = StdArc::new(InMemoryMapStore::<String>::new());
        let metrics = InProcessMetrics::new();
        let router = StdArc::new(Router::new(
            "default",
            strategy,
            map_store,
            metrics.clone(),
        ));

        let mut handles = Vec::new();
        for _ in 0..64 {
            let router = router.clone();
            handles.push(tokio::spawn(async move {
                router.route(&"user-451".to_string()).await.unwrap()
            }));
        }
        let mut shards = std::collections::HashSet::new();
        for handle in handles {
            shards.insert(handle.await.unwrap());
        }
        assert_eq!(shards.len(), 1);
        assert_eq!(metrics.route_miss_count("default"), 1);
    }

    #[tokio::test]
    async fn stale_assignment_triggers_fresh_miss() {
        let ring = StdArc::new(ConsistentHashRing::new(10).unwrap());
        ring.add_shard(crate::ring::ShardInfo::new(shard("a"), "conn://a"))
            .unwrap();
        let strategy = StdArc::new(ConsistentHashStrategy::new(
            ring.clone(),
            StdArc::new(DefaultKeyHasher),
        ));
        let map_store = StdArc::new(InMemoryMapStore::<String>::new());
        // simulate a pre-existing assignment to a shard that no longer exists
        map_store
            .try_assign(&"k".to_string(), shard("stale-shard"))
            .await
            .unwrap();
        let metrics = InProcessMetrics::new();
        let router = Router::new("ch", strategy, map_store, metrics.clone()).with_ring(ring);

        let resolved = router.route(&"k".to_string()).await.unwrap();
        assert_eq!(resolved, shard("a"));
        assert_eq!(metrics.route_miss_count("ch"), 1);
    }
}
