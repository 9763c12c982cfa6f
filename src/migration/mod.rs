//! Plans a key rebalance between two topology snapshots and drives it
//! through copy -> verify -> swap with retries, checkpointing, and
//! batched atomic swap.

pub mod checkpoint;
pub mod executor;
pub mod inmemory;
pub mod plan;

pub use checkpoint::{
    InMemoryCheckpointStore, KeyMoveState, MigrationCheckpoint, ShardMigrationCheckpointStore,
};
pub use executor::{ExecutorConfig, MigrationExecutor, MigrationSummary};
pub use inmemory::{InMemoryDataMover, InMemoryMapSwapper, InMemoryShardData, InMemoryVerifier};
pub use plan::{KeyMove, MigrationPlan, PlanDryRunSummary, SegmentedPlanner};

use crate::error::ShardisResult;
use crate::ring::ShardId;

/// `IShardDataMover<K>`: copies one key's data from its source shard to
/// its target shard.
#[async_trait::async_trait]
pub trait ShardDataMover<K: Send + Sync>: Send + Sync {
    async fn copy(&self, key: &K, source: &ShardId, target: &ShardId) -> ShardisResult<()>;
}

/// `IVerificationStrategy<K>`: confirms a copy landed correctly.
#[async_trait::async_trait]
pub trait VerificationStrategy<K: Send + Sync>: Send + Sync {
    async fn verify(&self, key: &K, source: &ShardId, target: &ShardId) -> ShardisResult<bool>;
}

/// `IShardMapSwapper<K>`: advances a batch of keys' persisted assignment
/// atomically, all-or-nothing.
#[async_trait::async_trait]
pub trait ShardMapSwapper<K: Send + Sync>: Send + Sync {
    async fn swap(&self, moves: &[KeyMove<K>]) -> ShardisResult<()>
    where
        K: Clone;
}
