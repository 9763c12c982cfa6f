//! Fan-out of per-shard asynchronous result streams into one merged
//! stream, in three explicit modes (unordered, ordered-streaming,
//! ordered-eager).

pub mod observer;
pub mod ordered;
pub mod unordered;

use futures::stream::BoxStream;

use crate::error::ShardisError;
use crate::ring::ShardId;

pub use observer::{MergeObserver, NoopObserver, StopReason};

/// A single shard's result stream, boxed for dynamic dispatch across
/// provider-neutral executors. Items are `Result` so a producer can
/// fail mid-stream.
pub type ShardResultStream<T> = BoxStream<'static, Result<T, ShardisError>>;

/// One target shard plus the stream that produces its results.
pub struct ShardProducer<T> {
    pub shard_id: ShardId,
    pub stream: ShardResultStream<T>,
}

impl<T> ShardProducer<T> {
    pub fn new(shard_id: ShardId, stream: ShardResultStream<T>) -> Self {
        Self { shard_id, stream }
    }
}

/// An item yielded by the merged stream, annotated with its origin shard.
#[derive(Debug, Clone)]
pub struct MergedItem<T> {
    pub shard_id: ShardId,
    pub value: T,
}

/// Channel capacity for the unordered merge / output channel. `None` means
/// unbounded.
#[derive(Debug, Clone, Copy)]
pub struct MergeConfig {
    pub channel_capacity: Option<usize>,
    pub prefetch_per_shard: usize,
    pub heap_sample_every: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: None,
            prefetch_per_shard: 1,
            heap_sample_every: 1,
        }
    }
}

impl MergeConfig {
    pub fn validate(&self) -> Result<(), ShardisError> {
        if self.prefetch_per_shard == 0 {
            return Err(ShardisError::InvalidConfiguration(
                "prefetch_per_shard must be >= 1".to_string(),
            ));
        }
        if self.heap_sample_every == 0 {
            return Err(ShardisError::InvalidConfiguration(
                "heap_sample_every must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// `channel.capacity` tag value: −1 for unbounded.
    pub fn capacity_tag(&self) -> i64 {
        self.channel_capacity.map(|c| c as i64).unwrap_or(-1)
    }
}
