//! An immutable description of a query plus fail-fast / best-effort
//! execution wrappers over the merge core.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ShardisError;
use crate::merge::{MergeObserver, MergedItem, ShardProducer};
use crate::metrics::{QueryLatencyMetrics, QueryLatencyTags};
use crate::ring::ShardId;

/// A predicate pushed down to a backend. Shardis does not interpret the
/// predicate itself; it only ferries it to `IShardQueryExecutor`
/// implementations, which translate it or raise `QueryTranslation`.
#[derive(Debug, Clone)]
pub struct Predicate {
    pub field: String,
    pub operator: String,
    pub value: String,
}

#[derive(Debug, Clone, Default)]
pub struct Projection {
    pub fields: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Ordering {
    pub field: String,
    pub ascending: bool,
}

/// Immutable description of a cross-shard query. `target_shards`, when
/// `Some`, restricts fan-out to the named shards; unknown ids are excluded
/// and counted (`invalid.shard.count`), never silently dropped without
/// accounting.
#[derive(Debug, Clone)]
pub struct QueryModel {
    pub root_type: String,
    pub predicates: Vec<Predicate>,
    pub projection: Option<Projection>,
    pub ordering: Option<Ordering>,
    pub target_shards: Option<Vec<ShardId>>,
    pub concurrency_limit: Option<usize>,
    pub channel_capacity: Option<usize>,
}

impl QueryModel {
    pub fn new(root_type: impl Into<String>) -> Self {
        Self {
            root_type: root_type.into(),
            predicates: Vec::new(),
            projection: None,
            ordering: None,
            target_shards: None,
            concurrency_limit: None,
            channel_capacity: None,
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn with_target_shards(mut self, shards: Vec<ShardId>) -> Self {
        self.target_shards = Some(shards);
        self
    }
}

/// Resolves a `QueryModel`'s `target_shards` against the live shard set,
/// separating valid targets from invalid ids. When `target_shards` is
/// `None`, every known shard is a target.
pub fn resolve_targets(model: &QueryModel, known_shards: &[ShardId]) -> ResolvedTargets {
    match &model.target_shards {
        None => ResolvedTargets {
            valid: known_shards.to_vec(),
            invalid_count: 0,
        },
        Some(requested) => {
            let known: HashSet<&ShardId> = known_shards.iter().collect();
            let mut valid = Vec::with_capacity(requested.len());
            let mut invalid_count = 0;
            for shard_id in requested {
                if known.contains(shard_id) {
                    valid.push(shard_id.clone());
                } else {
                    invalid_count += 1;
                }
            }
            ResolvedTargets {
                valid,
                invalid_count,
            }
        }
    }
}

pub struct ResolvedTargets {
    pub valid: Vec<ShardId>,
    pub invalid_count: usize,
}

/// Per-shard query execution, translating a `QueryModel` into a result
/// stream for one shard. Implementations MUST raise `QueryTranslation`
/// rather than silently falling back to client-side evaluation when a
/// predicate cannot be pushed down.
#[async_trait]
pub trait ShardQueryExecutor<T: Send + 'static>: Send + Sync {
    async fn execute_on_shard(
        &self,
        shard_id: &ShardId,
        model: &QueryModel,
        cancellation: &CancellationToken,
    ) -> Result<ShardProducer<T>, ShardisError>;
}

/// Outcome of a wrapped enumeration, carrying the fields the terminal
/// latency emission needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    FailFast,
    BestEffort,
}

impl FailureMode {
    fn tag(self) -> &'static str {
        match self {
            FailureMode::FailFast => "fail-fast",
            FailureMode::BestEffort => "best-effort",
        }
    }
}

/// Drives fan-out across every resolved target shard and funnels each
/// shard's result stream through the unordered merge, recording exactly
/// one query-latency histogram point at completion regardless of how
/// many shards participated or failed.
pub struct QueryRunner<T: Send + 'static> {
    executor: Arc<dyn ShardQueryExecutor<T>>,
    metrics: Arc<dyn QueryLatencyMetrics>,
    observer: Arc<dyn MergeObserver>,
    db_system: String,
    provider: String,
}

impl<T: Send + 'static> QueryRunner<T> {
    pub fn new(
        executor: Arc<dyn ShardQueryExecutor<T>>,
        metrics: Arc<dyn QueryLatencyMetrics>,
        observer: Arc<dyn MergeObserver>,
        db_system: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            metrics,
            observer,
            db_system: db_system.into(),
            provider: provider.into(),
        }
    }

    /// Executes `model` across `known_shards`, merging unordered, under
    /// the given failure mode. Always emits exactly one latency point,
    /// even when every target shard is invalid or zero shards are queried.
    pub async fn run(
        &self,
        model: &QueryModel,
        known_shards: &[ShardId],
        failure_mode: FailureMode,
        cancellation: CancellationToken,
    ) -> Result<Vec<MergedItem<T>>, ShardisError> {
        let start = Instant::now();
        let resolved = resolve_targets(model, known_shards);

        if resolved.valid.is_empty() {
            self.emit_latency(start, &resolved, 0, model.channel_capacity, failure_mode, model.root_type.clone(), "ok");
            return Ok(Vec::new());
        }

        let mut producers = Vec::with_capacity(resolved.valid.len());
        for shard_id in &resolved.valid {
            match self.executor.execute_on_shard(shard_id, model, &cancellation).await {
                Ok(producer) => producers.push(producer),
                Err(err) if failure_mode == FailureMode::FailFast => {
                    self.emit_latency(start, &resolved, 0, model.channel_capacity, failure_mode, model.root_type.clone(), "failed");
                    return Err(err);
                }
                Err(_) => continue,
            }
        }

        let fanout_concurrency = producers.len();
        let mut merged = crate::merge::unordered::merge_unordered(
            producers,
            crate::merge::MergeConfig {
                channel_capacity: model.channel_capacity,
                ..Default::default()
            },
            self.observer.clone(),
            cancellation,
        );

        use futures::StreamExt;

        let mut ok_items = Vec::new();
        let mut first_error = None;
        while let Some(item) = merged.next().await {
            match item {
                Ok(value) => ok_items.push(value),
                Err(err) => {
                    if failure_mode == FailureMode::FailFast {
                        first_error = Some(err);
                        break;
                    }
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        let status = match failure_mode {
            FailureMode::FailFast => {
                if first_error.is_some() {
                    "failed"
                } else {
                    "ok"
                }
            }
            FailureMode::BestEffort => {
                if ok_items.is_empty() {
                    "failed"
                } else {
                    "ok"
                }
            }
        };

        self.emit_latency(
            start,
            &resolved,
            fanout_concurrency,
            model.channel_capacity,
            failure_mode,
            model.root_type.clone(),
            status,
        );

        match (failure_mode, first_error) {
            (FailureMode::FailFast, Some(err)) => Err(err),
            _ => Ok(ok_items),
        }
    }

    fn emit_latency(
        &self,
        start: Instant,
        resolved: &ResolvedTargets,
        fanout_concurrency: usize,
        channel_capacity: Option<usize>,
        failure_mode: FailureMode,
        root_type: String,
        result_status: &'static str,
    ) {
        let millis = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics.record_query_latency(
            millis,
            QueryLatencyTags {
                db_system: self.db_system.clone(),
                provider: self.provider.clone(),
                shard_count: resolved.valid.len() + resolved.invalid_count,
                target_shard_count: resolved.valid.len(),
                invalid_shard_count: resolved.invalid_count,
                merge_strategy: "unordered",
                ordering_buffered: false,
                fanout_concurrency,
                channel_capacity: channel_capacity.map(|c| c as i64).unwrap_or(-1),
                failure_mode: failure_mode.tag(),
                result_status,
                root_type,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::NoopObserver;
    use crate::metrics::InProcessMetrics;
    use futures::stream::{self, StreamExt};

    struct StaticExecutor;

    #[async_trait]
    impl ShardQueryExecutor<i32> for StaticExecutor {
        async fn execute_on_shard(
            &self,
            shard_id: &ShardId,
            _model: &QueryModel,
            _cancellation: &CancellationToken,
        ) -> Result<ShardProducer<i32>, ShardisError> {
            if shard_id.as_str() == "bad" {
                return Err(ShardisError::ShardUnavailable(shard_id.clone()));
            }
            Ok(ShardProducer::new(
                shard_id.clone(),
                stream::iter(vec![Ok(1), Ok(2)]).boxed(),
            ))
        }
    }

    #[tokio::test]
    async fn all_invalid_targets_is_a_fast_ok_path() {
        let runner = QueryRunner::new(
            Arc::new(StaticExecutor),
            InProcessMetrics::new(),
            Arc::new(NoopObserver),
            "shardis",
            "test",
        );
        let model = QueryModel::new("Widget")
            .with_target_shards(vec![ShardId::new("ghost").unwrap()]);
        let result = runner
            .run(&model, &[], FailureMode::BestEffort, CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn best_effort_suppresses_a_single_shard_failure() {
        let runner = QueryRunner::new(
            Arc::new(StaticExecutor),
            InProcessMetrics::new(),
            Arc::new(NoopObserver),
            "shardis",
            "test",
        );
        let good = ShardId::new("good").unwrap();
        let bad = ShardId::new("bad").unwrap();
        let model = QueryModel::new("Widget");
        let result = runner
            .run(&model, &[good, bad], FailureMode::BestEffort, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
    }
}
