//! Drives a `MigrationPlan` through copy -> verify -> swap with bounded
//! concurrency, exponential-backoff retry, checkpointing, and atomic
//! batched swap.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ShardisError, ShardisResult};
use crate::metrics::ShardMigrationMetrics;
use crate::topology::TopologySnapshot;

use super::checkpoint::{normalize_resumed_state, KeyMoveState, MigrationCheckpoint, ShardMigrationCheckpointStore};
use super::plan::{KeyMove, MigrationPlan};
use super::{ShardDataMover, ShardMapSwapper, VerificationStrategy};

/// Migration tunables.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub copy_concurrency: usize,
    pub verify_concurrency: usize,
    pub swap_batch_size: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub interleave_copy_and_verify: bool,
    pub force_swap_on_verification_failure: bool,
    pub checkpoint_flush_interval: Duration,
    pub checkpoint_flush_every_transitions: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            copy_concurrency: 32,
            verify_concurrency: 32,
            swap_batch_size: 500,
            max_retries: 5,
            retry_base_delay: Duration::from_millis(100),
            interleave_copy_and_verify: true,
            force_swap_on_verification_failure: false,
            checkpoint_flush_interval: Duration::from_secs(2),
            checkpoint_flush_every_transitions: 1000,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> ShardisResult<()> {
        let in_range = |v: usize, lo: usize, hi: usize| v >= lo && v <= hi;
        if !in_range(self.copy_concurrency, 1, 1024) {
            return Err(ShardisError::InvalidConfiguration(
                "copy_concurrency must be in [1, 1024]".to_string(),
            ));
        }
        if !in_range(self.verify_concurrency, 1, 1024) {
            return Err(ShardisError::InvalidConfiguration(
                "verify_concurrency must be in [1, 1024]".to_string(),
            ));
        }
        if !in_range(self.swap_batch_size, 1, 100_000) {
            return Err(ShardisError::InvalidConfiguration(
                "swap_batch_size must be in [1, 100000]".to_string(),
            ));
        }
        if self.retry_base_delay.is_zero() {
            return Err(ShardisError::InvalidConfiguration(
                "retry_base_delay must be > 0".to_string(),
            ));
        }
        if self.checkpoint_flush_interval.is_zero() {
            return Err(ShardisError::InvalidConfiguration(
                "checkpoint_flush_interval must be > 0".to_string(),
            ));
        }
        if self.checkpoint_flush_every_transitions == 0
            || self.checkpoint_flush_every_transitions > 1_000_000
        {
            return Err(ShardisError::InvalidConfiguration(
                "checkpoint_flush_every_transitions must be in [1, 1000000]".to_string(),
            ));
        }
        Ok(())
    }
}

/// `{planned, done, failed, elapsed}`.
#[derive(Debug, Clone)]
pub struct MigrationSummary {
    pub planned: usize,
    pub done: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Exponential backoff with full jitter (base * 2^(attempt-1), capped at
/// `MAX_BACKOFF`, then scaled by a uniform `[0.5, 1.0)` factor) so a batch
/// of keys retrying together doesn't re-attempt in lockstep.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    let capped = base.checked_mul(factor).unwrap_or(MAX_BACKOFF).min(MAX_BACKOFF);
    let jitter = rand::random::<f64>() * 0.5 + 0.5;
    capped.mul_f64(jitter)
}

/// Drives one `MigrationPlan` to completion. Owned exclusively by the
/// caller for the duration of a `run()` call.
pub struct MigrationExecutor<K: Eq + Hash + Ord + Clone + Send + Sync + 'static> {
    mover: Arc<dyn ShardDataMover<K>>,
    verifier: Arc<dyn VerificationStrategy<K>>,
    swapper: Arc<dyn ShardMapSwapper<K>>,
    checkpoint_store: Arc<dyn ShardMigrationCheckpointStore<K>>,
    metrics: Arc<dyn ShardMigrationMetrics>,
    config: ExecutorConfig,
}

impl<K: Eq + Hash + Ord + Clone + Send + Sync + 'static> MigrationExecutor<K> {
    pub fn new(
        mover: Arc<dyn ShardDataMover<K>>,
        verifier: Arc<dyn VerificationStrategy<K>>,
        swapper: Arc<dyn ShardMapSwapper<K>>,
        checkpoint_store: Arc<dyn ShardMigrationCheckpointStore<K>>,
        metrics: Arc<dyn ShardMigrationMetrics>,
        config: ExecutorConfig,
    ) -> ShardisResult<Self> {
        config.validate()?;
        Ok(Self {
            mover,
            verifier,
            swapper,
            checkpoint_store,
            metrics,
            config,
        })
    }

    /// Runs `plan` to completion, resuming from any existing checkpoint.
    /// The topology drift check is mandatory: if `current_source` no
    /// longer hashes to `plan.source_drift_hash`, the run aborts before
    /// touching any key.
    pub async fn run(
        &self,
        plan: &MigrationPlan<K>,
        current_source: &TopologySnapshot<K>,
        cancellation: CancellationToken,
    ) -> ShardisResult<MigrationSummary> {
        let start = Instant::now();

        if current_source.drift_hash() != plan.source_drift_hash {
            return Err(ShardisError::TopologyDrift {
                plan_id: plan.plan_id,
                expected: plan.source_drift_hash,
                observed: current_source.drift_hash(),
            });
        }

        self.metrics.inc_planned(plan.len() as u64);

        let existing = self.checkpoint_store.load(plan.plan_id).await?;
        let mut checkpoint = existing.unwrap_or_else(|| {
            MigrationCheckpoint::new(plan.plan_id, chrono_now())
        });

        for key_move in &plan.moves {
            let resumed = checkpoint
                .state_of(&key_move.key)
                .map(normalize_resumed_state)
                .unwrap_or(KeyMoveState::Planned);
            checkpoint.set_state(key_move.key.clone(), resumed);
        }

        let state = Arc::new(RunState {
            checkpoint: Mutex::new(checkpoint),
            failed: std::collections::HashSet::new().into(),
            copy_semaphore: Semaphore::new(self.config.copy_concurrency),
            verify_semaphore: Semaphore::new(self.config.verify_concurrency),
            transitions_since_flush: AtomicUsize::new(0),
            last_flush: Mutex::new(Instant::now()),
            active_copy: AtomicUsize::new(0),
            active_verify: AtomicUsize::new(0),
        });

        let pending_verified = Mutex::new(Vec::<KeyMove<K>>::new());

        if self.config.interleave_copy_and_verify {
            for (index, key_move) in plan.moves.iter().enumerate() {
                if cancellation.is_cancelled() {
                    break;
                }
                let phase_result = self
                    .drive_key(key_move, &state, &pending_verified, &cancellation)
                    .await;
                if let Err(err) = phase_result {
                    warn!(key.index = index, error = %err, "migration key failed permanently");
                }
                self.maybe_flush_checkpoint(&state, plan.plan_id, index, false)
                    .await?;
            }
        } else {
            // Two full passes: every key's copy completes (or fails) before
            // any key's verify begins, rather than pipelining per key.
            for (index, key_move) in plan.moves.iter().enumerate() {
                if cancellation.is_cancelled() {
                    break;
                }
                if let Err(err) = self.drive_copy_only(key_move, &state, &cancellation).await {
                    warn!(key.index = index, error = %err, "migration copy failed permanently");
                }
                self.maybe_flush_checkpoint(&state, plan.plan_id, index, false)
                    .await?;
            }
            for (index, key_move) in plan.moves.iter().enumerate() {
                if cancellation.is_cancelled() {
                    break;
                }
                if let Err(err) = self
                    .drive_verify_only(key_move, &state, &pending_verified, &cancellation)
                    .await
                {
                    warn!(key.index = index, error = %err, "migration verify failed permanently");
                }
                self.maybe_flush_checkpoint(&state, plan.plan_id, index, false)
                    .await?;
            }
        }

        self.flush_remaining_swap_batch(&pending_verified, &state, plan.plan_id).await?;
        self.maybe_flush_checkpoint(&state, plan.plan_id, plan.moves.len().saturating_sub(1), true)
            .await?;

        let checkpoint = state.checkpoint.lock().await;
        let done = checkpoint
            .per_key_states
            .values()
            .filter(|s| **s == KeyMoveState::Done)
            .count();
        let failed = state.failed.lock().await.len();

        let elapsed = start.elapsed();
        self.metrics.record_total_elapsed(elapsed.as_secs_f64() * 1000.0);

        Ok(MigrationSummary {
            planned: plan.len(),
            done,
            failed,
            elapsed,
        })
    }

    async fn drive_key(
        &self,
        key_move: &KeyMove<K>,
        state: &Arc<RunState<K>>,
        pending_verified: &Mutex<Vec<KeyMove<K>>>,
        cancellation: &CancellationToken,
    ) -> ShardisResult<()> {
        let current_state = {
            let checkpoint = state.checkpoint.lock().await;
            checkpoint.state_of(&key_move.key).unwrap_or(KeyMoveState::Planned)
        };

        if current_state >= KeyMoveState::Done {
            return Ok(());
        }

        if current_state < KeyMoveState::Copied {
            self.run_copy_phase(key_move, state, cancellation).await?;
            if self.config.interleave_copy_and_verify {
                self.run_verify_phase(key_move, state, pending_verified, cancellation)
                    .await?;
            }
        } else if current_state < KeyMoveState::Verified {
            self.run_verify_phase(key_move, state, pending_verified, cancellation)
                .await?;
        } else if current_state == KeyMoveState::Verified {
            pending_verified.lock().await.push(key_move.clone());
        }

        self.maybe_flush_swap_batch(pending_verified, state).await?;
        Ok(())
    }

    async fn drive_copy_only(
        &self,
        key_move: &KeyMove<K>,
        state: &Arc<RunState<K>>,
        cancellation: &CancellationToken,
    ) -> ShardisResult<()> {
        let current_state = {
            let checkpoint = state.checkpoint.lock().await;
            checkpoint.state_of(&key_move.key).unwrap_or(KeyMoveState::Planned)
        };
        if current_state < KeyMoveState::Copied {
            self.run_copy_phase(key_move, state, cancellation).await?;
        }
        Ok(())
    }

    async fn drive_verify_only(
        &self,
        key_move: &KeyMove<K>,
        state: &Arc<RunState<K>>,
        pending_verified: &Mutex<Vec<KeyMove<K>>>,
        cancellation: &CancellationToken,
    ) -> ShardisResult<()> {
        let current_state = {
            let checkpoint = state.checkpoint.lock().await;
            checkpoint.state_of(&key_move.key).unwrap_or(KeyMoveState::Planned)
        };
        if current_state < KeyMoveState::Copied {
            // copy phase never completed; nothing to verify yet.
            return Ok(());
        }
        if current_state < KeyMoveState::Verified {
            self.run_verify_phase(key_move, state, pending_verified, cancellation)
                .await?;
        } else if current_state == KeyMoveState::Verified {
            pending_verified.lock().await.push(key_move.clone());
        }
        self.maybe_flush_swap_batch(pending_verified, state).await?;
        Ok(())
    }

    async fn run_copy_phase(
        &self,
        key_move: &KeyMove<K>,
        state: &Arc<RunState<K>>,
        cancellation: &CancellationToken,
    ) -> ShardisResult<()> {
        let _permit = state.copy_semaphore.acquire().await.expect("semaphore never closed");
        state.active_copy.fetch_add(1, Ordering::Relaxed);
        self.metrics.set_active_copy(state.active_copy.load(Ordering::Relaxed) as i64);

        self.set_state(state, key_move, KeyMoveState::Copying).await;

        let copy_start = Instant::now();
        let result = self
            .retry_with_backoff(cancellation, || async {
                self.mover.copy(&key_move.key, &key_move.source, &key_move.target).await
            })
            .await;
        self.metrics.record_copy_duration(copy_start.elapsed().as_secs_f64() * 1000.0);

        state.active_copy.fetch_sub(1, Ordering::Relaxed);
        self.metrics.set_active_copy(state.active_copy.load(Ordering::Relaxed) as i64);

        match result {
            Ok(()) => {
                self.metrics.inc_copied();
                self.set_state(state, key_move, KeyMoveState::Copied).await;
                Ok(())
            }
            Err(err) => {
                self.mark_failed(state, key_move, &err).await;
                Err(err)
            }
        }
    }

    async fn run_verify_phase(
        &self,
        key_move: &KeyMove<K>,
        state: &Arc<RunState<K>>,
        pending_verified: &Mutex<Vec<KeyMove<K>>>,
        cancellation: &CancellationToken,
    ) -> ShardisResult<()> {
        let _permit = state.verify_semaphore.acquire().await.expect("semaphore never closed");
        state.active_verify.fetch_add(1, Ordering::Relaxed);
        self.metrics.set_active_verify(state.active_verify.load(Ordering::Relaxed) as i64);

        self.set_state(state, key_move, KeyMoveState::Verifying).await;

        let verify_start = Instant::now();
        let result = self
            .retry_with_backoff(cancellation, || async {
                let verified = self
                    .verifier
                    .verify(&key_move.key, &key_move.source, &key_move.target)
                    .await?;
                if verified || self.config.force_swap_on_verification_failure {
                    Ok(())
                } else {
                    Err(ShardisError::VerificationMismatch { index: 0 })
                }
            })
            .await;
        self.metrics.record_verify_duration(verify_start.elapsed().as_secs_f64() * 1000.0);

        state.active_verify.fetch_sub(1, Ordering::Relaxed);
        self.metrics.set_active_verify(state.active_verify.load(Ordering::Relaxed) as i64);

        match result {
            Ok(()) => {
                self.metrics.inc_verified();
                self.set_state(state, key_move, KeyMoveState::Verified).await;
                pending_verified.lock().await.push(key_move.clone());
                Ok(())
            }
            Err(err) => {
                self.mark_failed(state, key_move, &err).await;
                Err(err)
            }
        }
    }

    async fn maybe_flush_swap_batch(
        &self,
        pending_verified: &Mutex<Vec<KeyMove<K>>>,
        state: &Arc<RunState<K>>,
    ) -> ShardisResult<()> {
        let ready = {
            let pending = pending_verified.lock().await;
            pending.len() >= self.config.swap_batch_size
        };
        if ready {
            self.flush_remaining_swap_batch(pending_verified, state, Uuid::nil()).await?;
        }
        Ok(())
    }

    async fn flush_remaining_swap_batch(
        &self,
        pending_verified: &Mutex<Vec<KeyMove<K>>>,
        state: &Arc<RunState<K>>,
        _plan_id: Uuid,
    ) -> ShardisResult<()> {
        let batch = {
            let mut pending = pending_verified.lock().await;
            if pending.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *pending)
        };

        for key_move in &batch {
            self.set_state(state, key_move, KeyMoveState::Swapping).await;
        }

        let swap_start = Instant::now();
        let batch_len = batch.len() as u64;
        match self.swapper.swap(&batch).await {
            Ok(()) => {
                self.metrics.record_swap_batch_duration(swap_start.elapsed().as_secs_f64() * 1000.0);
                self.metrics.inc_swapped(batch_len);
                for key_move in &batch {
                    self.set_state(state, key_move, KeyMoveState::Done).await;
                }
                Ok(())
            }
            Err(err) => {
                error!(error = %err, batch.len = batch_len, "swap batch failed; marking members failed");
                for key_move in &batch {
                    self.mark_failed(state, key_move, &err).await;
                }
                Err(err)
            }
        }
    }

    async fn retry_with_backoff<F, Fut>(
        &self,
        cancellation: &CancellationToken,
        mut op: F,
    ) -> ShardisResult<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ShardisResult<()>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt <= self.config.max_retries => {
                    self.metrics.inc_retries();
                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    debug!(attempt, ?delay, error = %err, "retrying migration operation");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancellation.cancelled() => return Err(ShardisError::Cancellation),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn set_state(&self, state: &Arc<RunState<K>>, key_move: &KeyMove<K>, new_state: KeyMoveState) {
        let mut checkpoint = state.checkpoint.lock().await;
        checkpoint.set_state(key_move.key.clone(), new_state);
        drop(checkpoint);
        state.transitions_since_flush.fetch_add(1, Ordering::Relaxed);
    }

    async fn mark_failed(&self, state: &Arc<RunState<K>>, key_move: &KeyMove<K>, _err: &ShardisError) {
        self.set_state(state, key_move, KeyMoveState::Failed).await;
        self.metrics.inc_failed();
        state.failed.lock().await.insert(key_move.key.clone());
    }

    async fn maybe_flush_checkpoint(
        &self,
        state: &Arc<RunState<K>>,
        plan_id: Uuid,
        last_processed_index: usize,
        force: bool,
    ) -> ShardisResult<()> {
        let transitions = state.transitions_since_flush.load(Ordering::Relaxed);
        let elapsed = {
            let last_flush = state.last_flush.lock().await;
            last_flush.elapsed()
        };

        let due = force
            || transitions as u32 >= self.config.checkpoint_flush_every_transitions
            || elapsed >= self.config.checkpoint_flush_interval;

        if !due {
            return Ok(());
        }

        let snapshot = {
            let mut checkpoint = state.checkpoint.lock().await;
            checkpoint.last_processed_index = last_processed_index;
            checkpoint.updated_at = chrono_now();
            checkpoint.clone()
        };

        match self.checkpoint_store.persist(&snapshot).await {
            Ok(()) => {
                state.transitions_since_flush.store(0, Ordering::Relaxed);
                *state.last_flush.lock().await = Instant::now();
                Ok(())
            }
            Err(err) => {
                if force {
                    error!(plan_id = %plan_id, error = %err, "final checkpoint persist failed; original error (if any) takes precedence");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}

struct RunState<K: Eq + Hash + Ord + Clone> {
    checkpoint: Mutex<MigrationCheckpoint<K>>,
    failed: Mutex<std::collections::HashSet<K>>,
    copy_semaphore: Semaphore,
    verify_semaphore: Semaphore,
    transitions_since_flush: AtomicUsize,
    last_flush: Mutex<Instant>,
    active_copy: AtomicUsize,
    active_verify: AtomicUsize,
}

fn chrono_now() -> chrono::DateTime<chrono::Utc> {
    info!("migration checkpoint timestamp recorded");
    chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map_store::{InMemoryMapStore, ShardMapStore};
    use crate::metrics::InProcessMetrics;
    use crate::migration::checkpoint::InMemoryCheckpointStore;
    use std::sync::atomic::AtomicU32;

    fn shard(id: &str) -> ShardId {
        crate::ring::ShardId::new(id).unwrap()
    }
    use crate::ring::ShardId;

    struct AlwaysOkMover;
    #[async_trait::async_trait]
    impl ShardDataMover<String> for AlwaysOkMover {
        async fn copy(&self, _key: &String, _source: &ShardId, _target: &ShardId) -> ShardisResult<()> {
            Ok(())
        }
    }

    struct AlwaysOkVerifier;
    #[async_trait::async_trait]
    impl VerificationStrategy<String> for AlwaysOkVerifier {
        async fn verify(&self, _key: &String, _source: &ShardId, _target: &ShardId) -> ShardisResult<bool> {
            Ok(true)
        }
    }

    struct MapStoreSwapper {
        store: Arc<InMemoryMapStore<String>>,
    }
    #[async_trait::async_trait]
    impl ShardMapSwapper<String> for MapStoreSwapper {
        async fn swap(&self, moves: &[KeyMove<String>]) -> ShardisResult<()> {
            let triples: Vec<_> = moves
                .iter()
                .map(|m| (m.key.clone(), m.source.clone(), m.target.clone()))
                .collect();
            self.store.swap_batch(&triples).await?;
            Ok(())
        }
    }

    struct FlakyMover {
        failed_once: AtomicU32,
    }
    #[async_trait::async_trait]
    impl ShardDataMover<String> for FlakyMover {
        async fn copy(&self, key: &String, _source: &ShardId, _target: &ShardId) -> ShardisResult<()> {
            if key == "user-002" && self.failed_once.fetch_add(1, Ordering::Relaxed) == 0 {
                return Err(ShardisError::CopyFailure {
                    index: 0,
                    reason: "transient".to_string(),
                });
            }
            Ok(())
        }
    }

    fn plan_with_moves(moves: Vec<KeyMove<String>>) -> MigrationPlan<String> {
        MigrationPlan {
            plan_id: Uuid::from_u128(42),
            created_at: chrono_now(),
            moves,
            source_drift_hash: 0,
        }
    }

    fn empty_source_topology() -> TopologySnapshot<String> {
        TopologySnapshot::new(0, HashMap::new())
    }

    #[tokio::test]
    async fn full_run_copies_verifies_and_swaps_every_key() {
        let store = Arc::new(InMemoryMapStore::<String>::new());
        for i in 0..5 {
            store.try_assign(&format!("k{i}"), shard("0")).await.unwrap();
        }

        let moves = (0..5)
            .map(|i| KeyMove::new(format!("k{i}"), shard("0"), shard("1")).unwrap())
            .collect();
        let plan = plan_with_moves(moves);

        let executor = MigrationExecutor::new(
            Arc::new(AlwaysOkMover),
            Arc::new(AlwaysOkVerifier),
            Arc::new(MapStoreSwapper { store: store.clone() }),
            Arc::new(InMemoryCheckpointStore::<String>::new()),
            InProcessMetrics::new(),
            ExecutorConfig::default(),
        )
        .unwrap();

        let summary = executor
            .run(&plan, &empty_source_topology(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.planned, 5);
        assert_eq!(summary.done, 5);
        assert_eq!(summary.failed, 0);

        for i in 0..5 {
            assert_eq!(store.try_get(&format!("k{i}")).await.unwrap(), Some(shard("1")));
        }
    }

    #[tokio::test]
    async fn transient_copy_failure_is_retried_to_success() {
        let store = Arc::new(InMemoryMapStore::<String>::new());
        store.try_assign(&"user-002".to_string(), shard("0")).await.unwrap();

        let plan = plan_with_moves(vec![
            KeyMove::new("user-002".to_string(), shard("0"), shard("1")).unwrap(),
        ]);

        let metrics = InProcessMetrics::new();
        let executor = MigrationExecutor::new(
            Arc::new(FlakyMover {
                failed_once: AtomicU32::new(0),
            }),
            Arc::new(AlwaysOkVerifier),
            Arc::new(MapStoreSwapper { store: store.clone() }),
            Arc::new(InMemoryCheckpointStore::<String>::new()),
            metrics.clone(),
            ExecutorConfig {
                retry_base_delay: Duration::from_millis(5),
                ..ExecutorConfig::default()
            },
        )
        .unwrap();

        let summary = executor
            .run(&plan, &empty_source_topology(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.done, 1);
        assert_eq!(summary.failed, 0);
        assert!(metrics.retries_count() >= 1);
    }

    #[tokio::test]
    async fn drift_hash_mismatch_aborts_before_touching_any_key() {
        let store = Arc::new(InMemoryMapStore::<String>::new());
        let plan = MigrationPlan {
            plan_id: Uuid::from_u128(1),
            created_at: chrono_now(),
            moves: vec![KeyMove::new("k0".to_string(), shard("0"), shard("1")).unwrap()],
            source_drift_hash: 123,
        };

        let executor = MigrationExecutor::new(
            Arc::new(AlwaysOkMover),
            Arc::new(AlwaysOkVerifier),
            Arc::new(MapStoreSwapper { store: store.clone() }),
            Arc::new(InMemoryCheckpointStore::<String>::new()),
            InProcessMetrics::new(),
            ExecutorConfig::default(),
        )
        .unwrap();

        let result = executor
            .run(&plan, &empty_source_topology(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ShardisError::TopologyDrift { .. })));
    }
}
