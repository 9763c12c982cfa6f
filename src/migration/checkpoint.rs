//! Migration checkpointing: per-key state tracking and a pluggable
//! checkpoint store, modeled on a totally-ordered transaction-status enum
//! with retry bookkeeping.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ShardisResult;

/// Totally ordered per-key migration state, plus a terminal `Failed` that
/// sits outside the copy/verify/swap progression: every comparison the
/// executor makes against it is either `>= Done` (true, so a failed key is
/// never re-picked-up by the progression checks) or `< some earlier state`
/// (false, for the same reason), so giving it the highest discriminant is
/// safe without it ever meaning "further along than Done".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyMoveState {
    Planned = 0,
    Copying = 1,
    Copied = 2,
    Verifying = 3,
    Verified = 4,
    Swapping = 5,
    Done = 6,
    Failed = 7,
}

/// `{ planId, checkpointVersion, updatedAt, perKeyStates, lastProcessedIndex }`.
/// Serialized with a sorted key encoding so the same topology always
/// produces the same bytes across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationCheckpoint<K: Eq + Hash + Ord> {
    pub plan_id: Uuid,
    pub checkpoint_version: u32,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub per_key_states: std::collections::BTreeMap<K, KeyMoveState>,
    pub last_processed_index: usize,
}

impl<K: Eq + Hash + Ord + Clone> MigrationCheckpoint<K> {
    pub fn new(plan_id: Uuid, updated_at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            plan_id,
            checkpoint_version: 1,
            updated_at,
            per_key_states: std::collections::BTreeMap::new(),
            last_processed_index: 0,
        }
    }

    pub fn state_of(&self, key: &K) -> Option<KeyMoveState> {
        self.per_key_states.get(key).copied()
    }

    pub fn set_state(&mut self, key: K, state: KeyMoveState) {
        self.per_key_states.insert(key, state);
    }
}

impl<K: Eq + Hash + Ord + Serialize> MigrationCheckpoint<K> {
    /// Serializes to JSON with `per_key_states` in sorted-key order (via
    /// the `BTreeMap` field), so the same checkpoint contents always
    /// produce the same bytes regardless of key insertion order.
    pub fn to_json_bytes(&self) -> ShardisResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| {
            crate::error::ShardisError::InvalidConfiguration(format!(
                "failed to serialize migration checkpoint: {err}"
            ))
        })
    }
}

impl<K: Eq + Hash + Ord + for<'de> Deserialize<'de>> MigrationCheckpoint<K> {
    pub fn from_json_bytes(bytes: &[u8]) -> ShardisResult<Self> {
        serde_json::from_slice(bytes).map_err(|err| {
            crate::error::ShardisError::InvalidConfiguration(format!(
                "failed to deserialize migration checkpoint: {err}"
            ))
        })
    }
}

/// `IShardMigrationCheckpointStore<K>`: single-writer-per-plan persistence
/// for migration progress.
#[async_trait]
pub trait ShardMigrationCheckpointStore<K: Eq + Hash + Ord + Send + Sync>: Send + Sync {
    async fn load(&self, plan_id: Uuid) -> ShardisResult<Option<MigrationCheckpoint<K>>>;
    async fn persist(&self, checkpoint: &MigrationCheckpoint<K>) -> ShardisResult<()>;
}

/// In-memory reference checkpoint store.
#[derive(Default)]
pub struct InMemoryCheckpointStore<K: Eq + Hash + Ord + Clone> {
    checkpoints: Mutex<HashMap<Uuid, MigrationCheckpoint<K>>>,
}

impl<K: Eq + Hash + Ord + Clone> InMemoryCheckpointStore<K> {
    pub fn new() -> Self {
        Self {
            checkpoints: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<K: Eq + Hash + Ord + Clone + Send + Sync> ShardMigrationCheckpointStore<K>
    for InMemoryCheckpointStore<K>
{
    async fn load(&self, plan_id: Uuid) -> ShardisResult<Option<MigrationCheckpoint<K>>> {
        Ok(self.checkpoints.lock().unwrap().get(&plan_id).cloned())
    }

    async fn persist(&self, checkpoint: &MigrationCheckpoint<K>) -> ShardisResult<()> {
        self.checkpoints
            .lock()
            .unwrap()
            .insert(checkpoint.plan_id, checkpoint.clone());
        Ok(())
    }
}

/// Crash-resume state normalization: `Verifying` resumes as `Copied`
/// (cheap, safe re-verify); `Swapping` resumes as `Verified` (re-attempt
/// the swap batch, itself idempotent per-key via version check) rather
/// than risking a double-swap.
pub fn normalize_resumed_state(state: KeyMoveState) -> KeyMoveState {
    match state {
        KeyMoveState::Verifying => KeyMoveState::Copied,
        KeyMoveState::Swapping => KeyMoveState::Verified,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_ordering_is_total_and_monotonic() {
        assert!(KeyMoveState::Planned < KeyMoveState::Copying);
        assert!(KeyMoveState::Copied < KeyMoveState::Verifying);
        assert!(KeyMoveState::Verified < KeyMoveState::Swapping);
        assert!(KeyMoveState::Swapping < KeyMoveState::Done);
    }

    #[test]
    fn failed_is_never_resumed_as_in_progress() {
        assert!(KeyMoveState::Failed >= KeyMoveState::Done);
        assert_eq!(normalize_resumed_state(KeyMoveState::Failed), KeyMoveState::Failed);
    }

    #[test]
    fn resume_normalization_short_circuits_in_flight_phases() {
        assert_eq!(
            normalize_resumed_state(KeyMoveState::Verifying),
            KeyMoveState::Copied
        );
        assert_eq!(
            normalize_resumed_state(KeyMoveState::Swapping),
            KeyMoveState::Verified
        );
        assert_eq!(normalize_resumed_state(KeyMoveState::Done), KeyMoveState::Done);
    }

    #[tokio::test]
    async fn checkpoint_store_round_trips() {
        let store = InMemoryCheckpointStore::<String>::new();
        let plan_id = Uuid::from_u128(7);
        let mut checkpoint = MigrationCheckpoint::new(plan_id, chrono::DateTime::from_timestamp(0, 0).unwrap());
        checkpoint.set_state("k1".to_string(), KeyMoveState::Copied);
        store.persist(&checkpoint).await.unwrap();

        let loaded = store.load(plan_id).await.unwrap().unwrap();
        assert_eq!(loaded.state_of(&"k1".to_string()), Some(KeyMoveState::Copied));
    }

    #[test]
    fn checkpoint_json_round_trips() {
        let mut checkpoint = MigrationCheckpoint::new(
            Uuid::from_u128(42),
            chrono::DateTime::from_timestamp(0, 0).unwrap(),
        );
        checkpoint.set_state("k2".to_string(), KeyMoveState::Verified);
        checkpoint.set_state("k1".to_string(), KeyMoveState::Failed);

        let bytes = checkpoint.to_json_bytes().unwrap();
        let restored = MigrationCheckpoint::<String>::from_json_bytes(&bytes).unwrap();

        assert_eq!(restored.state_of(&"k1".to_string()), Some(KeyMoveState::Failed));
        assert_eq!(restored.state_of(&"k2".to_string()), Some(KeyMoveState::Verified));
    }
}
