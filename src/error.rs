//! Error taxonomy for the routing, merge, and migration subsystems.

use thiserror::Error;

use crate::ring::ShardId;

/// Domain error taxonomy shared by the router, merge core, and migration
/// executor. Variants never carry raw key material (only bounded debug
/// representations), so they are always safe to log.
#[derive(Debug, Error, Clone)]
pub enum ShardisError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("duplicate shard id: {0}")]
    DuplicateShard(ShardId),

    #[error("topology drift detected for plan {plan_id}: expected hash {expected:#x}, observed {observed:#x}")]
    TopologyDrift {
        plan_id: uuid::Uuid,
        expected: u64,
        observed: u64,
    },

    #[error("shard store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("optimistic conflict on shard {shard_id} (expected version {expected}, found {found})")]
    OptimisticConflict {
        shard_id: ShardId,
        expected: u64,
        found: u64,
    },

    #[error("copy failed for move at index {index}: {reason}")]
    CopyFailure { index: usize, reason: String },

    #[error("verify failed for move at index {index}: {reason}")]
    VerifyFailure { index: usize, reason: String },

    #[error("verification mismatch for move at index {index}")]
    VerificationMismatch { index: usize },

    #[error("query translation failed: {0}")]
    QueryTranslation(String),

    #[error("shard unavailable: {0}")]
    ShardUnavailable(ShardId),

    #[error("operation canceled")]
    Cancellation,
}

pub type ShardisResult<T> = Result<T, ShardisError>;

impl ShardisError {
    /// Kind label used as a bounded-cardinality tag value; never includes
    /// the variable fields embedded in the `Display` message.
    pub fn kind(&self) -> &'static str {
        match self {
            ShardisError::InvalidConfiguration(_) => "invalid_configuration",
            ShardisError::DuplicateShard(_) => "duplicate_shard",
            ShardisError::TopologyDrift { .. } => "topology_drift",
            ShardisError::StoreUnavailable(_) => "store_unavailable",
            ShardisError::OptimisticConflict { .. } => "optimistic_conflict",
            ShardisError::CopyFailure { .. } => "copy_failure",
            ShardisError::VerifyFailure { .. } => "verify_failure",
            ShardisError::VerificationMismatch { .. } => "verification_mismatch",
            ShardisError::QueryTranslation(_) => "query_translation",
            ShardisError::ShardUnavailable(_) => "shard_unavailable",
            ShardisError::Cancellation => "cancellation",
        }
    }

    /// Whether the executor's retry policy should apply to this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShardisError::StoreUnavailable(_)
                | ShardisError::OptimisticConflict { .. }
                | ShardisError::CopyFailure { .. }
                | ShardisError::VerifyFailure { .. }
                | ShardisError::VerificationMismatch { .. }
        )
    }
}
