//! Configuration for the router, merge core, and migration executor:
//! `from_env()` readers over `SHARDIS_ROUTER_*` / `SHARDIS_MERGE_*` /
//! `SHARDIS_MIGRATION_*` with documented defaults, plus a `validate()`
//! surfaced at construction rather than silently clamped.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ShardisError, ShardisResult};
use crate::merge::MergeConfig;

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool_or_default(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_millis_or_default(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Router tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub use_consistent_hashing: bool,
    pub replication_factor: u32,
    pub dedup_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            use_consistent_hashing: true,
            replication_factor: 100,
            dedup_capacity: crate::router::DEFAULT_DEDUP_CAPACITY,
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> Self {
        Self {
            use_consistent_hashing: env_bool_or_default("SHARDIS_ROUTER_USE_CONSISTENT_HASHING", true),
            replication_factor: env_or_default("SHARDIS_ROUTER_REPLICATION_FACTOR", 100),
            dedup_capacity: env_or_default(
                "SHARDIS_ROUTER_DEDUP_CAPACITY",
                crate::router::DEFAULT_DEDUP_CAPACITY,
            ),
        }
    }

    pub fn validate(&self) -> ShardisResult<()> {
        if self.replication_factor == 0 || self.replication_factor > crate::ring::MAX_REPLICATION_FACTOR {
            return Err(ShardisError::InvalidConfiguration(format!(
                "replication_factor must be in [1, {}]",
                crate::ring::MAX_REPLICATION_FACTOR
            )));
        }
        if self.dedup_capacity == 0 {
            return Err(ShardisError::InvalidConfiguration(
                "dedup_capacity must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl MergeConfig {
    pub fn from_env() -> Self {
        Self {
            channel_capacity: env::var("SHARDIS_MERGE_CHANNEL_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok()),
            prefetch_per_shard: env_or_default("SHARDIS_MERGE_PREFETCH_PER_SHARD", 1),
            heap_sample_every: env_or_default("SHARDIS_MERGE_HEAP_SAMPLE_EVERY", 1),
        }
    }
}

/// Migration tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub copy_concurrency: usize,
    pub verify_concurrency: usize,
    pub swap_batch_size: usize,
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub retry_base_delay: Duration,
    pub interleave_copy_and_verify: bool,
    pub force_swap_on_verification_failure: bool,
    #[serde(with = "duration_millis")]
    pub checkpoint_flush_interval: Duration,
    pub checkpoint_flush_every_transitions: u32,
    #[serde(with = "duration_millis")]
    pub health_window: Duration,
    #[serde(with = "duration_millis")]
    pub max_read_staleness: Duration,
    pub max_concurrent_moves: Option<usize>,
    pub max_moves_per_shard: Option<usize>,
    pub enable_dual_read: bool,
    pub enable_dual_write: bool,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

impl Default for MigrationConfig {
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
            health_window: Duration::from_secs(5),
            max_read_staleness: Duration::from_secs(2),
            max_concurrent_moves: None,
            max_moves_per_shard: None,
            enable_dual_read: false,
            enable_dual_write: false,
        }
    }
}

impl MigrationConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            copy_concurrency: env_or_default("SHARDIS_MIGRATION_COPY_CONCURRENCY", default.copy_concurrency),
            verify_concurrency: env_or_default(
                "SHARDIS_MIGRATION_VERIFY_CONCURRENCY",
                default.verify_concurrency,
            ),
            swap_batch_size: env_or_default("SHARDIS_MIGRATION_SWAP_BATCH_SIZE", default.swap_batch_size),
            max_retries: env_or_default("SHARDIS_MIGRATION_MAX_RETRIES", default.max_retries),
            retry_base_delay: env_millis_or_default(
                "SHARDIS_MIGRATION_RETRY_BASE_DELAY_MS",
                default.retry_base_delay,
            ),
            interleave_copy_and_verify: env_bool_or_default(
                "SHARDIS_MIGRATION_INTERLEAVE_COPY_AND_VERIFY",
                default.interleave_copy_and_verify,
            ),
            force_swap_on_verification_failure: env_bool_or_default(
                "SHARDIS_MIGRATION_FORCE_SWAP_ON_VERIFICATION_FAILURE",
                default.force_swap_on_verification_failure,
            ),
            checkpoint_flush_interval: env_millis_or_default(
                "SHARDIS_MIGRATION_CHECKPOINT_FLUSH_INTERVAL_MS",
                default.checkpoint_flush_interval,
            ),
            checkpoint_flush_every_transitions: env_or_default(
                "SHARDIS_MIGRATION_CHECKPOINT_FLUSH_EVERY_TRANSITIONS",
                default.checkpoint_flush_every_transitions,
            ),
            health_window: env_millis_or_default("SHARDIS_MIGRATION_HEALTH_WINDOW_MS", default.health_window),
            max_read_staleness: env_millis_or_default(
                "SHARDIS_MIGRATION_MAX_READ_STALENESS_MS",
                default.max_read_staleness,
            ),
            max_concurrent_moves: env::var("SHARDIS_MIGRATION_MAX_CONCURRENT_MOVES")
                .ok()
                .and_then(|v| v.parse().ok()),
            max_moves_per_shard: env::var("SHARDIS_MIGRATION_MAX_MOVES_PER_SHARD")
                .ok()
                .and_then(|v| v.parse().ok()),
            enable_dual_read: env_bool_or_default("SHARDIS_MIGRATION_ENABLE_DUAL_READ", default.enable_dual_read),
            enable_dual_write: env_bool_or_default(
                "SHARDIS_MIGRATION_ENABLE_DUAL_WRITE",
                default.enable_dual_write,
            ),
        }
    }

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
        if self.health_window.is_zero() {
            return Err(ShardisError::InvalidConfiguration(
                "health_window must be > 0".to_string(),
            ));
        }
        if self.max_read_staleness.is_zero() {
            return Err(ShardisError::InvalidConfiguration(
                "max_read_staleness must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<&MigrationConfig> for crate::migration::ExecutorConfig {
    fn from(config: &MigrationConfig) -> Self {
        crate::migration::ExecutorConfig {
            copy_concurrency: config.copy_concurrency,
            verify_concurrency: config.verify_concurrency,
            swap_batch_size: config.swap_batch_size,
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay,
            interleave_copy_and_verify: config.interleave_copy_and_verify,
            force_swap_on_verification_failure: config.force_swap_on_verification_failure,
            checkpoint_flush_interval: config.checkpoint_flush_interval,
            checkpoint_flush_every_transitions: config.checkpoint_flush_every_transitions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_defaults_are_valid() {
        assert!(RouterConfig::default().validate().is_ok());
    }

    #[test]
    fn merge_defaults_are_valid() {
        assert!(MergeConfig::default().validate().is_ok());
    }

    #[test]
    fn migration_defaults_are_valid() {
        assert!(MigrationConfig::default().validate().is_ok());
    }

    #[test]
    fn migration_rejects_zero_concurrency() {
        let config = MigrationConfig {
            copy_concurrency: 0,
            ..MigrationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn migration_config_converts_into_executor_config() {
        let config = MigrationConfig::default();
        let executor_config: crate::migration::ExecutorConfig = (&config).into();
        assert_eq!(executor_config.copy_concurrency, config.copy_concurrency);
    }
}