//! Observability surface: routing metrics, migration metrics, and a simple
//! in-process histogram, updated from many concurrent call sites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::ring::ShardId;

/// `IShardisMetrics`: router-level route hit/miss counters.
pub trait ShardisMetrics: Send + Sync {
    fn route_hit(&self, router: &str, shard_id: &ShardId, existing: bool);
    fn route_miss(&self, router: &str);
}

/// `IShardMigrationMetrics`: migration counters, gauges, histograms.
pub trait ShardMigrationMetrics: Send + Sync {
    fn inc_planned(&self, n: u64);
    fn inc_copied(&self);
    fn inc_verified(&self);
    fn inc_swapped(&self, n: u64);
    fn inc_failed(&self);
    fn inc_retries(&self);
    fn set_active_copy(&self, n: i64);
    fn set_active_verify(&self, n: i64);
    fn record_copy_duration(&self, millis: f64);
    fn record_verify_duration(&self, millis: f64);
    fn record_swap_batch_duration(&self, millis: f64);
    fn record_total_elapsed(&self, millis: f64);
}

/// Bounded-cardinality tag set for the single per-enumeration query latency
/// histogram point.
#[derive(Debug, Clone, Default)]
pub struct QueryLatencyTags {
    pub db_system: String,
    pub provider: String,
    pub shard_count: usize,
    pub target_shard_count: usize,
    pub invalid_shard_count: usize,
    pub merge_strategy: &'static str,
    pub ordering_buffered: bool,
    pub fanout_concurrency: usize,
    pub channel_capacity: i64,
    pub failure_mode: &'static str,
    pub result_status: &'static str,
    pub root_type: String,
}

/// Records exactly one query latency histogram point per logical
/// enumeration (never per producer, per shard, or per retry).
pub trait QueryLatencyMetrics: Send + Sync {
    fn record_query_latency(&self, millis: f64, tags: QueryLatencyTags);
}

/// Minimal running histogram: count, sum, min, max. Sufficient for the
/// crate's own tests and for an exporter to translate into percentile
/// buckets; a production deployment would forward these points to
/// OpenTelemetry.
#[derive(Debug, Default, Clone)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_millis: f64,
    pub min_millis: f64,
    pub max_millis: f64,
}

#[derive(Debug, Default)]
struct HistogramState {
    count: AtomicU64,
    sum_bits: std::sync::atomic::AtomicU64,
    min_bits: std::sync::atomic::AtomicU64,
    max_bits: std::sync::atomic::AtomicU64,
}

impl HistogramState {
    fn record(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        fetch_add_f64(&self.sum_bits, value);
        fetch_min_f64(&self.min_bits, value);
        fetch_max_f64(&self.max_bits, value);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum_millis: f64::from_bits(self.sum_bits.load(Ordering::Relaxed)),
            min_millis: f64::from_bits(self.min_bits.load(Ordering::Relaxed)),
            max_millis: f64::from_bits(self.max_bits.load(Ordering::Relaxed)),
        }
    }
}

fn fetch_add_f64(bits: &AtomicU64, delta: f64) {
    let mut current = bits.load(Ordering::Relaxed);
    loop {
        let new = f64::from_bits(current) + delta;
        match bits.compare_exchange_weak(
            current,
            new.to_bits(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

fn fetch_min_f64(bits: &AtomicU64, value: f64) {
    let mut current = bits.load(Ordering::Relaxed);
    loop {
        let existing = f64::from_bits(current);
        if existing != 0.0 && existing <= value {
            return;
        }
        match bits.compare_exchange_weak(current, value.to_bits(), Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

fn fetch_max_f64(bits: &AtomicU64, value: f64) {
    let mut current = bits.load(Ordering::Relaxed);
    loop {
        let existing = f64::from_bits(current);
        if existing >= value {
            return;
        }
        match bits.compare_exchange_weak(current, value.to_bits(), Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

/// In-process metrics sink implementing `ShardisMetrics` +
/// `ShardMigrationMetrics` + `QueryLatencyMetrics`. A real deployment wires
/// these call sites to OpenTelemetry counters/histograms; this collector is
/// what the crate's own tests assert against.
#[derive(Debug, Default)]
pub struct InProcessMetrics {
    route_hits: Mutex<HashMap<(String, bool), u64>>,
    route_misses: Mutex<HashMap<String, u64>>,
    planned: AtomicU64,
    copied: AtomicU64,
    verified: AtomicU64,
    swapped: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    active_copy: std::sync::atomic::AtomicI64,
    active_verify: std::sync::atomic::AtomicI64,
    copy_duration: HistogramState,
    verify_duration: HistogramState,
    swap_batch_duration: HistogramState,
    total_elapsed: HistogramState,
    query_latency_count: AtomicU64,
}

impl InProcessMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route_miss_count(&self, router: &str) -> u64 {
        self.route_misses
            .lock()
            .unwrap()
            .get(router)
            .copied()
            .unwrap_or(0)
    }

    pub fn route_hit_count(&self, router: &str, existing: bool) -> u64 {
        self.route_hits
            .lock()
            .unwrap()
            .get(&(router.to_string(), existing))
            .copied()
            .unwrap_or(0)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn retries_count(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn query_latency_points(&self) -> u64 {
        self.query_latency_count.load(Ordering::Relaxed)
    }

    pub fn copy_duration_snapshot(&self) -> HistogramSnapshot {
        self.copy_duration.snapshot()
    }
}

impl ShardisMetrics for InProcessMetrics {
    fn route_hit(&self, router: &str, _shard_id: &ShardId, existing: bool) {
        let mut hits = self.route_hits.lock().unwrap();
        *hits.entry((router.to_string(), existing)).or_insert(0) += 1;
    }

    fn route_miss(&self, router: &str) {
        let mut misses = self.route_misses.lock().unwrap();
        *misses.entry(router.to_string()).or_insert(0) += 1;
    }
}

impl ShardMigrationMetrics for InProcessMetrics {
    fn inc_planned(&self, n: u64) {
        self.planned.fetch_add(n, Ordering::Relaxed);
    }
    fn inc_copied(&self) {
        self.copied.fetch_add(1, Ordering::Relaxed);
    }
    fn inc_verified(&self) {
        self.verified.fetch_add(1, Ordering::Relaxed);
    }
    fn inc_swapped(&self, n: u64) {
        self.swapped.fetch_add(n, Ordering::Relaxed);
    }
    fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
    fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }
    fn set_active_copy(&self, n: i64) {
        self.active_copy.store(n, Ordering::Relaxed);
    }
    fn set_active_verify(&self, n: i64) {
        self.active_verify.store(n, Ordering::Relaxed);
    }
    fn record_copy_duration(&self, millis: f64) {
        self.copy_duration.record(millis);
    }
    fn record_verify_duration(&self, millis: f64) {
        self.verify_duration.record(millis);
    }
    fn record_swap_batch_duration(&self, millis: f64) {
        self.swap_batch_duration.record(millis);
    }
    fn record_total_elapsed(&self, millis: f64) {
        self.total_elapsed.record(millis);
    }
}

impl QueryLatencyMetrics for InProcessMetrics {
    fn record_query_latency(&self, millis: f64, tags: QueryLatencyTags) {
        self.query_latency_count.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            millis,
            shard.count = tags.shard_count,
            target.shard.count = tags.target_shard_count,
            invalid.shard.count = tags.invalid_shard_count,
            merge.strategy = tags.merge_strategy,
            ordering.buffered = tags.ordering_buffered,
            fanout.concurrency = tags.fanout_concurrency,
            channel.capacity = tags.channel_capacity,
            failure.mode = tags.failure_mode,
            result.status = tags.result_status,
            "query latency"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_hit_and_miss_counters_accumulate() {
        let metrics = InProcessMetrics::new();
        let shard_id = ShardId::new("s0").unwrap();
        metrics.route_miss("default");
        metrics.route_hit("default", &shard_id, false);
        metrics.route_hit("default", &shard_id, true);
        assert_eq!(metrics.route_miss_count("default"), 1);
        assert_eq!(metrics.route_hit_count("default", true), 1);
        assert_eq!(metrics.route_hit_count("default", false), 1);
    }

    #[test]
    fn histogram_tracks_count_sum_min_max() {
        let hist = HistogramState::default();
        hist.record(5.0);
        hist.record(1.0);
        hist.record(9.0);
        let snap = hist.snapshot();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.sum_millis, 15.0);
        assert_eq!(snap.min_millis, 1.0);
        assert_eq!(snap.max_millis, 9.0);
    }
}
