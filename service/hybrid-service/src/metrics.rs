//! §14 Observability: an in-process counters facade. Exporting these to a real metrics
//! backend (Prometheus, StatsD, ...) is out of scope — [`Metrics::snapshot`] is the
//! seam an external exporter would poll.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub admitted: u64,
    pub denied_by_reason: Vec<(String, u64)>,
    pub cache_hits_by_family: Vec<(String, u64)>,
    pub cache_misses_by_family: Vec<(String, u64)>,
    pub dedup_seen: u64,
    pub dedup_duplicates: u64,
    pub dense_fanout_total: u64,
    pub lexical_fanout_total: u64,
    pub retrieval_calls: u64,
}

/// Shared, cheaply-cloned counters populated by the orchestrator as requests flow
/// through each stage.
#[derive(Clone, Default)]
pub struct Metrics {
    admitted: std::sync::Arc<AtomicU64>,
    denied: std::sync::Arc<DashMap<&'static str, AtomicU64>>,
    cache_hits: std::sync::Arc<DashMap<&'static str, AtomicU64>>,
    cache_misses: std::sync::Arc<DashMap<&'static str, AtomicU64>>,
    dedup_seen: std::sync::Arc<AtomicU64>,
    dedup_duplicates: std::sync::Arc<AtomicU64>,
    dense_fanout_total: std::sync::Arc<AtomicU64>,
    lexical_fanout_total: std::sync::Arc<AtomicU64>,
    retrieval_calls: std::sync::Arc<AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self, reason: &'static str) {
        self.denied.entry(reason).or_default().fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache(&self, family: &'static str, hit: bool) {
        let map = if hit { &self.cache_hits } else { &self.cache_misses };
        map.entry(family).or_default().fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dedup(&self, seen_delta: u64, duplicate_delta: u64) {
        self.dedup_seen.fetch_add(seen_delta, Ordering::Relaxed);
        self.dedup_duplicates.fetch_add(duplicate_delta, Ordering::Relaxed);
    }

    pub fn record_retrieval_fanout(&self, dense: usize, lexical: usize) {
        self.dense_fanout_total.fetch_add(dense as u64, Ordering::Relaxed);
        self.lexical_fanout_total.fetch_add(lexical as u64, Ordering::Relaxed);
        self.retrieval_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let collect = |m: &DashMap<&'static str, AtomicU64>| {
            m.iter().map(|e| (e.key().to_string(), e.value().load(Ordering::Relaxed))).collect()
        };
        MetricsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            denied_by_reason: collect(&self.denied),
            cache_hits_by_family: collect(&self.cache_hits),
            cache_misses_by_family: collect(&self.cache_misses),
            dedup_seen: self.dedup_seen.load(Ordering::Relaxed),
            dedup_duplicates: self.dedup_duplicates.load(Ordering::Relaxed),
            dense_fanout_total: self.dense_fanout_total.load(Ordering::Relaxed),
            lexical_fanout_total: self.lexical_fanout_total.load(Ordering::Relaxed),
            retrieval_calls: self.retrieval_calls.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let metrics = Metrics::new();
        metrics.record_admitted();
        metrics.record_admitted();
        metrics.record_denied("burst_exceeded");
        metrics.record_cache("answer", true);
        metrics.record_cache("answer", false);
        metrics.record_dedup(10, 3);
        metrics.record_retrieval_fanout(16, 16);

        let snap = metrics.snapshot();
        assert_eq!(snap.admitted, 2);
        assert_eq!(snap.denied_by_reason, vec![("burst_exceeded".to_string(), 1)]);
        assert_eq!(snap.dedup_seen, 10);
        assert_eq!(snap.dedup_duplicates, 3);
        assert_eq!(snap.retrieval_calls, 1);
    }
}
