//! Prometheus metrics for the correlation engine

use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
};

/// Counters and histograms exposed on the metrics port. Shared across all
/// worker tasks; prometheus primitives are internally synchronized.
#[derive(Debug, Clone)]
pub struct Metrics {
    pub detections_processed_total: IntCounterVec,
    pub classification_total: IntCounterVec,
    pub deduplication_matches_total: IntCounter,
    pub registry_matched_total: IntCounter,
    pub registry_cache_hits_total: IntCounter,
    pub errors_total: IntCounterVec,
    pub clickhouse_write_latency_seconds: Histogram,
    pub registry_lookup_latency_seconds: Histogram,
    pub correlation_score: Histogram,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let detections_processed_total = IntCounterVec::new(
            Opts::new(
                "detections_processed_total",
                "Detection events processed, by source type",
            ),
            &["source_type"],
        )?;
        let classification_total = IntCounterVec::new(
            Opts::new("classification_total", "Verdicts emitted, by classification"),
            &["classification"],
        )?;
        let deduplication_matches_total = IntCounter::new(
            "deduplication_matches_total",
            "Evidence rejected as duplicate on merge",
        )?;
        let registry_matched_total = IntCounter::new(
            "registry_matched_total",
            "Aggregates matched against the approval registry",
        )?;
        let registry_cache_hits_total = IntCounter::new(
            "registry_cache_hits_total",
            "Registry lookups served from the short-term cache",
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new("errors_total", "Errors encountered, by type"),
            &["error_type"],
        )?;
        let clickhouse_write_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "clickhouse_write_latency_seconds",
            "Analytics store write latency",
        ))?;
        let registry_lookup_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "registry_lookup_latency_seconds",
            "Registry match lookup latency",
        ))?;
        let correlation_score = Histogram::with_opts(
            HistogramOpts::new("correlation_score", "Computed aggregate scores").buckets(vec![
                0.0, 2.0, 4.0, 6.0, 8.0, 10.0, 14.0, 18.0, 25.0, 40.0,
            ]),
        )?;

        registry.register(Box::new(detections_processed_total.clone()))?;
        registry.register(Box::new(classification_total.clone()))?;
        registry.register(Box::new(deduplication_matches_total.clone()))?;
        registry.register(Box::new(registry_matched_total.clone()))?;
        registry.register(Box::new(registry_cache_hits_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(clickhouse_write_latency_seconds.clone()))?;
        registry.register(Box::new(registry_lookup_latency_seconds.clone()))?;
        registry.register(Box::new(correlation_score.clone()))?;

        Ok(Self {
            detections_processed_total,
            classification_total,
            deduplication_matches_total,
            registry_matched_total,
            registry_cache_hits_total,
            errors_total,
            clickhouse_write_latency_seconds,
            registry_lookup_latency_seconds,
            correlation_score,
        })
    }

    /// Unregistered instance for tests and embedded use.
    pub fn unregistered() -> Self {
        let registry = Registry::new();
        Self::new(&registry).expect("metrics construction")
    }
}
