//! Sliding-window correlation
//!
//! Owns the window table: the mapping from composite id to in-flight
//! aggregated detection. Merges new evidence within the window, rejects
//! duplicates by signature and evicts aggregates whose window has closed.
//! All mutations happen under a single write lock which is never held across
//! an external call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::scorer::WeightTable;
use crate::{AggregatedDetection, DetectionEvent, EvidenceRecord};

/// Window-table counters for the `/stats` snapshot.
#[derive(Debug, Default)]
pub struct WindowStats {
    pub windows_opened: AtomicU64,
    pub evidence_merged: AtomicU64,
    pub duplicates_rejected: AtomicU64,
    pub windows_evicted: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowStatsSnapshot {
    pub live_windows: usize,
    pub windows_opened: u64,
    pub evidence_merged: u64,
    pub duplicates_rejected: u64,
    pub windows_evicted: u64,
}

pub struct Correlator {
    window: RwLock<HashMap<String, AggregatedDetection>>,
    window_width: Duration,
    weights: WeightTable,
    metrics: Arc<Metrics>,
    stats: WindowStats,
}

impl Correlator {
    pub fn new(window_width: Duration, weights: WeightTable, metrics: Arc<Metrics>) -> Self {
        Self {
            window: RwLock::new(HashMap::new()),
            window_width,
            weights,
            metrics,
            stats: WindowStats::default(),
        }
    }

    pub fn window_width(&self) -> Duration {
        self.window_width
    }

    /// Merge one event into the window table and return the updated aggregate
    /// for scoring and persistence.
    ///
    /// An event whose timestamp falls outside the live aggregate's window
    /// (older than `window_start - W`, or at/after `window_end`) opens a
    /// fresh window in its place; the displaced aggregate has already been
    /// persisted per emission. Same-timestamp events keep insertion order.
    pub async fn process_event(&self, event: &DetectionEvent) -> AggregatedDetection {
        let record = EvidenceRecord::new(
            event.source_type.into(),
            event.source_id.clone(),
            self.weights.contribution_for(event.source_type.into()),
            event.timestamp,
            &event.snippet,
            event.details.clone(),
        );
        let signature = record.signature();

        let mut window = self.window.write().await;
        let probe = AggregatedDetection::open(event, self.window_width);

        if let Some(aggregate) = window.get_mut(&probe.composite_id) {
            if self.in_window(aggregate, event.timestamp) {
                if aggregate.has_evidence_signature(&signature) {
                    self.metrics.deduplication_matches_total.inc();
                    self.stats.duplicates_rejected.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        composite_id = %aggregate.composite_id,
                        "duplicate evidence rejected"
                    );
                    return aggregate.clone();
                }
                aggregate.append_evidence(record);
                self.stats.evidence_merged.fetch_add(1, Ordering::Relaxed);
                return aggregate.clone();
            }
            debug!(
                composite_id = %probe.composite_id,
                "event outside live window, opening a new one"
            );
        }

        let mut aggregate = probe;
        aggregate.append_evidence(record);
        self.stats.windows_opened.fetch_add(1, Ordering::Relaxed);
        window.insert(aggregate.composite_id.clone(), aggregate.clone());
        aggregate
    }

    fn in_window(&self, aggregate: &AggregatedDetection, timestamp: DateTime<Utc>) -> bool {
        timestamp >= aggregate.window_start - self.window_width
            && timestamp < aggregate.window_end
    }

    /// Remove and return every aggregate whose window has closed. Called by
    /// the janitor; the returned aggregates take the same scoring and
    /// persistence path as live emissions.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Vec<AggregatedDetection> {
        let mut window = self.window.write().await;
        let expired_ids: Vec<String> = window
            .values()
            .filter(|a| a.window_end <= now)
            .map(|a| a.composite_id.clone())
            .collect();

        let mut expired: Vec<AggregatedDetection> = expired_ids
            .iter()
            .filter_map(|id| window.remove(id))
            .collect();
        // Oldest windows first so the final writes land in window order
        expired.sort_by_key(|a| a.window_end);
        self.stats
            .windows_evicted
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired
    }

    /// Write scoring results back into the live window so later emissions and
    /// the janitor see registry and judge state. Evidence added concurrently
    /// by other subjects is kept; the scored copy only contributes records
    /// the entry does not already hold.
    pub async fn merge_scored(&self, scored: &AggregatedDetection) {
        let mut window = self.window.write().await;
        if let Some(aggregate) = window.get_mut(&scored.composite_id) {
            if aggregate.first_seen != scored.first_seen {
                return;
            }
            for record in &scored.evidence {
                if !aggregate.has_evidence_signature(&record.signature()) {
                    aggregate.evidence.push(record.clone());
                }
            }
            aggregate.score = scored.score;
            aggregate.classification = scored.classification;
            aggregate.registry_matched = scored.registry_matched;
            aggregate.registry_degraded = scored.registry_degraded;
            aggregate.registry_penalty_applied = scored.registry_penalty_applied;
            aggregate.judge_available = scored.judge_available;
            if scored.last_updated > aggregate.last_updated {
                aggregate.last_updated = scored.last_updated;
            }
            aggregate.persisted |= scored.persisted;
        }
    }

    /// Record that a store row exists for `(composite_id, first_seen)`.
    pub async fn mark_persisted(&self, composite_id: &str, first_seen: DateTime<Utc>) {
        let mut window = self.window.write().await;
        if let Some(aggregate) = window.get_mut(composite_id) {
            if aggregate.first_seen == first_seen {
                aggregate.persisted = true;
            }
        }
    }

    /// Put evicted aggregates back after a failed final write so the next
    /// janitor tick retries them. If a newer window already took the slot the
    /// old aggregate is dropped.
    pub async fn restore(&self, aggregates: Vec<AggregatedDetection>) {
        let mut window = self.window.write().await;
        for aggregate in aggregates {
            if window.contains_key(&aggregate.composite_id) {
                warn!(
                    composite_id = %aggregate.composite_id,
                    "newer window exists, dropping unpersisted aggregate"
                );
                continue;
            }
            window.insert(aggregate.composite_id.clone(), aggregate);
        }
    }

    pub async fn live_windows(&self) -> usize {
        self.window.read().await.len()
    }

    pub async fn stats_snapshot(&self) -> WindowStatsSnapshot {
        WindowStatsSnapshot {
            live_windows: self.window.read().await.len(),
            windows_opened: self.stats.windows_opened.load(Ordering::Relaxed),
            evidence_merged: self.stats.evidence_merged.load(Ordering::Relaxed),
            duplicates_rejected: self.stats.duplicates_rejected.load(Ordering::Relaxed),
            windows_evicted: self.stats.windows_evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SourceType;

    fn correlator() -> Correlator {
        Correlator::new(
            Duration::seconds(300),
            WeightTable::default(),
            Arc::new(Metrics::unregistered()),
        )
    }

    fn event(
        source_type: SourceType,
        source_id: &str,
        host: &str,
        port: u16,
        timestamp: DateTime<Utc>,
    ) -> DetectionEvent {
        DetectionEvent {
            source_type,
            source_id: source_id.into(),
            timestamp,
            host_id: host.into(),
            port,
            manifest_hash: Some("m1".into()),
            process_signature: Some("p1".into()),
            snippet: "snippet".into(),
            details: serde_json::json!({"source": source_id}),
        }
    }

    #[tokio::test]
    async fn test_new_window_opens_with_fixed_width() {
        let correlator = correlator();
        let t0 = Utc::now();
        let aggregate = correlator
            .process_event(&event(SourceType::Endpoint, "scanner-1", "host-a", 3000, t0))
            .await;
        assert_eq!(aggregate.window_end - aggregate.window_start, Duration::seconds(300));
        assert_eq!(aggregate.first_seen, t0);
        assert_eq!(aggregate.evidence.len(), 1);
        assert_eq!(correlator.live_windows().await, 1);
    }

    #[tokio::test]
    async fn test_cross_source_merge_same_window() {
        let correlator = correlator();
        let t0 = Utc::now();
        correlator
            .process_event(&event(SourceType::Endpoint, "scanner-1", "host-a", 3000, t0))
            .await;
        let aggregate = correlator
            .process_event(&event(
                SourceType::Network,
                "sensor-1",
                "host-a",
                3000,
                t0 + Duration::seconds(30),
            ))
            .await;
        assert_eq!(aggregate.evidence.len(), 2);
        assert_eq!(correlator.live_windows().await, 1);
        assert_eq!(aggregate.last_updated, t0 + Duration::seconds(30));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_absorbed() {
        let correlator = correlator();
        let t0 = Utc::now();
        let e = event(SourceType::Endpoint, "scanner-1", "host-a", 3000, t0);
        correlator.process_event(&e).await;
        correlator.process_event(&e).await;
        let aggregate = correlator.process_event(&e).await;
        assert_eq!(aggregate.evidence.len(), 1);
        let stats = correlator.stats_snapshot().await;
        assert_eq!(stats.duplicates_rejected, 2);
    }

    #[tokio::test]
    async fn test_late_event_opens_new_window() {
        let correlator = correlator();
        let t0 = Utc::now();
        correlator
            .process_event(&event(SourceType::Endpoint, "scanner-1", "host-a", 3000, t0))
            .await;
        // Older than window_start by more than W
        let late = correlator
            .process_event(&event(
                SourceType::Endpoint,
                "scanner-2",
                "host-a",
                3000,
                t0 - Duration::seconds(301),
            ))
            .await;
        assert_eq!(late.evidence.len(), 1);
        assert_eq!(late.window_start, t0 - Duration::seconds(301));
        let stats = correlator.stats_snapshot().await;
        assert_eq!(stats.windows_opened, 2);
    }

    #[tokio::test]
    async fn test_slightly_old_event_still_merges() {
        let correlator = correlator();
        let t0 = Utc::now();
        correlator
            .process_event(&event(SourceType::Endpoint, "scanner-1", "host-a", 3000, t0))
            .await;
        let aggregate = correlator
            .process_event(&event(
                SourceType::Network,
                "sensor-1",
                "host-a",
                3000,
                t0 - Duration::seconds(100),
            ))
            .await;
        assert_eq!(aggregate.evidence.len(), 2);
        // last_updated does not move backwards
        assert_eq!(aggregate.last_updated, t0);
    }

    #[tokio::test]
    async fn test_cleanup_expired_drains_closed_windows() {
        let correlator = correlator();
        let t0 = Utc::now() - Duration::seconds(600);
        correlator
            .process_event(&event(SourceType::Endpoint, "scanner-1", "host-a", 3000, t0))
            .await;
        correlator
            .process_event(&event(SourceType::Endpoint, "scanner-1", "host-b", 4000, Utc::now()))
            .await;

        let expired = correlator.cleanup_expired(Utc::now()).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(correlator.live_windows().await, 1);
        // second pass finds nothing
        assert!(correlator.cleanup_expired(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn test_evidence_only_grows() {
        let correlator = correlator();
        let t0 = Utc::now();
        let mut seen = 0;
        for i in 0..5 {
            let aggregate = correlator
                .process_event(&event(
                    SourceType::Network,
                    &format!("sensor-{}", i),
                    "host-a",
                    3000,
                    t0 + Duration::seconds(i),
                ))
                .await;
            assert!(aggregate.evidence.len() > seen);
            seen = aggregate.evidence.len();
        }
        assert_eq!(seen, 5);
    }

    #[tokio::test]
    async fn test_mark_persisted_and_merge_scored() {
        let correlator = correlator();
        let t0 = Utc::now();
        let mut aggregate = correlator
            .process_event(&event(SourceType::Endpoint, "scanner-1", "host-a", 3000, t0))
            .await;
        correlator
            .mark_persisted(&aggregate.composite_id, aggregate.first_seen)
            .await;

        aggregate.registry_matched = true;
        aggregate.score = 5;
        aggregate.classification = crate::Classification::Authorized;
        correlator.merge_scored(&aggregate).await;

        let merged = correlator
            .process_event(&event(
                SourceType::Network,
                "sensor-1",
                "host-a",
                3000,
                t0 + Duration::seconds(10),
            ))
            .await;
        assert!(merged.registry_matched);
        assert!(merged.persisted);
        assert_eq!(merged.evidence.len(), 2);
    }

    #[tokio::test]
    async fn test_restore_keeps_newer_window() {
        let correlator = correlator();
        let t0 = Utc::now() - Duration::seconds(600);
        correlator
            .process_event(&event(SourceType::Endpoint, "scanner-1", "host-a", 3000, t0))
            .await;
        let expired = correlator.cleanup_expired(Utc::now()).await;
        assert_eq!(expired.len(), 1);

        correlator.restore(expired).await;
        assert_eq!(correlator.live_windows().await, 1);
        let again = correlator.cleanup_expired(Utc::now()).await;
        assert_eq!(again.len(), 1);
    }
}
