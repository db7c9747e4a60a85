//! Retrospective re-scoring
//!
//! When the classifier was down at detection time, persisted rows carry
//! `judge_available = false`. This task periodically finds such rows, runs
//! the classifier over them, appends a synthetic judge evidence record and
//! rewrites the row. It never touches the live window table; the store's
//! row updates are the only communication channel with the live pipeline,
//! and the `judge_available` filter makes the pass idempotent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::classifier::ClassifierClient;
use crate::metrics::Metrics;
use crate::persister::Persister;
use crate::scorer::Scorer;
use crate::{AggregatedDetection, EvidenceKind, EvidenceRecord};

/// Source tag for evidence appended by this task.
pub const RETROSPECTIVE_SOURCE: &str = "judge-retrospective";

pub struct RetrospectiveScorer {
    classifier: Arc<ClassifierClient>,
    persister: Arc<Persister>,
    scorer: Scorer,
    metrics: Arc<Metrics>,
    interval: Duration,
    horizon: Duration,
    batch_limit: usize,
}

impl RetrospectiveScorer {
    pub fn new(
        classifier: Arc<ClassifierClient>,
        persister: Arc<Persister>,
        scorer: Scorer,
        metrics: Arc<Metrics>,
        interval: Duration,
        horizon: Duration,
        batch_limit: usize,
    ) -> Self {
        Self {
            classifier,
            persister,
            scorer,
            metrics,
            interval,
            horizon,
            batch_limit,
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("retrospective scorer stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// One pass: gate on classifier health, then re-score up to
    /// `batch_limit` unjudged detections.
    pub async fn tick(&self) {
        if let Err(e) = self.classifier.health().await {
            debug!("classifier not healthy, skipping retrospective pass: {}", e);
            self.metrics
                .errors_total
                .with_label_values(&["classifier"])
                .inc();
            return;
        }

        let candidates = match self.persister.fetch_unjudged(self.horizon, self.batch_limit).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("unjudged query failed: {}", e);
                self.metrics
                    .errors_total
                    .with_label_values(&[e.counter_label()])
                    .inc();
                return;
            }
        };
        if candidates.is_empty() {
            return;
        }
        info!("re-scoring {} detections with recovered classifier", candidates.len());

        for aggregate in candidates {
            if let Err(e) = self.rescore(aggregate).await {
                warn!("retrospective re-score failed: {}", e);
                self.metrics
                    .errors_total
                    .with_label_values(&[e.counter_label()])
                    .inc();
            }
        }
    }

    async fn rescore(
        &self,
        mut aggregate: AggregatedDetection,
    ) -> Result<(), crate::CorrelatorError> {
        let verdict = self.classifier.classify(&aggregate).await?;

        let record = EvidenceRecord::new(
            EvidenceKind::Gateway,
            RETROSPECTIVE_SOURCE,
            verdict.score_contribution.max(0) as u32,
            Utc::now(),
            &verdict.reasoning,
            serde_json::json!({
                "classification": verdict.classification,
                "confidence": verdict.confidence,
            }),
        );
        // A row that slipped past the filter with a judge record already on
        // it gets no second one
        if aggregate
            .evidence
            .iter()
            .any(|e| e.source == RETROSPECTIVE_SOURCE)
        {
            return Ok(());
        }
        aggregate.append_evidence(record);

        self.scorer.score(&mut aggregate, 0);
        self.metrics
            .classification_total
            .with_label_values(&[aggregate.classification.as_str()])
            .inc();
        self.persister.update(&aggregate).await
    }
}
