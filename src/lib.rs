//! MCP Correlation & Scoring Engine
//!
//! Fuses detection events from endpoint scanners, network sensors and the
//! LLM-gateway classifier into per-target aggregated detections, checks the
//! approval registry, computes a weighted score and persists auditable
//! verdicts to the analytics store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub mod classifier;
pub mod config;
pub mod correlator;
pub mod identity;
pub mod ingestor;
pub mod janitor;
pub mod metrics;
pub mod observability;
pub mod persister;
pub mod registry;
pub mod retrospective;
pub mod scorer;
pub mod tls;

pub use classifier::ClassifierClient;
pub use config::CorrelatorConfig;
pub use correlator::Correlator;
pub use ingestor::Ingestor;
pub use janitor::Janitor;
pub use metrics::Metrics;
pub use persister::Persister;
pub use registry::RegistryLookup;
pub use retrospective::RetrospectiveScorer;
pub use scorer::Scorer;

/// Maximum evidence snippet length in bytes; longer snippets are truncated
/// on construction and again before persistence.
pub const MAX_SNIPPET_BYTES: usize = 1024;

/// Correlation engine error types
#[derive(Error, Debug)]
pub enum CorrelatorError {
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("bus error: {0}")]
    Bus(String),
    #[error("registry unavailable: {0}")]
    Registry(String),
    #[error("classifier unavailable: {0}")]
    Classifier(String),
    #[error("analytics store error: {0}")]
    Store(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("certificate error: {0}")]
    Certificate(String),
}

impl CorrelatorError {
    /// Whether redelivery of the triggering message can fix this failure.
    /// Malformed payloads stay malformed; store and bus failures are
    /// transient and worth a redelivery.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CorrelatorError::Store(_) | CorrelatorError::Bus(_))
    }

    /// Label used for the `errors_total` counter.
    pub fn counter_label(&self) -> &'static str {
        match self {
            CorrelatorError::MalformedEvent(_) => "decode",
            CorrelatorError::Bus(_) => "bus",
            CorrelatorError::Registry(_) => "registry",
            CorrelatorError::Classifier(_) => "classifier",
            CorrelatorError::Store(_) => "store",
            CorrelatorError::Config(_) => "config",
            CorrelatorError::Certificate(_) => "certificate",
        }
    }
}

/// Origin of a detection event on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Endpoint,
    Network,
    Gateway,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Endpoint => "endpoint",
            SourceType::Network => "network",
            SourceType::Gateway => "gateway",
        }
    }
}

/// Kind of an evidence record inside an aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceKind {
    Endpoint,
    Network,
    Gateway,
    Judge,
    Registry,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKind::Endpoint => "endpoint",
            EvidenceKind::Network => "network",
            EvidenceKind::Gateway => "gateway",
            EvidenceKind::Judge => "judge",
            EvidenceKind::Registry => "registry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "endpoint" => Some(EvidenceKind::Endpoint),
            "network" => Some(EvidenceKind::Network),
            "gateway" => Some(EvidenceKind::Gateway),
            "judge" => Some(EvidenceKind::Judge),
            "registry" => Some(EvidenceKind::Registry),
            _ => None,
        }
    }
}

impl From<SourceType> for EvidenceKind {
    fn from(source_type: SourceType) -> Self {
        match source_type {
            SourceType::Endpoint => EvidenceKind::Endpoint,
            SourceType::Network => EvidenceKind::Network,
            SourceType::Gateway => EvidenceKind::Gateway,
        }
    }
}

/// Verdict for an aggregated target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Authorized,
    Suspect,
    Unauthorized,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Authorized => "authorized",
            Classification::Suspect => "suspect",
            Classification::Unauthorized => "unauthorized",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "authorized" => Some(Classification::Authorized),
            "suspect" => Some(Classification::Suspect),
            "unauthorized" => Some(Classification::Unauthorized),
            _ => None,
        }
    }
}

/// Raw detection event as delivered on the bus. Consumed once and never
/// persisted in this form; the raw `host_id` is hashed before anything
/// leaves memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub source_type: SourceType,
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub host_id: String,
    pub port: u16,
    #[serde(default)]
    pub manifest_hash: Option<String>,
    #[serde(default)]
    pub process_signature: Option<String>,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl DetectionEvent {
    /// Decode a bus envelope. Failures are fatal for the message: redelivery
    /// cannot fix malformed bytes.
    pub fn decode(payload: &[u8]) -> Result<Self, CorrelatorError> {
        serde_json::from_slice(payload).map_err(|e| CorrelatorError::MalformedEvent(e.to_string()))
    }
}

/// Single piece of evidence attached to an aggregate. Immutable after append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub kind: EvidenceKind,
    pub source: String,
    pub score_contribution: u32,
    pub timestamp: DateTime<Utc>,
    pub snippet: String,
    pub details: serde_json::Value,
}

impl EvidenceRecord {
    pub fn new(
        kind: EvidenceKind,
        source: impl Into<String>,
        score_contribution: u32,
        timestamp: DateTime<Utc>,
        snippet: &str,
        details: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            source: source.into(),
            score_contribution,
            timestamp,
            snippet: truncate_snippet(snippet),
            details,
        }
    }

    /// Duplicate-rejection signature over `(kind, source, timestamp, details)`.
    pub fn signature(&self) -> String {
        identity::evidence_signature(self.kind, &self.source, self.timestamp, &self.details)
    }
}

/// Per-target aggregation of evidence within one correlation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedDetection {
    pub composite_id: String,
    pub host_id_hash: String,
    pub port: u16,
    #[serde(default)]
    pub manifest_hash: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub evidence: Vec<EvidenceRecord>,
    pub score: u32,
    pub classification: Classification,
    pub registry_matched: bool,
    pub registry_degraded: bool,
    pub registry_penalty_applied: bool,
    pub judge_available: bool,
    /// True once a row for `(composite_id, first_seen)` exists in the store;
    /// decides insert-vs-update on the next emission. Never persisted.
    #[serde(skip)]
    pub persisted: bool,
}

impl AggregatedDetection {
    /// Open a fresh window for the target identified by the event.
    pub fn open(event: &DetectionEvent, window_width: chrono::Duration) -> Self {
        let host_id_hash = identity::host_id_hash(&event.host_id);
        let composite_id = identity::composite_id(
            &host_id_hash,
            event.port,
            event.manifest_hash.as_deref(),
            event.process_signature.as_deref(),
        );
        Self {
            composite_id,
            host_id_hash,
            port: event.port,
            manifest_hash: event.manifest_hash.clone(),
            first_seen: event.timestamp,
            last_updated: event.timestamp,
            window_start: event.timestamp,
            window_end: event.timestamp + window_width,
            evidence: Vec::new(),
            score: 0,
            classification: Classification::Authorized,
            registry_matched: false,
            registry_degraded: false,
            registry_penalty_applied: false,
            judge_available: false,
            persisted: false,
        }
    }

    pub fn has_evidence_signature(&self, signature: &str) -> bool {
        self.evidence.iter().any(|e| e.signature() == signature)
    }

    pub fn has_evidence_kind(&self, kind: EvidenceKind) -> bool {
        self.evidence.iter().any(|e| e.kind == kind)
    }

    /// Append evidence and bump `last_updated`, clamped to the window end.
    pub fn append_evidence(&mut self, record: EvidenceRecord) {
        let ts = record.timestamp;
        self.evidence.push(record);
        if ts > self.last_updated {
            self.last_updated = ts.min(self.window_end);
        }
    }
}

/// Truncate a snippet to [`MAX_SNIPPET_BYTES`] on a UTF-8 boundary.
pub fn truncate_snippet(snippet: &str) -> String {
    if snippet.len() <= MAX_SNIPPET_BYTES {
        return snippet.to_string();
    }
    let mut end = MAX_SNIPPET_BYTES;
    while end > 0 && !snippet.is_char_boundary(end) {
        end -= 1;
    }
    snippet[..end].to_string()
}

/// Synchronous per-event path: Correlator -> RegistryLookup -> Scorer ->
/// Persister. One instance is shared by the ingest workers and the janitor;
/// there is no queue between the stages, backpressure falls out of the
/// call chain.
pub struct Pipeline {
    correlator: Arc<Correlator>,
    registry: Arc<RegistryLookup>,
    scorer: Scorer,
    persister: Arc<Persister>,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    pub fn new(
        correlator: Arc<Correlator>,
        registry: Arc<RegistryLookup>,
        scorer: Scorer,
        persister: Arc<Persister>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            correlator,
            registry,
            scorer,
            persister,
            metrics,
        }
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Process one decoded bus event end to end. A `Store` error here means
    /// the caller should nack the message for redelivery.
    pub async fn handle_event(&self, event: &DetectionEvent) -> Result<(), CorrelatorError> {
        self.metrics
            .detections_processed_total
            .with_label_values(&[event.source_type.as_str()])
            .inc();

        let mut aggregate = self.correlator.process_event(event).await;
        self.enrich_and_score(&mut aggregate).await;
        self.correlator.merge_scored(&aggregate).await;
        self.persist(&mut aggregate).await
    }

    /// Registry lookup plus scoring; mutates the aggregate in place. Registry
    /// outages degrade to "not matched" and never fail the pipeline.
    pub async fn enrich_and_score(&self, aggregate: &mut AggregatedDetection) {
        let lookup = self.registry.lookup(aggregate).await;
        aggregate.registry_degraded = lookup.degraded;
        if lookup.matched {
            aggregate.registry_matched = true;
            if !aggregate.has_evidence_kind(EvidenceKind::Registry) {
                aggregate.append_evidence(EvidenceRecord::new(
                    EvidenceKind::Registry,
                    "registry",
                    0,
                    aggregate.last_updated,
                    "",
                    lookup.entry.clone().unwrap_or(serde_json::Value::Null),
                ));
            }
            self.metrics.registry_matched_total.inc();
        }
        self.scorer.score(aggregate, lookup.penalty);
        self.metrics
            .classification_total
            .with_label_values(&[aggregate.classification.as_str()])
            .inc();
        self.metrics.correlation_score.observe(aggregate.score as f64);
    }

    /// Insert on first emission of a window, update afterwards. Marks the
    /// window as persisted on success so redundant inserts cannot happen.
    pub async fn persist(&self, aggregate: &mut AggregatedDetection) -> Result<(), CorrelatorError> {
        let result = if aggregate.persisted {
            self.persister.update(aggregate).await
        } else {
            self.persister.insert(aggregate).await
        };
        match result {
            Ok(()) => {
                aggregate.persisted = true;
                self.correlator
                    .mark_persisted(&aggregate.composite_id, aggregate.first_seen)
                    .await;
                Ok(())
            }
            Err(e) => {
                self.metrics
                    .errors_total
                    .with_label_values(&[e.counter_label()])
                    .inc();
                Err(e)
            }
        }
    }

    /// Drain window-expired aggregates: score each, then write inserts as a
    /// single batch and updates row by row. On a store failure the aggregates
    /// are put back so the next janitor tick retries them.
    pub async fn finalize_expired(&self, mut expired: Vec<AggregatedDetection>) {
        if expired.is_empty() {
            return;
        }
        for aggregate in expired.iter_mut() {
            self.enrich_and_score(aggregate).await;
        }
        let (updates, inserts): (Vec<_>, Vec<_>) =
            expired.into_iter().partition(|a| a.persisted);

        if !inserts.is_empty() {
            if let Err(e) = self.persister.insert_batch(&inserts).await {
                warn!("final write of {} expired aggregates failed: {}", inserts.len(), e);
                self.metrics
                    .errors_total
                    .with_label_values(&[e.counter_label()])
                    .inc();
                self.correlator.restore(inserts).await;
            }
        }
        for aggregate in updates {
            if let Err(e) = self.persister.update(&aggregate).await {
                warn!(
                    "final update of aggregate {} failed: {}",
                    aggregate.composite_id, e
                );
                self.metrics
                    .errors_total
                    .with_label_values(&[e.counter_label()])
                    .inc();
                self.correlator.restore(vec![aggregate]).await;
            }
        }
    }
}
