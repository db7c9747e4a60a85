//! Analytics store writer
//!
//! Writes aggregated detections to ClickHouse over its HTTP interface:
//! inserts as `JSONEachRow` batches, retrospective updates as mutations keyed
//! by `(composite_id, first_seen)`. Evidence is flattened into parallel
//! arrays matching the store's nested columns. Retention and partitioning are
//! DDL concerns of the store and not handled here.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::config::AnalyticsConfig;
use crate::metrics::Metrics;
use crate::{
    truncate_snippet, AggregatedDetection, Classification, CorrelatorError, EvidenceKind,
    EvidenceRecord,
};

/// One `detections` row. Timestamps are epoch milliseconds; evidence arrays
/// are parallel and always of equal length.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRow {
    pub detection_id: String,
    pub timestamp: u64,
    pub host_id_hash: String,
    pub composite_id: String,
    pub port: u16,
    pub manifest_hash: String,
    pub first_seen: u64,
    pub last_updated: u64,
    pub window_start: u64,
    pub window_end: u64,
    pub score: u32,
    pub classification: String,
    pub registry_matched: u8,
    pub registry_degraded: u8,
    pub registry_penalty_applied: u8,
    pub judge_available: u8,
    #[serde(rename = "evidence.kind")]
    pub evidence_kind: Vec<String>,
    #[serde(rename = "evidence.source")]
    pub evidence_source: Vec<String>,
    #[serde(rename = "evidence.score_contribution")]
    pub evidence_score_contribution: Vec<u32>,
    #[serde(rename = "evidence.timestamp")]
    pub evidence_timestamp: Vec<u64>,
    #[serde(rename = "evidence.snippet")]
    pub evidence_snippet: Vec<String>,
}

impl DetectionRow {
    /// Flatten an aggregate. Snippets are truncated again on the way in as
    /// defense in depth against an upstream that forgot the bound.
    pub fn from_aggregate(aggregate: &AggregatedDetection) -> Self {
        let mut evidence_kind = Vec::with_capacity(aggregate.evidence.len());
        let mut evidence_source = Vec::with_capacity(aggregate.evidence.len());
        let mut evidence_score_contribution = Vec::with_capacity(aggregate.evidence.len());
        let mut evidence_timestamp = Vec::with_capacity(aggregate.evidence.len());
        let mut evidence_snippet = Vec::with_capacity(aggregate.evidence.len());
        for record in &aggregate.evidence {
            evidence_kind.push(record.kind.as_str().to_string());
            evidence_source.push(record.source.clone());
            evidence_score_contribution.push(record.score_contribution);
            evidence_timestamp.push(record.timestamp.timestamp_millis() as u64);
            evidence_snippet.push(truncate_snippet(&record.snippet));
        }
        Self {
            detection_id: Uuid::new_v4().to_string(),
            timestamp: aggregate.last_updated.timestamp_millis() as u64,
            host_id_hash: aggregate.host_id_hash.clone(),
            composite_id: aggregate.composite_id.clone(),
            port: aggregate.port,
            manifest_hash: aggregate.manifest_hash.clone().unwrap_or_default(),
            first_seen: aggregate.first_seen.timestamp_millis() as u64,
            last_updated: aggregate.last_updated.timestamp_millis() as u64,
            window_start: aggregate.window_start.timestamp_millis() as u64,
            window_end: aggregate.window_end.timestamp_millis() as u64,
            score: aggregate.score,
            classification: aggregate.classification.as_str().to_string(),
            registry_matched: aggregate.registry_matched as u8,
            registry_degraded: aggregate.registry_degraded as u8,
            registry_penalty_applied: aggregate.registry_penalty_applied as u8,
            judge_available: aggregate.judge_available as u8,
            evidence_kind,
            evidence_source,
            evidence_score_contribution,
            evidence_timestamp,
            evidence_snippet,
        }
    }

    /// Rebuild an aggregate for retrospective re-scoring. Evidence details do
    /// not survive the store roundtrip; idempotence comes from the
    /// `judge_available` filter, not from signatures.
    pub fn into_aggregate(self) -> AggregatedDetection {
        let mut evidence = Vec::with_capacity(self.evidence_kind.len());
        for i in 0..self.evidence_kind.len() {
            evidence.push(EvidenceRecord {
                kind: EvidenceKind::parse(&self.evidence_kind[i]).unwrap_or(EvidenceKind::Gateway),
                source: self.evidence_source.get(i).cloned().unwrap_or_default(),
                score_contribution: self.evidence_score_contribution.get(i).copied().unwrap_or(0),
                timestamp: millis_to_datetime(
                    self.evidence_timestamp.get(i).copied().unwrap_or(0),
                ),
                snippet: self.evidence_snippet.get(i).cloned().unwrap_or_default(),
                details: serde_json::Value::Null,
            });
        }
        AggregatedDetection {
            composite_id: self.composite_id,
            host_id_hash: self.host_id_hash,
            port: self.port,
            manifest_hash: if self.manifest_hash.is_empty() {
                None
            } else {
                Some(self.manifest_hash)
            },
            first_seen: millis_to_datetime(self.first_seen),
            last_updated: millis_to_datetime(self.last_updated),
            window_start: millis_to_datetime(self.window_start),
            window_end: millis_to_datetime(self.window_end),
            evidence,
            score: self.score,
            classification: Classification::parse(&self.classification)
                .unwrap_or(Classification::Suspect),
            registry_matched: self.registry_matched != 0,
            registry_degraded: self.registry_degraded != 0,
            registry_penalty_applied: self.registry_penalty_applied != 0,
            judge_available: self.judge_available != 0,
            persisted: true,
        }
    }
}

fn millis_to_datetime(millis: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis as i64).unwrap_or_default()
}

pub struct Persister {
    client: reqwest::Client,
    base_url: String,
    database: String,
    table: String,
    username: String,
    password: String,
    metrics: Arc<Metrics>,
}

impl Persister {
    pub fn new(config: &AnalyticsConfig, metrics: Arc<Metrics>) -> Result<Self, CorrelatorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.write_timeout_seconds))
            .pool_max_idle_per_host(config.pool_max_idle)
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_seconds))
            .build()
            .map_err(|e| CorrelatorError::Store(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            database: config.database.clone(),
            table: config.table.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            metrics,
        })
    }

    fn table_ref(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }

    fn request(&self, sql: String) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(&self.base_url)
            .query(&[("query", sql.as_str())]);
        if !self.username.is_empty() {
            request = request
                .header("X-ClickHouse-User", &self.username)
                .header("X-ClickHouse-Key", &self.password);
        }
        request
    }

    async fn execute(&self, sql: String, body: Option<String>) -> Result<(), CorrelatorError> {
        let timer = self
            .metrics
            .clickhouse_write_latency_seconds
            .start_timer();
        let request = match body {
            Some(body) => self.request(sql).body(body),
            None => self.request(sql),
        };
        let result = request.send().await;
        timer.observe_duration();

        let response = result.map_err(|e| CorrelatorError::Store(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(CorrelatorError::Store(format!(
                "store returned {}: {}",
                status,
                detail.trim()
            )));
        }
        Ok(())
    }

    /// First emission of a window.
    pub async fn insert(&self, aggregate: &AggregatedDetection) -> Result<(), CorrelatorError> {
        self.insert_batch(std::slice::from_ref(aggregate)).await
    }

    /// Janitor path: all rows in one request so the write is all-or-nothing
    /// at the store boundary; any failure surfaces as retryable.
    pub async fn insert_batch(
        &self,
        aggregates: &[AggregatedDetection],
    ) -> Result<(), CorrelatorError> {
        if aggregates.is_empty() {
            return Ok(());
        }
        let sql = format!("INSERT INTO {} FORMAT JSONEachRow", self.table_ref());
        let mut body = String::new();
        for aggregate in aggregates {
            let row = DetectionRow::from_aggregate(aggregate);
            let line = serde_json::to_string(&row)
                .map_err(|e| CorrelatorError::Store(e.to_string()))?;
            body.push_str(&line);
            body.push('\n');
        }
        debug!(rows = aggregates.len(), "inserting detections");
        self.execute(sql, Some(body)).await
    }

    /// Replace the scored fields and evidence on the row whose
    /// `(composite_id, first_seen)` matches; used by later emissions of a
    /// live window and by retrospective re-scoring.
    pub async fn update(&self, aggregate: &AggregatedDetection) -> Result<(), CorrelatorError> {
        let row = DetectionRow::from_aggregate(aggregate);
        let sql = format!(
            "ALTER TABLE {} UPDATE \
             score = {}, classification = {}, judge_available = {}, \
             registry_matched = {}, registry_degraded = {}, registry_penalty_applied = {}, \
             last_updated = {}, timestamp = {}, \
             `evidence.kind` = {}, `evidence.source` = {}, \
             `evidence.score_contribution` = {}, `evidence.timestamp` = {}, \
             `evidence.snippet` = {} \
             WHERE composite_id = {} AND first_seen = {}",
            self.table_ref(),
            row.score,
            sql_quote(&row.classification),
            row.judge_available,
            row.registry_matched,
            row.registry_degraded,
            row.registry_penalty_applied,
            row.last_updated,
            row.timestamp,
            sql_string_array(&row.evidence_kind),
            sql_string_array(&row.evidence_source),
            sql_number_array(&row.evidence_score_contribution),
            sql_number_array(&row.evidence_timestamp),
            sql_string_array(&row.evidence_snippet),
            sql_quote(&row.composite_id),
            row.first_seen,
        );
        debug!(composite_id = %aggregate.composite_id, "updating detection row");
        self.execute(sql, None).await
    }

    /// Candidates for retrospective re-scoring: recent rows that never saw
    /// judge evidence.
    pub async fn fetch_unjudged(
        &self,
        horizon: Duration,
        limit: usize,
    ) -> Result<Vec<AggregatedDetection>, CorrelatorError> {
        let cutoff = (Utc::now()
            - chrono::Duration::from_std(horizon).unwrap_or_else(|_| chrono::Duration::zero()))
        .timestamp_millis();
        let sql = format!(
            "SELECT * FROM {} WHERE judge_available = 0 AND timestamp > {} \
             ORDER BY timestamp DESC LIMIT {} FORMAT JSONEachRow",
            self.table_ref(),
            cutoff.max(0),
            limit,
        );
        let response = self
            .request(sql)
            .send()
            .await
            .map_err(|e| CorrelatorError::Store(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CorrelatorError::Store(format!(
                "store returned {}",
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| CorrelatorError::Store(e.to_string()))?;

        let mut aggregates = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let row: DetectionRow = serde_json::from_str(line)
                .map_err(|e| CorrelatorError::Store(format!("bad row: {}", e)))?;
            aggregates.push(row.into_aggregate());
        }
        Ok(aggregates)
    }

    /// Liveness of the store; drives the `/ready` endpoint and the boot check.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/ping", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

fn sql_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        match c {
            '\'' => quoted.push_str("\\'"),
            '\\' => quoted.push_str("\\\\"),
            _ => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

fn sql_string_array(values: &[String]) -> String {
    let quoted: Vec<String> = values.iter().map(|v| sql_quote(v)).collect();
    format!("[{}]", quoted.join(","))
}

fn sql_number_array<T: std::fmt::Display>(values: &[T]) -> String {
    let rendered: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", rendered.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::WeightTable;

    fn aggregate() -> AggregatedDetection {
        let weights = WeightTable::default();
        let event = crate::DetectionEvent {
            source_type: crate::SourceType::Endpoint,
            source_id: "scanner-1".into(),
            timestamp: Utc::now(),
            host_id: "raw-host-name".into(),
            port: 3000,
            manifest_hash: Some("m1".into()),
            process_signature: Some("p1".into()),
            snippet: "s".repeat(5000),
            details: serde_json::json!({"path": "/opt/mcp"}),
        };
        let mut aggregate = AggregatedDetection::open(&event, chrono::Duration::seconds(300));
        aggregate.append_evidence(EvidenceRecord::new(
            EvidenceKind::Endpoint,
            "scanner-1",
            weights.contribution_for(EvidenceKind::Endpoint),
            event.timestamp,
            &event.snippet,
            event.details.clone(),
        ));
        aggregate.score = 11;
        aggregate.classification = Classification::Unauthorized;
        aggregate
    }

    #[test]
    fn test_row_arrays_are_parallel() {
        let row = DetectionRow::from_aggregate(&aggregate());
        assert_eq!(row.evidence_kind.len(), 1);
        assert_eq!(row.evidence_source.len(), 1);
        assert_eq!(row.evidence_score_contribution.len(), 1);
        assert_eq!(row.evidence_timestamp.len(), 1);
        assert_eq!(row.evidence_snippet.len(), 1);
        assert_eq!(row.evidence_kind[0], "endpoint");
        assert_eq!(row.evidence_score_contribution[0], 11);
    }

    #[test]
    fn test_row_never_carries_raw_host_id() {
        let row = DetectionRow::from_aggregate(&aggregate());
        let rendered = serde_json::to_string(&row).unwrap();
        assert!(!rendered.contains("raw-host-name"));
        assert_eq!(row.host_id_hash.len(), 64);
    }

    #[test]
    fn test_row_snippets_respect_bound() {
        let row = DetectionRow::from_aggregate(&aggregate());
        assert!(row.evidence_snippet.iter().all(|s| s.len() <= crate::MAX_SNIPPET_BYTES));
    }

    #[test]
    fn test_row_roundtrip() {
        let original = aggregate();
        let row = DetectionRow::from_aggregate(&original);
        let rendered = serde_json::to_string(&row).unwrap();
        let parsed: DetectionRow = serde_json::from_str(&rendered).unwrap();
        let rebuilt = parsed.into_aggregate();

        assert_eq!(rebuilt.composite_id, original.composite_id);
        assert_eq!(rebuilt.port, 3000);
        assert_eq!(rebuilt.manifest_hash.as_deref(), Some("m1"));
        assert_eq!(rebuilt.score, 11);
        assert_eq!(rebuilt.classification, Classification::Unauthorized);
        assert_eq!(rebuilt.evidence.len(), 1);
        assert!(rebuilt.persisted);
        assert_eq!(
            rebuilt.first_seen.timestamp_millis(),
            original.first_seen.timestamp_millis()
        );
    }

    #[test]
    fn test_nested_column_names() {
        let row = DetectionRow::from_aggregate(&aggregate());
        let rendered = serde_json::to_string(&row).unwrap();
        assert!(rendered.contains("\"evidence.kind\""));
        assert!(rendered.contains("\"evidence.score_contribution\""));
    }

    #[test]
    fn test_sql_quoting() {
        assert_eq!(sql_quote("plain"), "'plain'");
        assert_eq!(sql_quote("it's"), "'it\\'s'");
        assert_eq!(sql_quote("back\\slash"), "'back\\\\slash'");
        assert_eq!(
            sql_string_array(&["a".into(), "b'c".into()]),
            "['a','b\\'c']"
        );
        assert_eq!(sql_number_array(&[1u32, 2, 3]), "[1,2,3]");
    }

    #[tokio::test]
    async fn test_health_check_unreachable_store() {
        let config = AnalyticsConfig {
            url: "http://127.0.0.1:1".into(),
            write_timeout_seconds: 1,
            ..AnalyticsConfig::default()
        };
        let persister = Persister::new(&config, Arc::new(Metrics::unregistered())).unwrap();
        assert!(!persister.health_check().await);
    }

    #[tokio::test]
    async fn test_insert_against_unreachable_store_is_retryable() {
        let config = AnalyticsConfig {
            url: "http://127.0.0.1:1".into(),
            write_timeout_seconds: 1,
            ..AnalyticsConfig::default()
        };
        let persister = Persister::new(&config, Arc::new(Metrics::unregistered())).unwrap();
        let err = persister.insert(&aggregate()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
