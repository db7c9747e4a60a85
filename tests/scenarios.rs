//! End-to-end correlation scenarios over the in-memory pipeline stages:
//! window merge, duplicate rejection, scoring, registry override, window
//! close and retrospective re-scoring.

use std::sync::Arc;

use chrono::{Duration, Utc};

use mcp_correlator::metrics::Metrics;
use mcp_correlator::retrospective::RETROSPECTIVE_SOURCE;
use mcp_correlator::scorer::{Scorer, WeightTable};
use mcp_correlator::{
    Classification, Correlator, DetectionEvent, EvidenceKind, EvidenceRecord, SourceType,
};

const WINDOW_SECONDS: i64 = 300;

fn correlator() -> Correlator {
    Correlator::new(
        Duration::seconds(WINDOW_SECONDS),
        WeightTable::default(),
        Arc::new(Metrics::unregistered()),
    )
}

fn event(
    source_type: SourceType,
    source_id: &str,
    timestamp: chrono::DateTime<Utc>,
) -> DetectionEvent {
    DetectionEvent {
        source_type,
        source_id: source_id.into(),
        timestamp,
        host_id: "host-a".into(),
        port: 3000,
        manifest_hash: Some("m1".into()),
        process_signature: Some("p1".into()),
        snippet: "mcp manifest found".into(),
        details: serde_json::json!({"source": source_id}),
    }
}

#[tokio::test]
async fn scenario_single_endpoint_no_registry() {
    let correlator = correlator();
    let scorer = Scorer::default();

    let mut aggregate = correlator
        .process_event(&event(SourceType::Endpoint, "scanner-1", Utc::now()))
        .await;
    scorer.score(&mut aggregate, 0);

    assert_eq!(aggregate.score, 11);
    assert_eq!(aggregate.classification, Classification::Unauthorized);
    assert_eq!(aggregate.evidence.len(), 1);
    assert!(!aggregate.judge_available);
}

#[tokio::test]
async fn scenario_endpoint_and_network_merge() {
    let correlator = correlator();
    let scorer = Scorer::default();
    let t0 = Utc::now();

    correlator
        .process_event(&event(SourceType::Endpoint, "scanner-1", t0))
        .await;
    let mut aggregate = correlator
        .process_event(&event(
            SourceType::Network,
            "sensor-1",
            t0 + Duration::seconds(30),
        ))
        .await;
    scorer.score(&mut aggregate, 0);

    assert_eq!(correlator.live_windows().await, 1);
    assert_eq!(aggregate.evidence.len(), 2);
    assert_eq!(aggregate.score, 14);
    assert_eq!(aggregate.classification, Classification::Unauthorized);
}

#[tokio::test]
async fn scenario_registry_match_forces_authorized() {
    let correlator = correlator();
    let scorer = Scorer::default();
    let t0 = Utc::now();

    correlator
        .process_event(&event(SourceType::Endpoint, "scanner-1", t0))
        .await;
    correlator
        .process_event(&event(
            SourceType::Gateway,
            "gateway-1",
            t0 + Duration::seconds(10),
        ))
        .await;
    let mut aggregate = correlator
        .process_event(&event(
            SourceType::Network,
            "sensor-1",
            t0 + Duration::seconds(20),
        ))
        .await;

    aggregate.registry_matched = true;
    scorer.score(&mut aggregate, -6);

    // raw 11 + 5 + 3 = 19, penalty -6
    assert_eq!(aggregate.score, 13);
    assert_eq!(aggregate.classification, Classification::Authorized);
    assert!(aggregate.registry_penalty_applied);
}

#[tokio::test]
async fn scenario_classifier_outage_then_recovery() {
    let correlator = correlator();
    let scorer = Scorer::default();
    let t0 = Utc::now() - Duration::seconds(WINDOW_SECONDS + 10);

    // classifier down: only endpoint + network arrive
    correlator
        .process_event(&event(SourceType::Endpoint, "scanner-1", t0))
        .await;
    correlator
        .process_event(&event(
            SourceType::Network,
            "sensor-1",
            t0 + Duration::seconds(5),
        ))
        .await;

    // window closes; the janitor's sweep emits the final write
    let mut expired = correlator.cleanup_expired(Utc::now()).await;
    assert_eq!(expired.len(), 1);
    let mut aggregate = expired.remove(0);
    scorer.score(&mut aggregate, 0);
    assert_eq!(aggregate.score, 14);
    assert_eq!(aggregate.classification, Classification::Unauthorized);
    assert!(!aggregate.judge_available);

    // classifier recovers: the retrospective pass appends judge evidence
    aggregate.append_evidence(EvidenceRecord::new(
        EvidenceKind::Gateway,
        RETROSPECTIVE_SOURCE,
        5,
        Utc::now(),
        "judge verdict",
        serde_json::json!({"confidence": 0.9}),
    ));
    scorer.score(&mut aggregate, 0);
    assert_eq!(aggregate.score, 19);
    assert_eq!(aggregate.classification, Classification::Unauthorized);
    assert!(aggregate.judge_available);

    // a second pass sees judge evidence and leaves the row alone
    let has_judge = aggregate
        .evidence
        .iter()
        .filter(|e| e.source == RETROSPECTIVE_SOURCE)
        .count();
    assert_eq!(has_judge, 1);
}

#[tokio::test]
async fn scenario_late_event_opens_new_window() {
    let correlator = correlator();
    let t0 = Utc::now() - Duration::seconds(400);

    let first = correlator
        .process_event(&event(SourceType::Endpoint, "scanner-1", t0))
        .await;
    let evicted = correlator
        .cleanup_expired(t0 + Duration::seconds(WINDOW_SECONDS))
        .await;
    assert_eq!(evicted.len(), 1);

    let second = correlator
        .process_event(&event(
            SourceType::Endpoint,
            "scanner-1",
            t0 + Duration::seconds(400),
        ))
        .await;

    // same target, two disjoint windows
    assert_eq!(first.composite_id, second.composite_id);
    assert!(first.window_end <= second.window_start);
    assert_eq!(second.evidence.len(), 1);
}

#[tokio::test]
async fn scenario_duplicate_delivery_absorbed() {
    let correlator = correlator();
    let e = event(SourceType::Endpoint, "scanner-1", Utc::now());

    correlator.process_event(&e).await;
    correlator.process_event(&e).await;
    let aggregate = correlator.process_event(&e).await;

    assert_eq!(aggregate.evidence.len(), 1);
    assert_eq!(correlator.live_windows().await, 1);
    let stats = correlator.stats_snapshot().await;
    assert_eq!(stats.duplicates_rejected, 2);
}
