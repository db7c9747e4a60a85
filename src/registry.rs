//! Approval registry lookups
//!
//! Asks the registry whether an aggregated target matches an approved MCP
//! installation. Outages degrade to "not matched" with the degraded flag set;
//! the aggregate stays scorable and the failure shows up on the error
//! counter. A short TTL cache absorbs burst lookups for the same target.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::RegistryConfig;
use crate::metrics::Metrics;
use crate::{AggregatedDetection, CorrelatorError};

/// Outcome of a registry match query.
#[derive(Debug, Clone)]
pub struct RegistryMatch {
    pub matched: bool,
    pub entry: Option<serde_json::Value>,
    pub penalty: i64,
    pub degraded: bool,
}

impl RegistryMatch {
    fn degraded() -> Self {
        Self {
            matched: false,
            entry: None,
            penalty: 0,
            degraded: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MatchResponse {
    matched: bool,
    #[serde(default)]
    entry: Option<serde_json::Value>,
    #[serde(default)]
    penalty: i64,
}

struct CacheEntry {
    stored_at: Instant,
    result: RegistryMatch,
}

pub struct RegistryLookup {
    /// Swapped wholesale when the mTLS material rotates.
    client: RwLock<reqwest::Client>,
    base_url: String,
    auth_token: String,
    timeout: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
    cache_ttl: Duration,
    metrics: Arc<Metrics>,
}

impl RegistryLookup {
    pub fn new(
        config: &RegistryConfig,
        identity: Option<reqwest::Identity>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, CorrelatorError> {
        let timeout = Duration::from_secs(config.timeout_seconds);
        let client = build_client(timeout, identity)?;
        Ok(Self {
            client: RwLock::new(client),
            base_url: config.url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            timeout,
            cache: Mutex::new(HashMap::new()),
            cache_ttl: Duration::from_secs(config.cache_ttl_seconds),
            metrics,
        })
    }

    /// Query the registry for an aggregate. Never fails: outages are reported
    /// through the `degraded` flag.
    pub async fn lookup(&self, aggregate: &AggregatedDetection) -> RegistryMatch {
        if let Some(result) = self.cache_get(&aggregate.composite_id).await {
            self.metrics.registry_cache_hits_total.inc();
            return result;
        }

        let timer = self.metrics.registry_lookup_latency_seconds.start_timer();
        let result = self.fetch(aggregate).await;
        timer.observe_duration();

        match result {
            Ok(matched) => {
                self.cache_put(&aggregate.composite_id, matched.clone()).await;
                matched
            }
            Err(e) => {
                warn!(
                    composite_id = %aggregate.composite_id,
                    "registry lookup failed, degrading to not-matched: {}", e
                );
                self.metrics
                    .errors_total
                    .with_label_values(&["registry"])
                    .inc();
                RegistryMatch::degraded()
            }
        }
    }

    async fn fetch(&self, aggregate: &AggregatedDetection) -> Result<RegistryMatch, CorrelatorError> {
        let url = format!("{}/api/v1/registry/match", self.base_url);
        let client = self.client.read().await.clone();
        let mut request = client.get(&url).query(&[
            ("composite_id", aggregate.composite_id.as_str()),
            ("host_id_hash", aggregate.host_id_hash.as_str()),
            ("port", &aggregate.port.to_string()),
            (
                "manifest_hash",
                aggregate.manifest_hash.as_deref().unwrap_or(""),
            ),
        ]);
        if !self.auth_token.is_empty() {
            request = request.bearer_auth(&self.auth_token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CorrelatorError::Registry(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CorrelatorError::Registry(format!(
                "registry returned {}",
                response.status()
            )));
        }
        let body: MatchResponse = response
            .json()
            .await
            .map_err(|e| CorrelatorError::Registry(e.to_string()))?;
        debug!(
            composite_id = %aggregate.composite_id,
            matched = body.matched,
            "registry match answered"
        );
        Ok(RegistryMatch {
            matched: body.matched,
            entry: body.entry,
            penalty: body.penalty,
            degraded: false,
        })
    }

    /// Replace the HTTP client, e.g. after certificate rotation.
    pub async fn rebuild_client(
        &self,
        identity: Option<reqwest::Identity>,
    ) -> Result<(), CorrelatorError> {
        let client = build_client(self.timeout, identity)?;
        *self.client.write().await = client;
        Ok(())
    }

    async fn cache_get(&self, composite_id: &str) -> Option<RegistryMatch> {
        let mut cache = self.cache.lock().await;
        match cache.get(composite_id) {
            Some(entry) if entry.stored_at.elapsed() < self.cache_ttl => {
                Some(entry.result.clone())
            }
            Some(_) => {
                cache.remove(composite_id);
                None
            }
            None => None,
        }
    }

    async fn cache_put(&self, composite_id: &str, result: RegistryMatch) {
        let mut cache = self.cache.lock().await;
        cache.insert(
            composite_id.to_string(),
            CacheEntry {
                stored_at: Instant::now(),
                result,
            },
        );
    }
}

fn build_client(
    timeout: Duration,
    identity: Option<reqwest::Identity>,
) -> Result<reqwest::Client, CorrelatorError> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(identity) = identity {
        builder = builder.identity(identity);
    }
    builder
        .build()
        .map_err(|e| CorrelatorError::Registry(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn aggregate() -> AggregatedDetection {
        let event = crate::DetectionEvent {
            source_type: crate::SourceType::Endpoint,
            source_id: "scanner-1".into(),
            timestamp: Utc::now(),
            host_id: "host-a".into(),
            port: 3000,
            manifest_hash: Some("m1".into()),
            process_signature: None,
            snippet: String::new(),
            details: serde_json::Value::Null,
        };
        AggregatedDetection::open(&event, chrono::Duration::seconds(300))
    }

    fn lookup_with_ttl(ttl: u64) -> RegistryLookup {
        let config = RegistryConfig {
            // nothing listens here; connections are refused immediately
            url: "http://127.0.0.1:1".into(),
            auth_token: "token".into(),
            timeout_seconds: 1,
            cache_ttl_seconds: ttl,
            tls: None,
        };
        RegistryLookup::new(&config, None, Arc::new(Metrics::unregistered())).unwrap()
    }

    #[tokio::test]
    async fn test_outage_degrades_to_not_matched() {
        let lookup = lookup_with_ttl(30);
        let result = lookup.lookup(&aggregate()).await;
        assert!(!result.matched);
        assert!(result.degraded);
        assert_eq!(result.penalty, 0);
    }

    #[tokio::test]
    async fn test_degraded_results_are_not_cached() {
        let lookup = lookup_with_ttl(30);
        let aggregate = aggregate();
        lookup.lookup(&aggregate).await;
        assert!(lookup.cache_get(&aggregate.composite_id).await.is_none());
    }

    #[tokio::test]
    async fn test_cache_hit_within_ttl() {
        let lookup = lookup_with_ttl(30);
        let matched = RegistryMatch {
            matched: true,
            entry: Some(serde_json::json!({"name": "approved-mcp"})),
            penalty: -6,
            degraded: false,
        };
        lookup.cache_put("abc", matched).await;
        let hit = lookup.cache_get("abc").await.unwrap();
        assert!(hit.matched);
        assert_eq!(hit.penalty, -6);
    }

    #[tokio::test]
    async fn test_cache_expires_after_ttl() {
        let lookup = lookup_with_ttl(0);
        let matched = RegistryMatch {
            matched: true,
            entry: None,
            penalty: -6,
            degraded: false,
        };
        lookup.cache_put("abc", matched).await;
        assert!(lookup.cache_get("abc").await.is_none());
    }

    #[test]
    fn test_match_response_shape() {
        let body: MatchResponse =
            serde_json::from_str(r#"{"matched": true, "entry": {"owner": "ops"}, "penalty": -6}"#)
                .unwrap();
        assert!(body.matched);
        assert_eq!(body.penalty, -6);

        // entry and penalty are optional
        let body: MatchResponse = serde_json::from_str(r#"{"matched": false}"#).unwrap();
        assert!(!body.matched);
        assert_eq!(body.penalty, 0);
        assert!(body.entry.is_none());
    }
}
