//! Layered configuration
//!
//! A shared global file, a correlator-specific file on top, then environment
//! variables (prefix `MCP`, `__` separator) so tokens and secrets never have
//! to live on disk. Validation happens at load; an invalid configuration is
//! fatal at boot.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::scorer::{Thresholds, WeightTable};
use crate::CorrelatorError;

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_url")]
    pub url: String,
    /// JetStream stream holding the three detection subjects.
    #[serde(default = "default_stream")]
    pub stream: String,
    /// Durable consumer family name; per-subject durables derive from it so
    /// multiple instances share non-overlapping subsets.
    #[serde(default = "default_durable")]
    pub durable: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: default_bus_url(),
            stream: default_stream(),
            durable: default_durable(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_seconds: u64,
    /// How long in-flight messages may drain after the shutdown signal.
    #[serde(default = "default_drain")]
    pub drain_seconds: u64,
    #[serde(default = "default_ack_wait")]
    pub ack_wait_seconds: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            fetch_timeout_seconds: default_fetch_timeout(),
            drain_seconds: default_drain(),
            ack_wait_seconds: default_ack_wait(),
        }
    }
}

/// Client certificate material for the optional mTLS registry transport.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_url")]
    pub url: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_registry_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
            auth_token: String::new(),
            timeout_seconds: default_registry_timeout(),
            cache_ttl_seconds: default_cache_ttl(),
            tls: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_classifier_url")]
    pub url: String,
    #[serde(default = "default_classifier_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            url: default_classifier_url(),
            timeout_seconds: default_classifier_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default = "default_analytics_url")]
    pub url: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_pool_max")]
    pub pool_max_connections: usize,
    #[serde(default = "default_pool_idle")]
    pub pool_max_idle: usize,
    #[serde(default = "default_pool_lifetime")]
    pub pool_idle_timeout_seconds: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_seconds: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            url: default_analytics_url(),
            database: default_database(),
            table: default_table(),
            username: String::new(),
            password: String::new(),
            pool_max_connections: default_pool_max(),
            pool_max_idle: default_pool_idle(),
            pool_idle_timeout_seconds: default_pool_lifetime(),
            write_timeout_seconds: default_write_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrospectiveConfig {
    #[serde(default = "default_retro_interval")]
    pub interval_seconds: u64,
    /// Only detections younger than this are candidates for re-scoring.
    #[serde(default = "default_retro_horizon")]
    pub horizon_seconds: u64,
    #[serde(default = "default_retro_limit")]
    pub batch_limit: usize,
}

impl Default for RetrospectiveConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_retro_interval(),
            horizon_seconds: default_retro_horizon(),
            batch_limit: default_retro_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorrelatorConfig {
    #[serde(default = "default_window")]
    pub dedup_window_seconds: u64,
    #[serde(default)]
    pub scoring_weights: WeightTable,
    #[serde(default = "default_penalty")]
    pub registry_penalty: i64,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_seconds: u64,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub retrospective: RetrospectiveConfig,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            dedup_window_seconds: default_window(),
            scoring_weights: WeightTable::default(),
            registry_penalty: default_penalty(),
            thresholds: Thresholds::default(),
            janitor_interval_seconds: default_janitor_interval(),
            bus: BusConfig::default(),
            ingest: IngestConfig::default(),
            registry: RegistryConfig::default(),
            classifier: ClassifierConfig::default(),
            analytics: AnalyticsConfig::default(),
            retrospective: RetrospectiveConfig::default(),
            metrics_port: default_metrics_port(),
            health_port: default_health_port(),
        }
    }
}

impl CorrelatorConfig {
    /// Load the layered configuration: optional global file, correlator file,
    /// then `MCP__*` environment overrides.
    pub fn load(global: Option<&Path>, correlator: &Path) -> Result<Self, CorrelatorError> {
        let mut builder = config::Config::builder();
        if let Some(global) = global {
            builder = builder.add_source(config::File::from(global).required(false));
        }
        let settings = builder
            .add_source(config::File::from(correlator).required(true))
            .add_source(config::Environment::with_prefix("MCP").separator("__"))
            .build()
            .map_err(|e| CorrelatorError::Config(e.to_string()))?;

        let loaded: CorrelatorConfig = settings
            .try_deserialize()
            .map_err(|e| CorrelatorError::Config(e.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), CorrelatorError> {
        if self.dedup_window_seconds == 0 {
            return Err(CorrelatorError::Config(
                "dedup_window_seconds must be positive".into(),
            ));
        }
        if self.scoring_weights.endpoint == 0 {
            return Err(CorrelatorError::Config(
                "scoring_weights.endpoint must be positive".into(),
            ));
        }
        if self.registry_penalty > 0 {
            return Err(CorrelatorError::Config(
                "registry_penalty must be non-positive".into(),
            ));
        }
        if self.thresholds.authorized >= self.thresholds.suspect {
            return Err(CorrelatorError::Config(
                "thresholds.authorized must be below thresholds.suspect".into(),
            ));
        }
        if self.janitor_interval_seconds == 0 || self.retrospective.interval_seconds == 0 {
            return Err(CorrelatorError::Config(
                "task cadences must be positive".into(),
            ));
        }
        if self.ingest.batch_size == 0 {
            return Err(CorrelatorError::Config("ingest.batch_size must be positive".into()));
        }
        for (name, url) in [
            ("bus.url", &self.bus.url),
            ("registry.url", &self.registry.url),
            ("classifier.url", &self.classifier.url),
            ("analytics.url", &self.analytics.url),
        ] {
            if url.is_empty() {
                return Err(CorrelatorError::Config(format!("{} is required", name)));
            }
        }
        Ok(())
    }

    pub fn window_width(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dedup_window_seconds as i64)
    }
}

fn default_window() -> u64 {
    300
}
fn default_penalty() -> i64 {
    -6
}
fn default_janitor_interval() -> u64 {
    60
}
fn default_bus_url() -> String {
    "nats://127.0.0.1:4222".into()
}
fn default_stream() -> String {
    "DETECTIONS".into()
}
fn default_durable() -> String {
    "correlator".into()
}
fn default_batch_size() -> usize {
    10
}
fn default_fetch_timeout() -> u64 {
    2
}
fn default_drain() -> u64 {
    5
}
fn default_ack_wait() -> u64 {
    30
}
fn default_registry_url() -> String {
    "http://127.0.0.1:8081".into()
}
fn default_registry_timeout() -> u64 {
    10
}
fn default_cache_ttl() -> u64 {
    30
}
fn default_classifier_url() -> String {
    "http://127.0.0.1:8082".into()
}
fn default_classifier_timeout() -> u64 {
    10
}
fn default_analytics_url() -> String {
    "http://127.0.0.1:8123".into()
}
fn default_database() -> String {
    "mcp".into()
}
fn default_table() -> String {
    "detections".into()
}
fn default_pool_max() -> usize {
    20
}
fn default_pool_idle() -> usize {
    10
}
fn default_pool_lifetime() -> u64 {
    1800
}
fn default_write_timeout() -> u64 {
    10
}
fn default_retro_interval() -> u64 {
    600
}
fn default_retro_horizon() -> u64 {
    86_400
}
fn default_retro_limit() -> usize {
    100
}
fn default_metrics_port() -> u16 {
    9464
}
fn default_health_port() -> u16 {
    8088
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = CorrelatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dedup_window_seconds, 300);
        assert_eq!(config.registry_penalty, -6);
        assert_eq!(config.thresholds.authorized, 4);
        assert_eq!(config.thresholds.suspect, 8);
        assert_eq!(config.ingest.batch_size, 10);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = CorrelatorConfig::default();
        config.registry_penalty = 2;
        assert!(config.validate().is_err());

        let mut config = CorrelatorConfig::default();
        config.dedup_window_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = CorrelatorConfig::default();
        config.thresholds.authorized = 9;
        assert!(config.validate().is_err());

        let mut config = CorrelatorConfig::default();
        config.scoring_weights.endpoint = 0;
        assert!(config.validate().is_err());

        let mut config = CorrelatorConfig::default();
        config.bus.url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_layered_load_correlator_overrides_global() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.toml");
        let local = dir.path().join("correlator.toml");

        let mut f = std::fs::File::create(&global).unwrap();
        writeln!(f, "dedup_window_seconds = 120").unwrap();
        writeln!(f, "[bus]").unwrap();
        writeln!(f, "url = \"nats://bus.internal:4222\"").unwrap();

        let mut f = std::fs::File::create(&local).unwrap();
        writeln!(f, "dedup_window_seconds = 600").unwrap();
        writeln!(f, "[scoring_weights]").unwrap();
        writeln!(f, "endpoint = 13").unwrap();
        writeln!(f, "judge = 5").unwrap();
        writeln!(f, "network = 3").unwrap();

        let config = CorrelatorConfig::load(Some(&global), &local).unwrap();
        assert_eq!(config.dedup_window_seconds, 600);
        assert_eq!(config.bus.url, "nats://bus.internal:4222");
        assert_eq!(config.scoring_weights.endpoint, 13);
        // untouched keys keep defaults
        assert_eq!(config.registry.cache_ttl_seconds, 30);
    }

    #[test]
    fn test_missing_correlator_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(CorrelatorConfig::load(None, &missing).is_err());
    }
}
