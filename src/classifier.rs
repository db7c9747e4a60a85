//! LLM-gateway classifier client
//!
//! Used only by the retrospective scorer: a health probe that gates each
//! re-scoring tick and the classification call itself.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::config::ClassifierConfig;
use crate::{AggregatedDetection, CorrelatorError};

/// Classifier verdict for one aggregate.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierVerdict {
    pub classification: String,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub score_contribution: i64,
}

pub struct ClassifierClient {
    client: reqwest::Client,
    base_url: String,
}

impl ClassifierClient {
    pub fn new(config: &ClassifierConfig) -> Result<Self, CorrelatorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| CorrelatorError::Classifier(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn health(&self) -> Result<(), CorrelatorError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CorrelatorError::Classifier(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(CorrelatorError::Classifier(format!(
                "health returned {}",
                response.status()
            )))
        }
    }

    pub async fn classify(
        &self,
        aggregate: &AggregatedDetection,
    ) -> Result<ClassifierVerdict, CorrelatorError> {
        let url = format!("{}/classify", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(aggregate)
            .send()
            .await
            .map_err(|e| CorrelatorError::Classifier(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CorrelatorError::Classifier(format!(
                "classify returned {}",
                response.status()
            )));
        }
        let verdict: ClassifierVerdict = response
            .json()
            .await
            .map_err(|e| CorrelatorError::Classifier(e.to_string()))?;
        debug!(
            composite_id = %aggregate.composite_id,
            classification = %verdict.classification,
            confidence = verdict.confidence,
            "classifier answered"
        );
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_shape() {
        let verdict: ClassifierVerdict = serde_json::from_str(
            r#"{"classification": "unauthorized", "confidence": 0.93,
                "reasoning": "no manifest on record", "score_contribution": 5}"#,
        )
        .unwrap();
        assert_eq!(verdict.classification, "unauthorized");
        assert_eq!(verdict.score_contribution, 5);

        // reasoning and contribution are optional
        let verdict: ClassifierVerdict =
            serde_json::from_str(r#"{"classification": "suspect", "confidence": 0.5}"#).unwrap();
        assert_eq!(verdict.score_contribution, 0);
    }

    #[tokio::test]
    async fn test_unreachable_classifier_errors() {
        let config = ClassifierConfig {
            url: "http://127.0.0.1:1".into(),
            timeout_seconds: 1,
        };
        let client = ClassifierClient::new(&config).unwrap();
        assert!(client.health().await.is_err());
    }
}
