//! Window garbage collection
//!
//! Periodically evicts aggregates whose window has closed and drains them
//! through the scoring and persistence path, so every aggregate reaches the
//! store within one cadence of its window end even when no more events
//! arrive for it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::Pipeline;

pub struct Janitor {
    pipeline: Arc<Pipeline>,
    interval: Duration,
}

impl Janitor {
    pub fn new(pipeline: Arc<Pipeline>, interval: Duration) -> Self {
        Self { pipeline, interval }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        // the first tick fires immediately; skip it
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("janitor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    pub async fn sweep(&self) {
        let expired = self
            .pipeline
            .correlator()
            .cleanup_expired(Utc::now())
            .await;
        if expired.is_empty() {
            return;
        }
        debug!("janitor draining {} expired aggregates", expired.len());
        self.pipeline.finalize_expired(expired).await;
    }
}
