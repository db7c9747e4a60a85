//! Bus ingestion
//!
//! One worker task per subject pulls batches from a durable JetStream
//! consumer and pushes each event through the pipeline. Manual
//! acknowledgement: ack only after the persister succeeded, nack on
//! retryable failures so the bus redelivers, ack-and-drop malformed
//! payloads that redelivery cannot fix.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, AckKind};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::{BusConfig, IngestConfig};
use crate::metrics::Metrics;
use crate::{CorrelatorError, DetectionEvent, Pipeline};

/// The three detection subjects, in the order their workers are spawned.
pub const SUBJECTS: [&str; 3] = ["endpoint.events", "network.events", "gateway.events"];

/// Ingest counters for the `/stats` snapshot.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub processed: AtomicU64,
    pub acked: AtomicU64,
    pub nacked: AtomicU64,
    pub dropped: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestStatsSnapshot {
    pub processed: u64,
    pub acked: u64,
    pub nacked: u64,
    pub dropped: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

pub struct Ingestor {
    pipeline: Arc<Pipeline>,
    bus: BusConfig,
    ingest: IngestConfig,
    metrics: Arc<Metrics>,
    stats: Arc<IngestStats>,
}

impl Ingestor {
    pub fn new(
        pipeline: Arc<Pipeline>,
        bus: BusConfig,
        ingest: IngestConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pipeline,
            bus,
            ingest,
            metrics,
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Durable name for one subject's consumer. Instances sharing these names
    /// receive non-overlapping subsets from the bus.
    pub fn durable_name(prefix: &str, subject: &str) -> String {
        let short = subject.split('.').next().unwrap_or(subject);
        format!("{}-{}", prefix, short)
    }

    /// Connect, ensure the stream and consumers exist, then run one worker
    /// per subject until the shutdown signal fires.
    pub async fn run(&self, shutdown: &broadcast::Sender<()>) -> Result<(), CorrelatorError> {
        let client = async_nats::connect(&self.bus.url)
            .await
            .map_err(|e| CorrelatorError::Bus(e.to_string()))?;
        info!("connected to bus at {}", self.bus.url);

        let context = jetstream::new(client);
        let stream = context
            .get_or_create_stream(jetstream::stream::Config {
                name: self.bus.stream.clone(),
                subjects: SUBJECTS.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            })
            .await
            .map_err(|e| CorrelatorError::Bus(e.to_string()))?;

        let mut workers = Vec::new();
        for subject in SUBJECTS {
            let durable = Self::durable_name(&self.bus.durable, subject);
            let consumer = stream
                .get_or_create_consumer(
                    &durable,
                    pull::Config {
                        durable_name: Some(durable.clone()),
                        filter_subject: subject.to_string(),
                        ack_policy: AckPolicy::Explicit,
                        ack_wait: Duration::from_secs(self.ingest.ack_wait_seconds),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| CorrelatorError::Bus(e.to_string()))?;

            let pipeline = Arc::clone(&self.pipeline);
            let metrics = Arc::clone(&self.metrics);
            let stats = Arc::clone(&self.stats);
            let ingest = self.ingest.clone();
            let mut shutdown_rx = shutdown.subscribe();
            let subject = subject.to_string();

            workers.push(tokio::spawn(async move {
                info!("ingest worker started for {}", subject);
                loop {
                    let fetch = consumer
                        .fetch()
                        .max_messages(ingest.batch_size)
                        .expires(Duration::from_secs(ingest.fetch_timeout_seconds))
                        .messages();
                    let batch = tokio::select! {
                        _ = shutdown_rx.recv() => {
                            info!("ingest worker for {} stopping", subject);
                            break;
                        }
                        batch = fetch => batch,
                    };
                    let mut batch = match batch {
                        Ok(batch) => batch,
                        Err(e) => {
                            warn!("batch fetch on {} failed: {}", subject, e);
                            metrics.errors_total.with_label_values(&["bus"]).inc();
                            tokio::time::sleep(Duration::from_secs(2)).await;
                            continue;
                        }
                    };
                    // Sequential within the batch to preserve per-target order
                    while let Some(message) = batch.next().await {
                        match message {
                            Ok(message) => {
                                Self::handle_message(&pipeline, &metrics, &stats, message).await;
                            }
                            Err(e) => {
                                warn!("message on {} failed: {}", subject, e);
                                metrics.errors_total.with_label_values(&["bus"]).inc();
                                break;
                            }
                        }
                    }
                }
            }));
        }

        for worker in workers {
            if let Err(e) = worker.await {
                error!("ingest worker panicked: {}", e);
            }
        }
        Ok(())
    }

    async fn handle_message(
        pipeline: &Pipeline,
        metrics: &Metrics,
        stats: &IngestStats,
        message: jetstream::Message,
    ) {
        stats.processed.fetch_add(1, Ordering::Relaxed);

        let event = match DetectionEvent::decode(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                // Redelivery cannot fix malformed bytes: ack and drop
                warn!("dropping malformed event: {}", e);
                metrics
                    .errors_total
                    .with_label_values(&[e.counter_label()])
                    .inc();
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                Self::ack(&message, metrics).await;
                return;
            }
        };

        match pipeline.handle_event(&event).await {
            Ok(()) => {
                stats.acked.fetch_add(1, Ordering::Relaxed);
                Self::ack(&message, metrics).await;
            }
            Err(e) if e.is_retryable() => {
                debug!("nacking event for redelivery: {}", e);
                stats.nacked.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = message.ack_with(AckKind::Nak(None)).await {
                    warn!("nack failed: {}", e);
                    metrics.errors_total.with_label_values(&["bus"]).inc();
                }
            }
            Err(e) => {
                warn!("dropping event after non-retryable failure: {}", e);
                metrics
                    .errors_total
                    .with_label_values(&[e.counter_label()])
                    .inc();
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                Self::ack(&message, metrics).await;
            }
        }
    }

    async fn ack(message: &jetstream::Message, metrics: &Metrics) {
        if let Err(e) = message.ack().await {
            warn!("ack failed: {}", e);
            metrics.errors_total.with_label_values(&["bus"]).inc();
        }
    }
}
