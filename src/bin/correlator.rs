use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use prometheus::Registry;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mcp_correlator::config::CorrelatorConfig;
use mcp_correlator::observability::{start_health_server, start_metrics_server, HealthState};
use mcp_correlator::scorer::Scorer;
use mcp_correlator::tls::{spawn_material_watcher, TlsMaterial};
use mcp_correlator::{
    ClassifierClient, Correlator, Ingestor, Janitor, Metrics, Persister, Pipeline,
    RegistryLookup, RetrospectiveScorer,
};

#[derive(Parser, Debug)]
#[command(name = "correlator", about = "MCP detection correlation and scoring engine")]
struct Args {
    /// Correlator configuration file
    #[arg(long, default_value = "config/correlator.toml")]
    config: PathBuf,

    /// Shared global configuration file, layered beneath the correlator file
    #[arg(long)]
    global_config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = CorrelatorConfig::load(args.global_config.as_deref(), &args.config)
        .context("loading configuration")?;
    if args.check_config {
        println!("configuration ok");
        return Ok(());
    }

    info!(
        "starting correlator: window={}s bus={} registry={} store={}",
        config.dedup_window_seconds, config.bus.url, config.registry.url, config.analytics.url
    );

    let prometheus_registry = Registry::new();
    let metrics = Arc::new(Metrics::new(&prometheus_registry).context("metrics init")?);

    // Optional mTLS transport towards the registry
    let tls_identity = match &config.registry.tls {
        Some(tls) => {
            let material = TlsMaterial::load(&tls.cert_path, &tls.key_path)?;
            info!("mTLS enabled, certificate valid until {}", material.not_after());
            Some(material.identity())
        }
        None => None,
    };
    let registry_lookup = Arc::new(RegistryLookup::new(
        &config.registry,
        tls_identity,
        Arc::clone(&metrics),
    )?);
    let _cert_watcher = match &config.registry.tls {
        Some(tls) => Some(spawn_material_watcher(
            tls.cert_path.clone(),
            tls.key_path.clone(),
            Arc::clone(&registry_lookup),
        )?),
        None => None,
    };

    let persister = Arc::new(Persister::new(&config.analytics, Arc::clone(&metrics))?);
    if !persister.health_check().await {
        anyhow::bail!("analytics store at {} is not reachable", config.analytics.url);
    }

    let correlator = Arc::new(Correlator::new(
        config.window_width(),
        config.scoring_weights.clone(),
        Arc::clone(&metrics),
    ));
    let scorer = Scorer::new(
        config.scoring_weights.clone(),
        config.thresholds.clone(),
        config.registry_penalty,
    );
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&correlator),
        Arc::clone(&registry_lookup),
        scorer.clone(),
        Arc::clone(&persister),
        Arc::clone(&metrics),
    ));

    let ingestor = Ingestor::new(
        Arc::clone(&pipeline),
        config.bus.clone(),
        config.ingest.clone(),
        Arc::clone(&metrics),
    );
    let ingest_stats = ingestor.stats();

    let metrics_addr: SocketAddr = ([0, 0, 0, 0], config.metrics_port).into();
    start_metrics_server(metrics_addr, prometheus_registry).await?;
    let health_addr: SocketAddr = ([0, 0, 0, 0], config.health_port).into();
    start_health_server(
        health_addr,
        HealthState {
            persister: Arc::clone(&persister),
            ingest_stats,
            correlator: Arc::clone(&correlator),
            started_at: Instant::now(),
        },
    )
    .await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let janitor = Janitor::new(
        Arc::clone(&pipeline),
        Duration::from_secs(config.janitor_interval_seconds),
    );
    let janitor_handle = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move { janitor.run(shutdown_rx).await }
    });

    let retrospective = RetrospectiveScorer::new(
        Arc::new(ClassifierClient::new(&config.classifier)?),
        Arc::clone(&persister),
        scorer,
        Arc::clone(&metrics),
        Duration::from_secs(config.retrospective.interval_seconds),
        Duration::from_secs(config.retrospective.horizon_seconds),
        config.retrospective.batch_limit,
    );
    let retrospective_handle = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move { retrospective.run(shutdown_rx).await }
    });

    let mut ingest_handle = tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move { ingestor.run(&shutdown_tx).await }
    });

    info!("✅ correlator running");

    let drain = Duration::from_secs(config.ingest.drain_seconds);
    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        result = &mut ingest_handle => {
            let _ = shutdown_tx.send(());
            match result {
                Ok(Ok(())) => false,
                Ok(Err(e)) => {
                    error!("ingestor failed: {}", e);
                    anyhow::bail!("ingestor failed: {}", e);
                }
                Err(e) => {
                    error!("ingestor panicked: {}", e);
                    anyhow::bail!("ingestor panicked: {}", e);
                }
            }
        }
    };

    if interrupted {
        info!("shutdown signal received, draining up to {:?}", drain);
        let _ = shutdown_tx.send(());
        let _ = tokio::time::timeout(drain, async {
            let _ = (&mut ingest_handle).await;
            let _ = janitor_handle.await;
            let _ = retrospective_handle.await;
        })
        .await;
    }

    info!("correlator stopped");
    Ok(())
}
