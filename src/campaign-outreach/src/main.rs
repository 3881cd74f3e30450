//! Campaign Outreach: multi-step lead outreach sequencing engine.
//!
//! Main entry point that wires the store, journey engine, dispatcher and
//! REST API, then runs the scheduler loop alongside the HTTP server.

use campaign_core::config::AppConfig;
use campaign_core::event_bus::{EventSink, LogSink};
use campaign_core::{Clock, MemoryStore, SystemClock};
use campaign_delivery::{ActionDispatcher, DryRunDriver};
use campaign_journey::JourneyEngine;
use campaign_management::{outreach_router, CampaignController, OutreachState};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "campaign-outreach")]
#[command(about = "Multi-step lead outreach sequencing engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "CAMPAIGN_OUTREACH__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "CAMPAIGN_OUTREACH__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Metrics port (overrides config)
    #[arg(long, env = "CAMPAIGN_OUTREACH__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// Scheduler tick in milliseconds (overrides config)
    #[arg(long, env = "CAMPAIGN_OUTREACH__ENGINE__TICK_INTERVAL_MS")]
    tick_interval_ms: Option<u64>,

    /// Serve the API without running the scheduler loop
    #[arg(long, default_value_t = false)]
    api_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "campaign_outreach=info,campaign_journey=info,campaign_delivery=info,campaign_management=info,tower_http=info"
                    .into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Campaign Outreach starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }
    if let Some(ms) = cli.tick_interval_ms {
        config.engine.tick_interval_ms = ms;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        tick_interval_ms = config.engine.tick_interval_ms,
        quota_scope = ?config.dispatcher.quota_scope,
        on_condition_timeout = ?config.engine.on_condition_timeout,
        "Configuration loaded"
    );

    if let Err(e) = start_metrics(&config) {
        error!(error = %e, "Failed to start metrics exporter");
    }

    let store = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let events: Arc<dyn EventSink> = Arc::new(LogSink);

    let engine = Arc::new(
        JourneyEngine::new(store, clock.clone(), config.engine.clone()).with_event_sink(events.clone()),
    );
    let dispatcher = Arc::new(ActionDispatcher::new(
        engine.clone(),
        Arc::new(DryRunDriver),
        config.dispatcher.clone(),
    ));
    let controller =
        Arc::new(CampaignController::new(engine.clone(), dispatcher.clone()).with_event_sink(events));
    controller.restore();

    if cli.api_only {
        info!("Running in API-only mode (no scheduler)");
    } else {
        let tick = Duration::from_millis(config.engine.tick_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                let now = clock.now();

                let report = engine.tick(now);
                if report.errors > 0 {
                    warn!(errors = report.errors, "Scheduler tick had journey errors");
                }
                if let Err(e) = dispatcher.recover_interrupted(now) {
                    error!(error = %e, "Interrupted-action recovery failed");
                }
                if let Err(e) = dispatcher.dispatch_due().await {
                    error!(error = %e, "Dispatch pass failed");
                }
            }
        });
    }

    let app = outreach_router(OutreachState { controller })
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::new(config.api.host.parse()?, config.api.http_port);
    info!(addr = %addr, "Campaign Outreach is ready to serve traffic");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn start_metrics(config: &AppConfig) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(SocketAddr::new(config.api.host.parse()?, config.metrics.port))
        .install()?;
    info!(port = config.metrics.port, "Metrics exporter started");
    Ok(())
}
