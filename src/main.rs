//! Postgres metrics log drain server

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pgstats_drain::{
    config::{Config, LoggingConfig},
    store::redact_url,
    IngestMetrics, Ingestor, LogReceiver, MetricStore, PgMetricStore,
};

#[derive(Parser, Debug)]
#[command(name = "pgstats_drain", version, about = "Postgres metrics log drain")]
struct Cli {
    /// Configuration file (TOML or YAML)
    #[arg(short, long, env = "DRAIN_CONFIG_PATH")]
    config: Option<String>,
}

fn init_tracing(logging: &LoggingConfig) {
    let default_filter = if logging.debug {
        "pgstats_drain=debug,tower_http=debug"
    } else {
        "pgstats_drain=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration with environment variable overrides
    let config = Config::load_with_overrides(cli.config.as_deref())?;
    init_tracing(&config.logging);

    info!("Starting Postgres metrics log drain");
    info!("Server will listen on: {}", config.server.bind_address);
    info!("Metrics database: {}", redact_url(&config.storage.database_url));

    let store = Arc::new(
        PgMetricStore::connect_lazy(&config.storage).context("Failed to configure metrics database")?,
    );
    match store.ping().await {
        Ok(()) => info!("Metrics database reachable"),
        Err(e) => warn!("Metrics database not reachable yet, continuing: {}", e),
    }

    let metrics = Arc::new(IngestMetrics::new().context("Failed to register ingestion metrics")?);
    let ingestor = Arc::new(Ingestor::from_config(&config.ingest, store, metrics));
    if ingestor.routes().is_empty() {
        warn!("No sources configured; every metric record will be dropped");
    } else {
        info!("Routing {} sources to tenants", ingestor.routes().len());
    }

    let bind_address = config.server.bind_address;
    let receiver = LogReceiver::new(Arc::new(config), ingestor);
    let app = receiver.create_router();

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    info!("HTTP server listening on {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("Unable to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal, gracefully shutting down...");
}
