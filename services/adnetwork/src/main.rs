use adnetwork::config::{Config, PollSource, ServiceConfig};
use adnetwork::{
    open_sink, AppState, AuctionEngine, BatchSource, HttpBatchSource, IngestServer,
    IngestionEndpoint, IngestionPoller, LocalBatchSource,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    init_tracing(&config.service);

    info!(service = %config.service.name, "Starting Ad Network Service");

    if config.service.metrics_port != 0 {
        init_metrics(config.service.metrics_port)?;
    }

    let catalog = config.catalog()?;
    let selection = config.sink()?;
    let sink = open_sink(&selection, &catalog)
        .await
        .context("Failed to initialize bid sink")?;

    // Ingestion endpoint
    let endpoint = IngestionEndpoint::default();
    let state = AppState {
        endpoint: endpoint.clone(),
        service_name: Arc::from(config.service.name.as_str()),
    };
    let server = IngestServer::bind(state, &config.input.service).await?;
    let bound_addr = server.local_addr();

    let source: Box<dyn BatchSource> = match config.poller.source {
        PollSource::Local => Box::new(LocalBatchSource::new(endpoint)),
        PollSource::Http => Box::new(
            HttpBatchSource::new(bound_addr, config.poller.read_timeout())
                .context("Failed to build HTTP batch source")?,
        ),
    };

    let mut poller = IngestionPoller::new(
        source,
        AuctionEngine::new(catalog),
        sink,
        config.poller.interval(),
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let mut server_shutdown = shutdown_tx.subscribe();
    let server_handle = tokio::spawn(server.run(async move {
        let _ = server_shutdown.recv().await;
    }));

    let poller_shutdown = shutdown_tx.subscribe();
    let mut poller_handle = tokio::spawn(async move { poller.run(poller_shutdown).await });

    info!(address = %bound_addr, "Ad network service started successfully");

    // Wait for a shutdown signal, or for the poller to stop on its own
    let poller_result = tokio::select! {
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            (&mut poller_handle).await
        }
        result = &mut poller_handle => {
            let _ = shutdown_tx.send(());
            result
        }
    };

    info!("Shutting down ad network service");

    if let Err(e) = server_handle.await.context("Ingestion server task panicked")? {
        error!(error = %e, "Ingestion server error");
    }

    poller_result
        .context("Poller task panicked")?
        .context("Ingestion poller stopped")?;

    info!("Ad network service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(service: &ServiceConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&service.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if service.log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
