use animator_service::config::Config;
use animator_service::{
    start_api_server, AppState, Checkout, Migrator, OpenAiTransformer, PgJobStore, Processor,
    ProcessorSettings, S3Gateway, StripeClient, WebhookVerifier,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Slack above the upload limit so oversized bodies reach validation
const UPLOAD_BODY_SLACK: usize = 64 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Animator Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let store = Arc::new(
        PgJobStore::new(&config.database)
            .await
            .context("Failed to initialize job store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let blobs = Arc::new(S3Gateway::new(&config.storage).await);

    let transformer = Arc::new(
        OpenAiTransformer::new(&config.transform)
            .context("Failed to initialize image transformer")?,
    );

    let payments = Arc::new(
        StripeClient::new(&config.payments).context("Failed to initialize payment client")?,
    );

    let webhook = match config.payments.webhook_secret {
        Some(ref secret) if !secret.is_empty() => Some(WebhookVerifier::new(
            secret.clone(),
            Duration::from_secs(config.payments.webhook_tolerance_secs),
        )),
        _ => {
            warn!("No webhook secret configured, payment webhooks will be rejected");
            None
        }
    };

    // Create API state
    let api_state = AppState {
        processor: Arc::new(Processor::new(
            store.clone(),
            blobs.clone(),
            transformer,
            ProcessorSettings::from_config(&config),
        )),
        checkout: Arc::new(Checkout::new(store.clone(), payments, blobs)),
        migrator: Arc::new(Migrator::new(store.clone(), config.migration.max_batch)),
        store,
        webhook,
        upload_body_limit: config.uploads.max_bytes + UPLOAD_BODY_SLACK,
    };

    let shutdown = CancellationToken::new();

    // Spawn API server task
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Animator service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down animator service");

    // Let in-flight requests drain
    shutdown.cancel();
    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task panicked");
    }

    info!("Animator service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
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
