use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use merge_service::{
    api, shutdown_signal, Config, DynamoGroupStore, GroupStore, ObjectStore, S3ObjectStore,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting merge service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Shared AWS SDK configuration (S3 and DynamoDB)
    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(config.s3.region.clone()))
        .load()
        .await;

    let objects: Arc<dyn ObjectStore> =
        Arc::new(S3ObjectStore::new(&sdk_config, &config.s3));
    let groups: Arc<dyn GroupStore> =
        Arc::new(DynamoGroupStore::new(&sdk_config, &config.dynamodb));

    let state = api::build_state(&config, groups, objects);

    info!(
        valid_bucket = %config.s3.valid_bucket,
        output_bucket = %config.s3.output_bucket,
        table = %config.dynamodb.table_name,
        "Merge service started successfully"
    );

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::start_api_server(state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down merge service");

    api_handle.abort();

    info!("Merge service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

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
