use anyhow::{Context, Result};
use plate_importer::config::ServiceConfig;
use plate_importer::orchestrator::WorkerStats;
use plate_importer::{
    AlprCommand, CameraDirectory, Config, FileCheckpointStore, FsImageStore, HttpUploader,
    PgCaptureSource, PipelineComponents, PipelineOrchestrator, RetryPolicy, VehicleClassifier,
    VehicleCommand, WorkerSettings,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service)?;

    config.validate().context("Invalid configuration")?;

    info!(
        service = %config.service.name,
        cameras = config.cameras.len(),
        upload_url = %config.upload.url,
        "Starting plate importer"
    );

    // Initialize metrics
    if config.service.metrics_port != 0 {
        init_metrics(config.service.metrics_port)?;
    }

    let shutdown = CancellationToken::new();

    // Initialize components
    let checkpoints = Arc::new(
        FileCheckpointStore::open(&config.pipeline.checkpoint_path)
            .await
            .context("Failed to open checkpoint store")?,
    );

    let source = Arc::new(
        PgCaptureSource::connect_lazy(&config.database)
            .context("Failed to create capture store pool")?,
    );

    let image_retry = RetryPolicy::new(
        config.images.max_attempts,
        config.images.retry_initial(),
        config.images.retry_initial() * 8,
    );
    let images = Arc::new(
        FsImageStore::new(config.images.base_path.clone(), image_retry)
            .with_share_marker(config.images.share_marker.clone())
            .with_shutdown(shutdown.clone()),
    );

    let recognizer = Arc::new(AlprCommand::new(config.recognition.clone()));
    recognizer
        .check()
        .await
        .context("Recognition engine is not usable")?;

    let classifier = config.vehicle.clone().map(|vehicle| {
        info!(command = %vehicle.command, "Vehicle classification enabled");
        Arc::new(VehicleCommand::new(vehicle, config.recognition.country.clone()))
            as Arc<dyn VehicleClassifier>
    });

    let directory = Arc::new(CameraDirectory::new(&config.cameras));
    if directory.is_empty() {
        warn!("No camera profiles configured, every event will be skipped");
    }

    let uploader = Arc::new(
        HttpUploader::new(&config.upload)
            .context("Failed to initialize HTTP uploader")?
            .with_shutdown(shutdown.clone()),
    );

    let components = PipelineComponents {
        source,
        images,
        recognizer,
        directory,
        uploader,
        checkpoints,
        classifier,
        agent_uid: config.upload.agent_uid.clone(),
    };

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        components,
        WorkerSettings::from(&config.pipeline),
        shutdown.clone(),
    ));

    // Spawn camera workers
    let pipeline_handle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run().await })
    };

    info!("Plate importer started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down, finishing in-flight events");
    shutdown.cancel();

    if let Err(e) = pipeline_handle.await {
        error!(error = %e, "Pipeline task failed");
    }

    print_final_stats(&orchestrator.stats());

    info!("Plate importer stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(config: &ServiceConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid log level")?;

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if config.log_format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
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
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
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

/// Log per-camera totals at shutdown
fn print_final_stats(stats: &BTreeMap<String, WorkerStats>) {
    info!("=== Final Statistics ===");
    for (camera, s) in stats {
        info!(
            camera = %camera,
            passes = s.passes,
            uploaded = s.uploaded,
            skipped = s.skipped,
            failed = s.failed,
            source_errors = s.source_errors,
            last_event_id = ?s.last_event_id,
            "Camera statistics"
        );
    }
}
