//! Parcel sorter - correlation and actuation core for a parcel sorting line
//!
//! Pairs parcel reports from the camera/scale subsystem with trigger signals
//! from the actuation unit and sends one sort command per physical object.
//!
//! Module structure:
//! - `domain/` - Core types (TriggerSignal, ParcelEvent, SortDecision)
//! - `io/` - External interfaces (device link, acquisition, sink, Prometheus)
//! - `services/` - Correlation logic (WaitPool, TimeoutSupervisor, Correlator, Dispatcher)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use parcel_sorter::infra::{Config, CorrelationSettings, DeviceSettings, Metrics};
use parcel_sorter::io::{
    create_device_link, create_sink_channel, run_sink, start_acquisition_listener,
    AcquisitionListenerConfig, DecisionLog, TransportConnector,
};
use parcel_sorter::services::{
    create_dispatch_pool, run_signal_ingestion, BindingValidator, CorrelationLoop, Correlator,
    Dispatcher, TimeoutSupervisor, WaitPool,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Parcel sorter - correlation core for a sorting line
#[derive(Parser, Debug)]
#[command(name = "parcel-sorter", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

/// Bound on decoded signals waiting for admission
const SIGNAL_QUEUE_SIZE: usize = 1024;
/// Bound on parcel events waiting for correlation
const PARCEL_QUEUE_SIZE: usize = 1000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for per-signal visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v == "json") {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(git_hash = %env!("GIT_HASH"), "parcel-sorter starting");

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        min_lag_ms = %config.min_lag_ms(),
        max_lag_ms = %config.max_lag_ms(),
        exception_chute = %config.exception_chute(),
        device_mode = %config.device_mode().as_str(),
        device_tcp_addr = %config.device_tcp_addr(),
        dispatch_workers = %config.dispatch_workers(),
        exact_rules = %config.exact_rules().len(),
        default_chute = ?config.default_chute(),
        acquisition_port = %config.acquisition_port(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // Device link and sink stop only after dispatch has drained
    let (drained_tx, drained_rx) = watch::channel(false);

    // Reloadable settings snapshots
    let (settings_tx, settings_rx) = watch::channel(config.correlation_settings());
    let (device_settings_tx, device_settings_rx) = watch::channel(config.device_settings());

    let metrics = Arc::new(Metrics::new());

    // Sink drain (decision log + connectivity)
    let (sink, sink_rx) = create_sink_channel(config.sink_queue_size(), metrics.clone());
    let decision_log = DecisionLog::new(config.decisions_file());
    let sink_handle = tokio::spawn(run_sink(sink_rx, decision_log, drained_rx.clone()));

    // Device link (connect / read / write / reconnect)
    let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE_SIZE);
    let (device, device_link) = create_device_link(
        Arc::new(TransportConnector),
        device_settings_rx,
        signal_tx,
        metrics.clone(),
        sink.clone(),
        config.dispatch_queue_size(),
    );
    let link_handle = tokio::spawn(device_link.run(drained_rx));

    // Dispatch worker pool
    let dispatcher = Arc::new(Dispatcher::new(
        device,
        Duration::from_millis(config.device_write_timeout_ms()),
    ));
    let (dispatch, dispatch_pool) = create_dispatch_pool(
        dispatcher,
        metrics.clone(),
        sink,
        config.dispatch_queue_size(),
        config.dispatch_workers(),
    );
    let dispatch_workers = dispatch_pool.spawn();

    // Shared correlation state
    let wait_pool = Arc::new(WaitPool::new());
    let bindings = Arc::new(BindingValidator::new());
    let signal_admitted = Arc::new(Notify::new());

    // Signal ingestion + timeout supervision
    let supervisor = TimeoutSupervisor::new(
        wait_pool.clone(),
        bindings.clone(),
        dispatch.clone(),
        metrics.clone(),
    );
    tokio::spawn(run_signal_ingestion(
        signal_rx,
        supervisor,
        settings_rx.clone(),
        signal_admitted.clone(),
        shutdown_rx.clone(),
    ));

    // Parcel acquisition listener
    let (parcel_tx, parcel_rx) = mpsc::channel(PARCEL_QUEUE_SIZE);
    let acquisition_config = AcquisitionListenerConfig {
        port: config.acquisition_port(),
        enabled: config.acquisition_enabled(),
    };
    let acquisition_metrics = metrics.clone();
    let acquisition_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = start_acquisition_listener(
            acquisition_config,
            parcel_tx,
            acquisition_metrics,
            acquisition_shutdown,
        )
        .await
        {
            error!(error = %e, "acquisition_listener_error");
        }
    });

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = parcel_sorter::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_metrics_server_error");
            }
        });
    }

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    #[cfg(unix)]
    spawn_reload_task(config.config_file().to_string(), settings_tx, device_settings_tx)?;
    #[cfg(not(unix))]
    let _ = (settings_tx, device_settings_tx);

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    // Run the correlation loop on the main task until shutdown
    let correlator = Correlator::new(wait_pool, bindings, metrics.clone());
    let correlation_loop = CorrelationLoop::new(
        correlator,
        dispatch,
        metrics,
        parcel_rx,
        signal_admitted,
        settings_rx,
    );
    correlation_loop.run(shutdown_rx).await;

    // Let in-flight decisions reach the device before exiting
    let drain = async {
        for worker in dispatch_workers {
            let _ = worker.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(1), drain).await.is_err() {
        info!("dispatch_drain_timeout");
    }
    let _ = drained_tx.send(true);
    let _ = link_handle.await;
    let _ = sink_handle.await;

    info!("parcel-sorter shutdown complete");
    Ok(())
}

/// Re-read the config file on SIGHUP and publish the new settings
#[cfg(unix)]
fn spawn_reload_task(
    config_path: String,
    settings_tx: watch::Sender<Arc<CorrelationSettings>>,
    device_settings_tx: watch::Sender<Arc<DeviceSettings>>,
) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match Config::from_file(&config_path) {
                Ok(config) => {
                    let settings = config.correlation_settings();
                    info!(
                        config_file = %config_path,
                        min_lag_ms = %settings.min_lag_ms,
                        max_lag_ms = %settings.max_lag_ms,
                        exception_chute = %settings.exception_chute,
                        rules = %settings.rules.len(),
                        "config_reloaded"
                    );
                    settings_tx.send_replace(settings);
                    // Applied by the device link on its next connect
                    device_settings_tx.send_replace(config.device_settings());
                }
                Err(e) => {
                    error!(config_file = %config_path, error = %format!("{e:#}"), "config_reload_failed");
                }
            }
        }
    });

    Ok(())
}
