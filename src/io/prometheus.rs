//! Prometheus metrics HTTP endpoint
//!
//! Exposes sorter metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{
    Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_LAG_BOUNDS, METRICS_NUM_BUCKETS,
    OUTCOMES,
};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: i64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(8192);

    write_signal_metrics(&mut output, site_id, &summary);
    write_decision_metrics(&mut output, site_id, &summary);
    write_dispatch_metrics(&mut output, site_id, &summary);
    write_device_metrics(&mut output, site_id, &summary);
    write_drop_metrics(&mut output, site_id, &summary);

    output
}

fn write_signal_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "sorter_signals_admitted_total",
        "Trigger signals admitted to the wait pool",
        MetricType::Counter,
        site,
        summary.signals_admitted,
    );
    write_metric(
        output,
        "sorter_signals_duplicate_total",
        "Trigger signals discarded as duplicates of a pending id",
        MetricType::Counter,
        site,
        summary.signals_duplicate,
    );
    write_metric(
        output,
        "sorter_wait_pool_size",
        "Signals currently waiting for a parcel",
        MetricType::Gauge,
        site,
        summary.pool_size,
    );
    write_metric(
        output,
        "sorter_parcels_total",
        "Parcel events correlated",
        MetricType::Counter,
        site,
        summary.parcels_total,
    );
    write_metric(
        output,
        "sorter_parcels_held",
        "Parcels held for a late signal",
        MetricType::Gauge,
        site,
        summary.held_parcels,
    );
    let _ = writeln!(output, "# HELP sorter_parcels_per_sec Parcels correlated per second");
    let _ = writeln!(output, "# TYPE sorter_parcels_per_sec gauge");
    let _ = writeln!(
        output,
        "sorter_parcels_per_sec{{site=\"{site}\"}} {:.2}",
        summary.parcels_per_sec
    );
}

fn write_decision_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    let _ = writeln!(output, "# HELP sorter_decisions_total Sort decisions by outcome");
    let _ = writeln!(output, "# TYPE sorter_decisions_total counter");
    for outcome in OUTCOMES {
        let _ = writeln!(
            output,
            "sorter_decisions_total{{site=\"{site}\",outcome=\"{}\"}} {}",
            outcome.as_str(),
            summary.decisions_for(outcome)
        );
    }

    let correlate_count: u64 = summary.correlate_buckets.iter().sum();
    write_histogram(
        output,
        "sorter_correlation_latency_us",
        "Parcel correlation latency in microseconds",
        site,
        &summary.correlate_buckets,
        &METRICS_BUCKET_BOUNDS,
        (summary.correlate_avg_us * correlate_count) as i64,
    );
    write_metric(
        output,
        "sorter_correlation_latency_p99_us",
        "99th percentile correlation latency",
        MetricType::Gauge,
        site,
        summary.correlate_p99_us,
    );

    write_histogram(
        output,
        "sorter_match_lag_ms",
        "Parcel arrival minus signal receive time for matched pairs",
        site,
        &summary.match_lag_buckets,
        &METRICS_LAG_BOUNDS,
        summary.match_lag_sum_ms,
    );
    write_metric(
        output,
        "sorter_invariant_violations_total",
        "Correlations aborted on an internal invariant violation",
        MetricType::Counter,
        site,
        summary.invariant_violations,
    );
}

fn write_dispatch_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "sorter_dispatch_sent_total",
        "Sort commands written to the device",
        MetricType::Counter,
        site,
        summary.dispatch_sent,
    );
    write_metric(
        output,
        "sorter_dispatch_failed_total",
        "Sort commands that failed on the transport",
        MetricType::Counter,
        site,
        summary.dispatch_failed,
    );
    write_metric(
        output,
        "sorter_dispatch_stale_total",
        "Decisions dropped after their dispatch deadline",
        MetricType::Counter,
        site,
        summary.dispatch_stale,
    );

    let queue_count: u64 = summary.dispatch_queue_delay_buckets.iter().sum();
    write_histogram(
        output,
        "sorter_dispatch_queue_delay_us",
        "Time from decision enqueue to worker pickup in microseconds",
        site,
        &summary.dispatch_queue_delay_buckets,
        &METRICS_BUCKET_BOUNDS,
        (summary.dispatch_queue_delay_avg_us * queue_count) as i64,
    );
    write_metric(
        output,
        "sorter_dispatch_queue_delay_max_us",
        "Max dispatch queue delay since last scrape",
        MetricType::Gauge,
        site,
        summary.dispatch_queue_delay_max_us,
    );
}

fn write_device_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "sorter_device_connected",
        "Device connection state (1 = connected)",
        MetricType::Gauge,
        site,
        summary.device_connected,
    );
    write_metric(
        output,
        "sorter_device_connects_total",
        "Successful device connections",
        MetricType::Counter,
        site,
        summary.device_connects,
    );
    write_metric(
        output,
        "sorter_frames_malformed_total",
        "Malformed device frames dropped",
        MetricType::Counter,
        site,
        summary.frames_malformed,
    );
    write_metric(
        output,
        "sorter_feedback_total",
        "Sort command feedback frames received",
        MetricType::Counter,
        site,
        summary.feedback_total,
    );
    write_metric(
        output,
        "sorter_feedback_errors_total",
        "Sort command feedback frames with a non-zero error code",
        MetricType::Counter,
        site,
        summary.feedback_errors,
    );
}

fn write_drop_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "sorter_signals_dropped_total",
        "Trigger signals dropped because the ingestion queue was full",
        MetricType::Counter,
        site,
        summary.signals_dropped,
    );
    write_metric(
        output,
        "sorter_parcel_backpressure_total",
        "Parcel events that waited for room in the correlation queue",
        MetricType::Counter,
        site,
        summary.parcels_backpressured,
    );
    write_metric(
        output,
        "sorter_decisions_dropped_total",
        "Decisions dropped because the dispatch queue was full",
        MetricType::Counter,
        site,
        summary.decisions_dropped,
    );
    write_metric(
        output,
        "sorter_sink_dropped_total",
        "Sink notifications dropped because the sink queue was full",
        MetricType::Counter,
        site,
        summary.sink_dropped,
    );
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &site_id);
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
        }
        (&Method::GET, "/health") => {
            let (status, body) = if metrics.device_connected() {
                (StatusCode::OK, "ok")
            } else {
                (StatusCode::SERVICE_UNAVAILABLE, "device_disconnected")
            };
            Response::builder().status(status).body(Full::new(Bytes::from(body)))
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found"))),
    };

    Ok(response.unwrap_or_else(|e| {
        error!(error = %e, "prometheus_response_build_failed");
        Response::new(Full::new(Bytes::new()))
    }))
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
