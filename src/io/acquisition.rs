//! Acquisition listener - parcel events from the camera/scale subsystem
//!
//! Listens for TCP connections from the acquisition host.
//! Protocol: one JSON object per line, e.g.
//! `{"barcode":"ABC123","weight":1.25,"length":300,"width":200,"height":150,"arrived_at":1767607200300}`
//! `arrived_at` may be epoch ms or an RFC 3339 string; when missing the
//! receive time is used.

use crate::domain::types::{epoch_ms, ParcelEvent, ParcelMessage};
use crate::infra::metrics::Metrics;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Acquisition listener configuration
#[derive(Debug, Clone)]
pub struct AcquisitionListenerConfig {
    pub port: u16,
    pub enabled: bool,
}

impl Default for AcquisitionListenerConfig {
    fn default() -> Self {
        Self { port: 25900, enabled: true }
    }
}

/// Start the acquisition TCP listener
///
/// Each connection has its own reader task. When the correlation channel is
/// full the reader waits for room, so only that socket slows down and every
/// parcel still reaches the correlator.
pub async fn start_acquisition_listener(
    config: AcquisitionListenerConfig,
    parcel_tx: mpsc::Sender<ParcelEvent>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    if !config.enabled {
        info!("acquisition_listener_disabled");
        return Ok(());
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!(port = %config.port, "acquisition_listener_started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("acquisition_listener_shutdown");
                    return Ok(());
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        let tx = parcel_tx.clone();
                        let m = metrics.clone();
                        tokio::spawn(async move {
                            handle_connection(socket, addr, tx, m).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "acquisition_accept_failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    socket: tokio::net::TcpStream,
    addr: SocketAddr,
    parcel_tx: mpsc::Sender<ParcelEvent>,
    metrics: Arc<Metrics>,
) {
    let peer = addr.to_string();
    debug!(peer = %peer, "acquisition_connection_accepted");
    read_parcels(socket, &peer, &parcel_tx, &metrics).await;
    debug!(peer = %peer, "acquisition_connection_closed");
}

/// Read JSON lines until EOF. Returns the number of parcels forwarded.
///
/// Lines that are not valid UTF-8 or not a parcel object are logged and
/// skipped; only EOF, a read error, or a closed channel end the connection.
pub async fn read_parcels<R>(
    reader: R,
    peer: &str,
    parcel_tx: &mpsc::Sender<ParcelEvent>,
    metrics: &Metrics,
) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(512);
    let mut forwarded = 0;

    // Rate-limit backpressure warnings to 1 per second
    let mut last_full_warn = Instant::now() - Duration::from_secs(2);

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(peer = %peer, error = %e, "acquisition_read_failed");
                break;
            }
        }

        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }

        let message: ParcelMessage = match serde_json::from_slice(trimmed) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %peer, error = %e, bytes = %trimmed.len(), "acquisition_invalid_line");
                continue;
            }
        };

        let parcel = message.into_event(epoch_ms());
        debug!(
            peer = %peer,
            barcode = %parcel.barcode,
            arrived_at_ms = %parcel.arrived_at_ms,
            weight_kg = %parcel.weight_kg,
            "parcel_received"
        );

        let parcel = match parcel_tx.try_send(parcel) {
            Ok(()) => {
                forwarded += 1;
                continue;
            }
            Err(TrySendError::Full(parcel)) => parcel,
            Err(TrySendError::Closed(_)) => {
                warn!(peer = %peer, "parcel_channel_closed");
                break;
            }
        };

        metrics.record_parcel_backpressure();
        if last_full_warn.elapsed() > Duration::from_secs(1) {
            warn!(peer = %peer, barcode = %parcel.barcode, "parcel_channel_full: waiting");
            last_full_warn = Instant::now();
        }
        if parcel_tx.send(parcel).await.is_err() {
            warn!(peer = %peer, "parcel_channel_closed");
            break;
        }
        forwarded += 1;
    }

    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_parcels_skips_invalid_lines() {
        let input = concat!(
            "{\"barcode\":\"ABC123\",\"arrived_at\":1767607200300}\n",
            "not json\n",
            "\n",
            "{\"barcode\":\"XYZ\",\"arrived_at\":\"2026-01-05T10:00:00.300Z\",\"weight\":2.5}\n",
        );
        let (tx, mut rx) = mpsc::channel(8);
        let metrics = Metrics::new();

        let forwarded = read_parcels(input.as_bytes(), "test", &tx, &metrics).await;
        assert_eq!(forwarded, 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.barcode, "ABC123");
        assert_eq!(first.arrived_at_ms, 1767607200300);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.arrived_at_ms, 1767607200300);
        assert_eq!(second.weight_kg, 2.5);
    }

    #[tokio::test]
    async fn test_missing_timestamp_uses_receive_time() {
        let (tx, mut rx) = mpsc::channel(8);
        let metrics = Metrics::new();
        let before = epoch_ms();

        read_parcels(&b"{\"barcode\":\"A1\"}\n"[..], "test", &tx, &metrics).await;
        assert!(rx.recv().await.unwrap().arrived_at_ms >= before);
    }

    #[tokio::test]
    async fn test_non_utf8_line_is_skipped() {
        let mut input = b"{\"barcode\":\"A1\"}\n".to_vec();
        input.extend_from_slice(&[0xFF, 0xFE, b'\n']);
        input.extend_from_slice(b"{\"barcode\":\"B2\"}\n{\"barcode\":\"C3\"}\n");
        let (tx, mut rx) = mpsc::channel(8);
        let metrics = Metrics::new();

        let forwarded = read_parcels(&input[..], "test", &tx, &metrics).await;
        assert_eq!(forwarded, 3);

        let barcodes: Vec<String> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|p| p.barcode)
        .collect();
        assert_eq!(barcodes, ["A1", "B2", "C3"]);
    }

    #[tokio::test]
    async fn test_last_line_without_newline_is_read() {
        let (tx, mut rx) = mpsc::channel(8);
        let metrics = Metrics::new();

        let forwarded = read_parcels(&b"{\"barcode\":\"TAIL\"}"[..], "test", &tx, &metrics).await;
        assert_eq!(forwarded, 1);
        assert_eq!(rx.recv().await.unwrap().barcode, "TAIL");
    }

    #[tokio::test]
    async fn test_full_channel_waits_instead_of_dropping() {
        let (tx, mut rx) = mpsc::channel(1);
        let metrics = Arc::new(Metrics::new());
        let input = "{\"barcode\":\"A\"}\n{\"barcode\":\"B\"}\n{\"barcode\":\"C\"}\n";

        let reader_metrics = metrics.clone();
        let reader = tokio::spawn(async move {
            read_parcels(input.as_bytes(), "test", &tx, &reader_metrics).await
        });

        let mut barcodes = Vec::new();
        while let Some(parcel) = rx.recv().await {
            barcodes.push(parcel.barcode);
        }

        assert_eq!(reader.await.unwrap(), 3);
        assert_eq!(barcodes, ["A", "B", "C"]);
        assert!(metrics.report().parcels_backpressured >= 1);
    }
}
