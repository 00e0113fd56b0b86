//! Device link - connection to the actuation unit (PLC / diverter controller)
//!
//! One background task owns the connection. It connects over TCP or serial,
//! splits the stream, and runs:
//! - a read loop that decodes signal reports and command feedback
//! - a write loop that drains sort-command requests, acking each with the
//!   real write result
//!
//! When either side fails the connection is dropped and re-established after
//! the reconnect delay. Device settings are re-read on every connect.

use crate::domain::types::{epoch_ms, TriggerSignal};
use crate::infra::config::{DeviceMode, DeviceSettings};
use crate::infra::metrics::Metrics;
use crate::io::frame::{DeviceFrame, FrameDecoder, FRAME_LEN};
use crate::io::sink::SinkSender;
use crate::services::dispatcher::DispatchError;
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error, info, warn};

/// Log connection failure (cold path)
#[cold]
fn log_connect_failed(endpoint: &str, e: &io::Error) {
    error!(endpoint = %endpoint, error = %e, "device_connect_failed");
}

/// Log read error (cold path)
#[cold]
fn log_read_error(e: &io::Error) {
    error!(error = %e, "device_read_error");
}

/// Log write error (cold path)
#[cold]
fn log_write_error(e: &io::Error) {
    error!(error = %e, "device_write_error");
}

/// Log write timeout (cold path)
#[cold]
fn log_write_timeout(timeout: Duration) {
    error!(timeout_ms = %timeout.as_millis(), "device_write_timeout");
}

/// Byte stream to the device
pub trait DeviceStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DeviceStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opens the transport to the device
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, settings: &DeviceSettings) -> io::Result<Box<dyn DeviceStream>>;
}

/// TCP or serial transport, selected by `DeviceSettings::mode`
pub struct TransportConnector;

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self, settings: &DeviceSettings) -> io::Result<Box<dyn DeviceStream>> {
        match settings.mode {
            DeviceMode::Tcp => {
                let stream = tokio::time::timeout(
                    settings.connect_timeout,
                    TcpStream::connect(&settings.tcp_addr),
                )
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

                // Sort commands are tiny and latency-sensitive
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            DeviceMode::Serial => {
                let port = tokio_serial::new(&settings.serial_device, settings.serial_baud)
                    .timeout(settings.connect_timeout)
                    .open_native_async()
                    .map_err(io::Error::from)?;
                Ok(Box::new(port))
            }
        }
    }
}

/// Human-readable endpoint for logs
pub fn endpoint(settings: &DeviceSettings) -> String {
    match settings.mode {
        DeviceMode::Tcp => settings.tcp_addr.clone(),
        DeviceMode::Serial => format!("{}@{}", settings.serial_device, settings.serial_baud),
    }
}

/// A frame to write, with the channel that receives the write result
#[derive(Debug)]
pub struct WriteRequest {
    pub frame: [u8; FRAME_LEN],
    pub ack: oneshot::Sender<Result<(), DispatchError>>,
}

/// Cloneable handle used by the dispatcher to write frames
#[derive(Clone)]
pub struct DeviceHandle {
    write_tx: mpsc::Sender<WriteRequest>,
    connected: Arc<AtomicBool>,
}

impl DeviceHandle {
    pub fn new(write_tx: mpsc::Sender<WriteRequest>, connected: Arc<AtomicBool>) -> Self {
        Self { write_tx, connected }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Write one frame and wait for the device write to complete.
    ///
    /// Fails fast while disconnected. A request abandoned by the timeout is
    /// skipped by the write loop rather than written late.
    pub async fn write_frame(
        &self,
        frame: [u8; FRAME_LEN],
        timeout: Duration,
    ) -> Result<(), DispatchError> {
        if !self.is_connected() {
            return Err(DispatchError::NotConnected);
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        let request = WriteRequest { frame, ack: ack_tx };

        let exchange = async {
            self.write_tx.send(request).await.map_err(|_| DispatchError::LinkClosed)?;
            ack_rx.await.map_err(|_| DispatchError::LinkClosed)?
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(timeout)),
        }
    }
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkExit {
    Disconnected,
    Shutdown,
}

/// Background owner of the device connection
pub struct DeviceLink {
    connector: Arc<dyn Connector>,
    settings_rx: watch::Receiver<Arc<DeviceSettings>>,
    write_rx: mpsc::Receiver<WriteRequest>,
    connected: Arc<AtomicBool>,
    signal_tx: mpsc::Sender<TriggerSignal>,
    metrics: Arc<Metrics>,
    sink: SinkSender,
}

/// Create a device link and the handle used to write through it
///
/// Returns the handle (for the dispatcher) and the link (to be spawned).
pub fn create_device_link(
    connector: Arc<dyn Connector>,
    settings_rx: watch::Receiver<Arc<DeviceSettings>>,
    signal_tx: mpsc::Sender<TriggerSignal>,
    metrics: Arc<Metrics>,
    sink: SinkSender,
    write_queue_size: usize,
) -> (DeviceHandle, DeviceLink) {
    let (write_tx, write_rx) = mpsc::channel(write_queue_size);
    let connected = Arc::new(AtomicBool::new(false));
    let handle = DeviceHandle::new(write_tx, connected.clone());
    let link =
        DeviceLink { connector, settings_rx, write_rx, connected, signal_tx, metrics, sink };
    (handle, link)
}

impl DeviceLink {
    /// Connect, serve, and reconnect until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let settings = self.settings_rx.borrow_and_update().clone();
            let endpoint = endpoint(&settings);
            info!(endpoint = %endpoint, mode = %settings.mode.as_str(), "device_connecting");

            let connected = tokio::select! {
                result = self.connector.connect(&settings) => result,
                _ = shutdown.changed() => break,
            };

            match connected {
                Ok(stream) => {
                    self.set_connected(true, &endpoint);
                    let exit = self.serve(stream, &settings, &mut shutdown).await;
                    self.set_connected(false, &endpoint);
                    if exit == LinkExit::Shutdown {
                        break;
                    }
                }
                Err(e) => log_connect_failed(&endpoint, &e),
            }

            tokio::select! {
                _ = tokio::time::sleep(settings.reconnect_delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("device_link_shutdown");
    }

    fn set_connected(&self, connected: bool, endpoint: &str) {
        self.connected.store(connected, Ordering::Release);
        self.metrics.record_device_connected(connected);
        self.sink.device_connectivity(connected, endpoint);
        if connected {
            info!(endpoint = %endpoint, "device_connected");
        } else {
            warn!(endpoint = %endpoint, "device_disconnected");
        }
    }

    async fn serve(
        &mut self,
        stream: Box<dyn DeviceStream>,
        settings: &DeviceSettings,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LinkExit {
        let (read_half, write_half) = tokio::io::split(stream);

        let mut read_handle = tokio::spawn(read_loop(
            read_half,
            self.signal_tx.clone(),
            self.metrics.clone(),
            self.sink.clone(),
            settings.read_timeout,
        ));

        let exit = tokio::select! {
            _ = &mut read_handle => {
                warn!("device_read_loop_exited");
                LinkExit::Disconnected
            }
            exit = write_loop(write_half, &mut self.write_rx, settings.write_timeout) => {
                warn!("device_write_loop_exited");
                exit
            }
            _ = shutdown.changed() => LinkExit::Shutdown,
        };

        read_handle.abort();
        exit
    }
}

async fn read_loop<R>(
    mut reader: R,
    signal_tx: mpsc::Sender<TriggerSignal>,
    metrics: Arc<Metrics>,
    sink: SinkSender,
    read_timeout: Duration,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 512];
    let mut decoder = FrameDecoder::new();

    loop {
        let n = match tokio::time::timeout(read_timeout, reader.read(&mut buf)).await {
            Ok(Ok(0)) => {
                warn!("device_connection_closed");
                return;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                log_read_error(&e);
                return;
            }
            Err(_) => {
                debug!(idle_ms = %read_timeout.as_millis(), "device_read_idle");
                continue;
            }
        };

        decoder.extend(&buf[..n]);

        while let Some(result) = decoder.next_frame() {
            match result {
                Ok(frame) => handle_frame(frame, &signal_tx, &metrics, &sink),
                Err(e) => {
                    metrics.record_frame_malformed();
                    warn!(error = %e, "device_frame_malformed");
                }
            }
        }
    }
}

/// Route one inbound frame
///
/// Signals reported after ingestion has stopped are dropped; the connection
/// stays up so in-flight sort commands and their feedback still get through.
fn handle_frame(
    frame: DeviceFrame,
    signal_tx: &mpsc::Sender<TriggerSignal>,
    metrics: &Metrics,
    sink: &SinkSender,
) {
    match frame {
        DeviceFrame::SignalReport { id } => {
            let signal = TriggerSignal { id, received_at_ms: epoch_ms() };
            debug!(signal_id = %id, "device_signal_received");
            match signal_tx.try_send(signal) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    metrics.record_signal_dropped();
                    error!(signal_id = %id, "signal_dropped_channel_full");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(signal_id = %id, "signal_dropped_ingestion_stopped");
                }
            }
        }
        DeviceFrame::Feedback { id, error_code, chute } => {
            metrics.record_feedback(error_code);
            sink.command_feedback(id, error_code, chute);
        }
        DeviceFrame::SortCommand { id, chute } => {
            debug!(signal_id = %id, chute = %chute, "device_unexpected_sort_command");
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    write_rx: &mut mpsc::Receiver<WriteRequest>,
    write_timeout: Duration,
) -> LinkExit
where
    W: AsyncWrite + Unpin,
{
    while let Some(request) = write_rx.recv().await {
        if request.ack.is_closed() {
            debug!(frame = %hex::encode(request.frame), "device_write_abandoned");
            continue;
        }

        let write = async {
            writer.write_all(&request.frame).await?;
            writer.flush().await
        };

        let result = match tokio::time::timeout(write_timeout, write).await {
            Ok(Ok(())) => {
                debug!(frame = %hex::encode(request.frame), "device_frame_sent");
                Ok(())
            }
            Ok(Err(e)) => {
                log_write_error(&e);
                Err(DispatchError::Io(e))
            }
            Err(_) => {
                log_write_timeout(write_timeout);
                Err(DispatchError::Timeout(write_timeout))
            }
        };

        let failed = result.is_err();
        let _ = request.ack.send(result);
        if failed {
            return LinkExit::Disconnected;
        }
    }

    // Every handle dropped: nothing left to write
    LinkExit::Shutdown
}
