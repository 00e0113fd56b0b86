//! Sink notifications - decision log and connectivity reporting
//!
//! Producers (dispatch workers, device link) never block on the sink: events
//! go through a bounded mpsc channel with `try_send` and are dropped (and
//! counted) when it is full. A single drain task appends completed decisions
//! to a JSONL file and logs connectivity changes.

use crate::domain::types::{epoch_ms, SignalId, SortDecision};
use crate::infra::metrics::Metrics;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// What happened to a decision at the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Sent,
    Failed,
    /// Picked up after its dispatch deadline, never written
    Stale,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Sent => "sent",
            DispatchStatus::Failed => "failed",
            DispatchStatus::Stale => "stale",
        }
    }
}

/// Decision log record (one JSON object per line)
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    #[serde(flatten)]
    pub decision: SortDecision,
    pub dispatch: DispatchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Enqueue to device write completion (µs)
    pub dispatch_us: u64,
}

/// Events delivered to the sink drain
#[derive(Debug)]
pub enum SinkEvent {
    DecisionCompleted(DecisionRecord),
    DeviceConnectivity { connected: bool, endpoint: String, ts: u64 },
    /// Device reported the result of a sort command
    CommandFeedback { signal_id: SignalId, error_code: u8, chute: u8 },
}

/// Sender handle for sink events
///
/// Clone this to share across producers. Non-blocking: if the channel is
/// full, events are dropped and counted.
#[derive(Clone)]
pub struct SinkSender {
    tx: mpsc::Sender<SinkEvent>,
    metrics: Arc<Metrics>,
}

impl SinkSender {
    pub fn new(tx: mpsc::Sender<SinkEvent>, metrics: Arc<Metrics>) -> Self {
        Self { tx, metrics }
    }

    pub fn send(&self, event: SinkEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.record_sink_dropped();
                debug!("sink_event_dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub fn decision_completed(&self, record: DecisionRecord) {
        self.send(SinkEvent::DecisionCompleted(record));
    }

    pub fn device_connectivity(&self, connected: bool, endpoint: &str) {
        self.send(SinkEvent::DeviceConnectivity {
            connected,
            endpoint: endpoint.to_string(),
            ts: epoch_ms(),
        });
    }

    pub fn command_feedback(&self, signal_id: SignalId, error_code: u8, chute: u8) {
        self.send(SinkEvent::CommandFeedback { signal_id, error_code, chute });
    }
}

/// Create a sink channel pair
pub fn create_sink_channel(
    buffer_size: usize,
    metrics: Arc<Metrics>,
) -> (SinkSender, mpsc::Receiver<SinkEvent>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (SinkSender::new(tx, metrics), rx)
}

/// Append-only JSONL decision log
pub struct DecisionLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl DecisionLog {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "decision_log_initialized");
        Self { path: PathBuf::from(file_path), writer: None }
    }

    /// Append one record and flush. Returns true if successful.
    pub fn write_record(&mut self, record: &DecisionRecord) -> bool {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "decision_serialize_failed");
                return false;
            }
        };

        match self.append_line(&line) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    decision_id = %record.decision.decision_id,
                    error = %e,
                    "decision_log_write_failed"
                );
                // Reopen on next write
                self.writer = None;
                false
            }
        }
    }

    fn append_line(&mut self, line: &str) -> std::io::Result<()> {
        if self.writer.is_none() {
            self.writer = Some(BufWriter::new(open_append(&self.path)?));
        }
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{}", line)?;
            writer.flush()?;
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Drain sink events until the channel closes or shutdown is signalled
pub async fn run_sink(
    mut rx: mpsc::Receiver<SinkEvent>,
    mut log: DecisionLog,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("sink_started");

    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    // Flush what is already queued
                    while let Ok(event) = rx.try_recv() {
                        handle_event(&mut log, event);
                    }
                    break;
                }
                continue;
            }
        };
        handle_event(&mut log, event);
    }

    info!("sink_stopped");
}

fn handle_event(log: &mut DecisionLog, event: SinkEvent) {
    match event {
        SinkEvent::DecisionCompleted(record) => {
            log.write_record(&record);
        }
        SinkEvent::DeviceConnectivity { connected, endpoint, ts } => {
            if connected {
                info!(endpoint = %endpoint, ts = %ts, "device_online");
            } else {
                warn!(endpoint = %endpoint, ts = %ts, "device_offline");
            }
        }
        SinkEvent::CommandFeedback { signal_id, error_code, chute } => {
            if error_code != 0 {
                warn!(
                    signal_id = %signal_id,
                    error_code = %error_code,
                    chute = %chute,
                    "sort_command_feedback_error"
                );
            } else {
                debug!(signal_id = %signal_id, chute = %chute, "sort_command_feedback_ok");
            }
        }
    }
}
