//! End-to-end tests: device link -> wait pool -> correlation -> dispatch -> device
//!
//! The device is an in-memory duplex stream; parcels are injected straight
//! into the correlation loop's channel.

use async_trait::async_trait;
use parcel_sorter::domain::{epoch_ms, Outcome, ParcelEvent, SignalId};
use parcel_sorter::infra::{Config, CorrelationSettings, DeviceMode, DeviceSettings, Metrics};
use parcel_sorter::io::device::{Connector, DeviceStream};
use parcel_sorter::io::frame::{DeviceFrame, FRAME_LEN};
use parcel_sorter::io::sink::{DecisionRecord, DispatchStatus, SinkEvent};
use parcel_sorter::io::{create_device_link, create_sink_channel};
use parcel_sorter::services::{
    create_dispatch_pool, run_signal_ingestion, BindingValidator, CorrelationLoop, Correlator,
    Dispatcher, TimeoutSupervisor, WaitPool,
};
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch, Mutex, Notify};

struct DuplexConnector {
    stream: Mutex<Option<DuplexStream>>,
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, _settings: &DeviceSettings) -> io::Result<Box<dyn DeviceStream>> {
        match self.stream.lock().await.take() {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "no device")),
        }
    }
}

fn device_settings() -> Arc<DeviceSettings> {
    Arc::new(DeviceSettings {
        mode: DeviceMode::Tcp,
        tcp_addr: "duplex".to_string(),
        serial_device: String::new(),
        serial_baud: 0,
        connect_timeout: Duration::from_millis(100),
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_millis(500),
        reconnect_delay: Duration::from_millis(50),
    })
}

struct Line {
    device: DuplexStream,
    parcel_tx: mpsc::Sender<ParcelEvent>,
    pool: Arc<WaitPool>,
    sink_rx: mpsc::Receiver<SinkEvent>,
    metrics: Arc<Metrics>,
    shutdown_tx: watch::Sender<bool>,
}

/// Wire the full pipeline the way the binary does
fn start_line(settings: Arc<CorrelationSettings>) -> Line {
    let (ours, device) = tokio::io::duplex(256);
    let connector = Arc::new(DuplexConnector { stream: Mutex::new(Some(ours)) });

    let metrics = Arc::new(Metrics::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (_settings_tx, settings_rx) = watch::channel(settings);
    let (_device_settings_tx, device_settings_rx) = watch::channel(device_settings());
    let (sink, sink_rx) = create_sink_channel(256, metrics.clone());

    let (signal_tx, signal_rx) = mpsc::channel(64);
    let (handle, link) = create_device_link(
        connector,
        device_settings_rx,
        signal_tx,
        metrics.clone(),
        sink.clone(),
        64,
    );
    tokio::spawn(link.run(shutdown_rx.clone()));

    let dispatcher = Arc::new(Dispatcher::new(handle, Duration::from_millis(500)));
    let (dispatch, workers) = create_dispatch_pool(dispatcher, metrics.clone(), sink, 64, 2);
    workers.spawn();

    let pool = Arc::new(WaitPool::new());
    let bindings = Arc::new(BindingValidator::new());
    let admitted = Arc::new(Notify::new());

    let supervisor =
        TimeoutSupervisor::new(pool.clone(), bindings.clone(), dispatch.clone(), metrics.clone());
    tokio::spawn(run_signal_ingestion(
        signal_rx,
        supervisor,
        settings_rx.clone(),
        admitted.clone(),
        shutdown_rx.clone(),
    ));

    let (parcel_tx, parcel_rx) = mpsc::channel(64);
    let correlator = Correlator::new(pool.clone(), bindings, metrics.clone());
    let correlation_loop =
        CorrelationLoop::new(correlator, dispatch, metrics.clone(), parcel_rx, admitted, settings_rx);
    tokio::spawn(correlation_loop.run(shutdown_rx));

    Line { device, parcel_tx, pool, sink_rx, metrics, shutdown_tx }
}

impl Line {
    async fn report_signal(&mut self, id: u16) -> u64 {
        let frame = DeviceFrame::SignalReport { id: SignalId(id) }.encode();
        self.device.write_all(&frame).await.unwrap();
        self.wait_admitted(SignalId(id)).await
    }

    /// Wait for the signal to reach the pool, returning its receive time
    async fn wait_admitted(&self, id: SignalId) -> u64 {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(pending) = self.pool.snapshot().into_iter().find(|p| p.signal.id == id)
                {
                    return pending.signal.received_at_ms;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("signal never admitted")
    }

    async fn next_command(&mut self) -> DeviceFrame {
        let mut buf = [0u8; FRAME_LEN];
        tokio::time::timeout(Duration::from_secs(5), self.device.read_exact(&mut buf))
            .await
            .expect("no sort command")
            .unwrap();
        DeviceFrame::decode(&buf).unwrap()
    }

    async fn next_record(&mut self) -> DecisionRecord {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match self.sink_rx.recv().await {
                    Some(SinkEvent::DecisionCompleted(record)) => return record,
                    Some(_) => continue,
                    None => panic!("sink closed"),
                }
            }
        })
        .await
        .expect("no decision record")
    }

    async fn next_feedback(&mut self) -> (SignalId, u8, u8) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match self.sink_rx.recv().await {
                    Some(SinkEvent::CommandFeedback { signal_id, error_code, chute }) => {
                        return (signal_id, error_code, chute)
                    }
                    Some(_) => continue,
                    None => panic!("sink closed"),
                }
            }
        })
        .await
        .expect("no feedback")
    }
}

fn rules_settings() -> Arc<CorrelationSettings> {
    Config::default()
        .with_exact_rule("ABC123", 3)
        .with_prefix_rule("PKG", 5)
        .correlation_settings()
}

#[tokio::test]
async fn test_signal_then_parcel_is_matched() {
    let mut line = start_line(rules_settings());

    let received_at = line.report_signal(7).await;
    line.parcel_tx.send(ParcelEvent::new("ABC123", received_at + 300)).await.unwrap();

    assert_eq!(line.next_command().await, DeviceFrame::SortCommand { id: SignalId(7), chute: 3 });

    let record = line.next_record().await;
    assert_eq!(record.decision.outcome, Outcome::Matched);
    assert_eq!(record.decision.signal_id, Some(SignalId(7)));
    assert_eq!(record.decision.barcode.as_deref(), Some("ABC123"));
    assert_eq!(record.dispatch, DispatchStatus::Sent);
    assert!(line.pool.is_empty());

    // Device confirms the command
    let feedback = DeviceFrame::Feedback { id: SignalId(7), error_code: 0, chute: 3 }.encode();
    line.device.write_all(&feedback).await.unwrap();
    assert_eq!(line.next_feedback().await, (SignalId(7), 0, 3));

    line.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_unmatched_signal_times_out_to_exception_chute() {
    let settings = Config::default().with_lag_window(50, 200).correlation_settings();
    let mut line = start_line(settings);

    line.report_signal(9).await;

    assert_eq!(line.next_command().await, DeviceFrame::SortCommand { id: SignalId(9), chute: 99 });

    let record = line.next_record().await;
    assert_eq!(record.decision.outcome, Outcome::Timeout);
    assert!(record.decision.barcode.is_none());
    assert!(line.pool.is_empty());
    assert_eq!(line.metrics.decisions_total(Outcome::Timeout), 1);

    line.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_parcel_outside_window_does_not_consume_signal() {
    let mut line = start_line(rules_settings());

    let received_at = line.report_signal(4).await;
    // 50 ms is below the 100 ms minimum lag
    line.parcel_tx.send(ParcelEvent::new("PKG001", received_at + 50)).await.unwrap();

    assert_eq!(line.next_command().await, DeviceFrame::SortCommand { id: SignalId(0), chute: 99 });
    assert_eq!(line.next_record().await.decision.outcome, Outcome::NoMatch);
    assert!(line.pool.contains(SignalId(4)));

    line.parcel_tx.send(ParcelEvent::new("PKG002", received_at + 400)).await.unwrap();
    assert_eq!(line.next_command().await, DeviceFrame::SortCommand { id: SignalId(4), chute: 5 });

    line.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_noread_parcel_leaves_pool_untouched() {
    let mut line = start_line(rules_settings());

    let received_at = line.report_signal(2).await;
    line.parcel_tx.send(ParcelEvent::new("NOREAD", received_at + 300)).await.unwrap();

    assert_eq!(line.next_command().await, DeviceFrame::SortCommand { id: SignalId(0), chute: 99 });
    let record = line.next_record().await;
    assert_eq!(record.decision.outcome, Outcome::NoRead);
    assert!(record.decision.signal_id.is_none());
    assert!(line.pool.contains(SignalId(2)));

    line.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_late_signal_matches_held_parcel() {
    let settings = Config::default()
        .with_lag_window(-500, 2000)
        .with_exact_rule("LATE1", 6)
        .correlation_settings();
    let mut line = start_line(settings);

    line.parcel_tx.send(ParcelEvent::new("LATE1", epoch_ms())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    line.report_signal(12).await;

    assert_eq!(line.next_command().await, DeviceFrame::SortCommand { id: SignalId(12), chute: 6 });
    assert_eq!(line.next_record().await.decision.outcome, Outcome::Matched);

    line.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_each_parcel_gets_its_own_signal() {
    let mut line = start_line(rules_settings());

    let mut received = Vec::new();
    for id in 1..=5u16 {
        received.push(line.report_signal(id).await);
    }
    for (i, received_at) in received.iter().enumerate() {
        let barcode = format!("PKG{:03}", i);
        line.parcel_tx.send(ParcelEvent::new(barcode, received_at + 300)).await.unwrap();
    }

    let mut ids = HashSet::new();
    for _ in 0..5 {
        match line.next_command().await {
            DeviceFrame::SortCommand { id, chute } => {
                assert_eq!(chute, 5);
                assert!(ids.insert(id), "signal {id} commanded twice");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert_eq!(ids, (1..=5u16).map(SignalId).collect());
    assert!(line.pool.is_empty());

    line.shutdown_tx.send(true).unwrap();
}
