//! Dispatcher - delivers sort decisions to the actuation device
//!
//! Decisions are produced on the correlation path and by timeout tasks, then
//! enqueued here so device I/O never blocks either of them. A small pool of
//! workers shares one bounded queue; each worker writes the sort command
//! frame through the device link and waits for the real write result.
//!
//! A decision is attempted at most once. Decisions picked up after their
//! dispatch deadline are dropped as stale rather than written late.

use crate::domain::types::{epoch_ms, SignalId, SortDecision};
use crate::infra::metrics::Metrics;
use crate::io::device::DeviceHandle;
use crate::io::frame::DeviceFrame;
use crate::io::sink::{DecisionRecord, DispatchStatus, SinkSender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Signal id used for decisions that no trigger signal was involved in
pub const NO_SIGNAL_ID: SignalId = SignalId(0);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("device not connected")]
    NotConnected,
    #[error("device write timed out after {0:?}")]
    Timeout(Duration),
    #[error("device write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("device link closed")]
    LinkClosed,
    #[error("dispatch deadline passed {late_ms} ms ago")]
    Stale { late_ms: u64 },
}

/// Log dispatch failure (cold path)
#[cold]
fn log_dispatch_failed(decision: &SortDecision, e: &DispatchError) {
    error!(
        decision_id = %decision.decision_id,
        signal_id = ?decision.signal_id,
        chute = %decision.chute,
        outcome = %decision.outcome.as_str(),
        error = %e,
        "decision_dispatch_failed"
    );
}

/// Log decision dropped at enqueue (cold path)
#[cold]
fn log_decision_dropped(decision: &SortDecision) {
    error!(
        decision_id = %decision.decision_id,
        signal_id = ?decision.signal_id,
        outcome = %decision.outcome.as_str(),
        "decision_dropped_queue_full"
    );
}

/// Writes sort command frames to the device
pub struct Dispatcher {
    device: DeviceHandle,
    write_timeout: Duration,
}

impl Dispatcher {
    pub fn new(device: DeviceHandle, write_timeout: Duration) -> Self {
        Self { device, write_timeout }
    }

    /// Send one sort command and wait for the write to complete
    pub async fn send(&self, signal_id: SignalId, chute: u8) -> Result<(), DispatchError> {
        let frame = DeviceFrame::SortCommand { id: signal_id, chute }.encode();
        self.device.write_frame(frame, self.write_timeout).await
    }

    pub fn is_connected(&self) -> bool {
        self.device.is_connected()
    }
}

/// A decision waiting for a dispatch worker
#[derive(Debug)]
pub struct DispatchJob {
    pub decision: SortDecision,
    /// Latest epoch ms at which the command is still useful
    pub deadline_ms: u64,
    /// When the job was enqueued (for queue delay measurement)
    pub enqueued_at: Instant,
}

/// Producer side of the dispatch queue
///
/// Clone this to share between the correlation loop and timeout tasks.
/// Never blocks: a full queue drops the decision and counts it.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<DispatchJob>,
    metrics: Arc<Metrics>,
}

impl DispatchQueue {
    /// Enqueue a decision that stays deliverable for `window` after it was made
    pub fn submit(&self, decision: SortDecision, window: Duration) -> bool {
        let deadline_ms = decision.decided_at_ms.saturating_add(window.as_millis() as u64);
        self.submit_with_deadline(decision, deadline_ms)
    }

    pub fn submit_with_deadline(&self, decision: SortDecision, deadline_ms: u64) -> bool {
        self.metrics.record_decision(decision.outcome);

        let job = DispatchJob { decision, deadline_ms, enqueued_at: Instant::now() };
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                self.metrics.record_decision_dropped();
                log_decision_dropped(&job.decision);
                false
            }
            Err(TrySendError::Closed(job)) => {
                warn!(decision_id = %job.decision.decision_id, "dispatch_queue_closed");
                false
            }
        }
    }

    /// Jobs currently waiting for a worker
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Workers draining the dispatch queue
pub struct DispatchWorkerPool {
    dispatcher: Arc<Dispatcher>,
    jobs: Arc<Mutex<mpsc::Receiver<DispatchJob>>>,
    metrics: Arc<Metrics>,
    sink: SinkSender,
    workers: usize,
}

/// Create the dispatch queue and its worker pool
///
/// Returns the queue (for producers) and the pool (to be spawned).
pub fn create_dispatch_pool(
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
    sink: SinkSender,
    queue_size: usize,
    workers: usize,
) -> (DispatchQueue, DispatchWorkerPool) {
    let (tx, rx) = mpsc::channel(queue_size);
    let queue = DispatchQueue { tx, metrics: metrics.clone() };
    let pool = DispatchWorkerPool {
        dispatcher,
        jobs: Arc::new(Mutex::new(rx)),
        metrics,
        sink,
        workers: workers.max(1),
    };
    (queue, pool)
}

impl DispatchWorkerPool {
    /// Spawn all workers. They stop once every `DispatchQueue` is dropped.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|worker_id| {
                let dispatcher = self.dispatcher.clone();
                let jobs = self.jobs.clone();
                let metrics = self.metrics.clone();
                let sink = self.sink.clone();
                tokio::spawn(run_worker(worker_id, dispatcher, jobs, metrics, sink))
            })
            .collect()
    }
}

async fn run_worker(
    worker_id: usize,
    dispatcher: Arc<Dispatcher>,
    jobs: Arc<Mutex<mpsc::Receiver<DispatchJob>>>,
    metrics: Arc<Metrics>,
    sink: SinkSender,
) {
    info!(worker_id = %worker_id, "dispatch_worker_started");

    loop {
        let job = {
            let mut rx = jobs.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };
        process_job(worker_id, &dispatcher, &metrics, &sink, job).await;
    }

    info!(worker_id = %worker_id, "dispatch_worker_stopped");
}

async fn process_job(
    worker_id: usize,
    dispatcher: &Dispatcher,
    metrics: &Metrics,
    sink: &SinkSender,
    job: DispatchJob,
) {
    let queue_delay_us = job.enqueued_at.elapsed().as_micros() as u64;
    metrics.record_dispatch_queue_delay(queue_delay_us);

    let decision = job.decision;
    let now_ms = epoch_ms();

    let (status, error) = if now_ms > job.deadline_ms {
        metrics.record_dispatch_stale();
        let e = DispatchError::Stale { late_ms: now_ms - job.deadline_ms };
        warn!(
            decision_id = %decision.decision_id,
            signal_id = ?decision.signal_id,
            outcome = %decision.outcome.as_str(),
            error = %e,
            "decision_stale"
        );
        (DispatchStatus::Stale, Some(e.to_string()))
    } else {
        let send_start = Instant::now();
        let signal_id = decision.signal_id.unwrap_or(NO_SIGNAL_ID);
        match dispatcher.send(signal_id, decision.chute).await {
            Ok(()) => {
                metrics.record_dispatch_sent();
                info!(
                    worker_id = %worker_id,
                    decision_id = %decision.decision_id,
                    signal_id = %signal_id,
                    chute = %decision.chute,
                    outcome = %decision.outcome.as_str(),
                    latency_ms = %decision.latency_ms,
                    queue_delay_us = %queue_delay_us,
                    send_us = %send_start.elapsed().as_micros(),
                    "decision_dispatched"
                );
                (DispatchStatus::Sent, None)
            }
            Err(e) => {
                metrics.record_dispatch_failed();
                log_dispatch_failed(&decision, &e);
                (DispatchStatus::Failed, Some(e.to_string()))
            }
        }
    };

    // Warn if queue delay exceeds 1ms - indicates backlog
    if queue_delay_us > 1000 {
        warn!(
            decision_id = %decision.decision_id,
            queue_delay_us = %queue_delay_us,
            "dispatch_queue_delay_high"
        );
    }

    let dispatch_us = job.enqueued_at.elapsed().as_micros() as u64;
    sink.decision_completed(DecisionRecord { decision, dispatch: status, error, dispatch_us });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Outcome;
    use crate::io::device::WriteRequest;
    use crate::io::frame::FRAME_LEN;
    use crate::io::sink::{create_sink_channel, SinkEvent};
    use std::sync::atomic::AtomicBool;

    /// Device stand-in that acks every write and records the frame
    fn fake_device(
        connected: bool,
    ) -> (DeviceHandle, mpsc::UnboundedReceiver<[u8; FRAME_LEN]>) {
        let (write_tx, mut write_rx) = mpsc::channel::<WriteRequest>(8);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(request) = write_rx.recv().await {
                let _ = frames_tx.send(request.frame);
                let _ = request.ack.send(Ok(()));
            }
        });
        (DeviceHandle::new(write_tx, Arc::new(AtomicBool::new(connected))), frames_rx)
    }

    async fn next_record(rx: &mut mpsc::Receiver<SinkEvent>) -> DecisionRecord {
        loop {
            if let Some(SinkEvent::DecisionCompleted(record)) = rx.recv().await {
                return record;
            }
        }
    }

    #[tokio::test]
    async fn test_send_encodes_sort_command() {
        let (device, mut frames) = fake_device(true);
        let dispatcher = Dispatcher::new(device, Duration::from_millis(100));

        dispatcher.send(SignalId(7), 3).await.unwrap();
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame, [0xAA, 0x02, 0x00, 0x07, 0x00, 0x00, 0x03, 0x55]);
    }

    #[tokio::test]
    async fn test_send_fails_when_disconnected() {
        let (device, _frames) = fake_device(false);
        let dispatcher = Dispatcher::new(device, Duration::from_millis(100));

        let result = dispatcher.send(SignalId(7), 3).await;
        assert!(matches!(result, Err(DispatchError::NotConnected)));
    }

    #[tokio::test]
    async fn test_worker_dispatches_and_reports() {
        let metrics = Arc::new(Metrics::new());
        let (device, mut frames) = fake_device(true);
        let dispatcher = Arc::new(Dispatcher::new(device, Duration::from_millis(100)));
        let (sink, mut sink_rx) = create_sink_channel(16, metrics.clone());
        let (queue, pool) = create_dispatch_pool(dispatcher, metrics.clone(), sink, 8, 2);
        let _workers = pool.spawn();

        let decision = SortDecision::new(None, 99, Outcome::NoRead, None, epoch_ms());
        assert!(queue.submit(decision, Duration::from_secs(2)));

        let frame = frames.recv().await.unwrap();
        // No-read decisions carry signal id 0
        assert_eq!(frame, [0xAA, 0x02, 0x00, 0x00, 0x00, 0x00, 99, 0x55]);

        let record = next_record(&mut sink_rx).await;
        assert_eq!(record.dispatch, DispatchStatus::Sent);
        assert_eq!(record.decision.outcome, Outcome::NoRead);
        assert_eq!(metrics.dispatch_sent(), 1);
        assert_eq!(metrics.decisions_total(Outcome::NoRead), 1);
    }

    #[tokio::test]
    async fn test_stale_decision_not_written() {
        let metrics = Arc::new(Metrics::new());
        let (device, mut frames) = fake_device(true);
        let dispatcher = Arc::new(Dispatcher::new(device, Duration::from_millis(100)));
        let (sink, mut sink_rx) = create_sink_channel(16, metrics.clone());
        let (queue, pool) = create_dispatch_pool(dispatcher, metrics.clone(), sink, 8, 1);
        let _workers = pool.spawn();

        let decision = SortDecision::new(Some(SignalId(4)), 5, Outcome::Matched, None, 0);
        let deadline = decision.decided_at_ms - 1000;
        assert!(queue.submit_with_deadline(decision, deadline));

        let record = next_record(&mut sink_rx).await;
        assert_eq!(record.dispatch, DispatchStatus::Stale);
        assert!(record.error.is_some());
        assert_eq!(metrics.dispatch_stale(), 1);
        assert!(frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_write_reported_not_retried() {
        let metrics = Arc::new(Metrics::new());
        let (device, mut frames) = fake_device(false);
        let dispatcher = Arc::new(Dispatcher::new(device, Duration::from_millis(100)));
        let (sink, mut sink_rx) = create_sink_channel(16, metrics.clone());
        let (queue, pool) = create_dispatch_pool(dispatcher, metrics.clone(), sink, 8, 1);
        let _workers = pool.spawn();

        let decision = SortDecision::new(Some(SignalId(4)), 5, Outcome::Matched, None, 0);
        queue.submit(decision, Duration::from_secs(2));

        let record = next_record(&mut sink_rx).await;
        assert_eq!(record.dispatch, DispatchStatus::Failed);
        assert_eq!(metrics.dispatch_failed(), 1);
        assert_eq!(metrics.dispatch_sent(), 0);
        assert!(frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_drops_decision() {
        let metrics = Arc::new(Metrics::new());
        let (device, _frames) = fake_device(true);
        let dispatcher = Arc::new(Dispatcher::new(device, Duration::from_millis(100)));
        let (sink, _sink_rx) = create_sink_channel(16, metrics.clone());
        // Pool never spawned, so nothing drains the queue
        let (queue, _pool) = create_dispatch_pool(dispatcher, metrics.clone(), sink, 1, 1);

        let first = SortDecision::new(None, 99, Outcome::NoMatch, None, 0);
        let second = SortDecision::new(None, 99, Outcome::NoMatch, None, 0);
        assert!(queue.submit(first, Duration::from_secs(2)));
        assert!(!queue.submit(second, Duration::from_secs(2)));
        assert_eq!(queue.depth(), 1);
        assert_eq!(metrics.decisions_dropped(), 1);
    }
}
