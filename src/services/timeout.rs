//! Timeout supervision and signal ingestion
//!
//! Every admitted signal gets its own timer task. The timer races the
//! signal's cancellation token: if the correlator claims the signal first the
//! token is cancelled and the task ends quietly; if the timer wins it claims
//! the signal itself and routes the object to the exception chute.

use crate::domain::types::{Outcome, SortDecision, TriggerSignal};
use crate::infra::config::CorrelationSettings;
use crate::infra::metrics::Metrics;
use crate::services::binding::BindingValidator;
use crate::services::dispatcher::DispatchQueue;
use crate::services::wait_pool::{WaitPool, WaitPoolEntry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

/// Admits signals and resolves the ones nobody claims in time
#[derive(Clone)]
pub struct TimeoutSupervisor {
    pool: Arc<WaitPool>,
    bindings: Arc<BindingValidator>,
    dispatch: DispatchQueue,
    metrics: Arc<Metrics>,
}

impl TimeoutSupervisor {
    pub fn new(
        pool: Arc<WaitPool>,
        bindings: Arc<BindingValidator>,
        dispatch: DispatchQueue,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { pool, bindings, dispatch, metrics }
    }

    /// Add a signal to the wait pool and arm its timer.
    ///
    /// The timeout and exception chute are captured now; a later settings
    /// reload does not move an armed timer. Returns false for duplicates.
    pub fn admit(&self, signal: TriggerSignal, settings: &CorrelationSettings) -> bool {
        let Some(entry) = self.pool.admit(signal) else {
            self.metrics.record_signal_duplicate();
            return false;
        };

        self.metrics.record_signal_admitted();
        self.metrics.set_pool_size(self.pool.len());
        debug!(
            signal_id = %signal.id,
            received_at_ms = %signal.received_at_ms,
            generation = %entry.generation,
            "signal_admitted"
        );

        self.arm(entry, settings.signal_timeout(), settings.exception_chute);
        true
    }

    fn arm(&self, entry: WaitPoolEntry, timeout: Duration, exception_chute: u8) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = entry.cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    supervisor.expire(entry.signal, entry.generation, exception_chute, timeout);
                }
            }
        });
    }

    /// Resolve a signal whose timer fired. Returns true if this call claimed it.
    pub fn expire(
        &self,
        signal: TriggerSignal,
        generation: u64,
        exception_chute: u8,
        window: Duration,
    ) -> bool {
        let Some(entry) = self.pool.try_claim(signal.id, generation) else {
            debug!(signal_id = %signal.id, "signal_timeout_already_claimed");
            return false;
        };

        entry.cancel.cancel();
        self.metrics.set_pool_size(self.pool.len());
        self.bindings.release(signal.id);

        let decision = SortDecision::new(
            Some(signal.id),
            exception_chute,
            Outcome::Timeout,
            None,
            signal.received_at_ms,
        );
        warn!(
            signal_id = %signal.id,
            waited_ms = %decision.latency_ms,
            chute = %exception_chute,
            "signal_timed_out"
        );

        self.dispatch.submit(decision, window);
        true
    }
}

/// Admit decoded signals until the channel closes or shutdown is signalled
///
/// Each successful admission wakes the correlation loop so parcels held for a
/// late signal get another look.
pub async fn run_signal_ingestion(
    mut signal_rx: mpsc::Receiver<TriggerSignal>,
    supervisor: TimeoutSupervisor,
    settings_rx: watch::Receiver<Arc<CorrelationSettings>>,
    admitted: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("signal_ingestion_started");

    loop {
        tokio::select! {
            signal = signal_rx.recv() => {
                let Some(signal) = signal else {
                    break;
                };
                let settings = settings_rx.borrow().clone();
                if supervisor.admit(signal, &settings) {
                    admitted.notify_one();
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("signal_ingestion_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{epoch_ms, SignalId};
    use crate::infra::config::Config;
    use crate::io::device::DeviceHandle;
    use crate::io::sink::create_sink_channel;
    use crate::services::dispatcher::{create_dispatch_pool, Dispatcher};
    use std::sync::atomic::AtomicBool;

    struct Harness {
        supervisor: TimeoutSupervisor,
        pool: Arc<WaitPool>,
        metrics: Arc<Metrics>,
        _device_rx: mpsc::Receiver<crate::io::device::WriteRequest>,
    }

    // Workers are never spawned; decisions are observed through metrics
    fn harness() -> Harness {
        let metrics = Arc::new(Metrics::new());
        let (write_tx, device_rx) = mpsc::channel(8);
        let device = DeviceHandle::new(write_tx, Arc::new(AtomicBool::new(false)));
        let dispatcher = Arc::new(Dispatcher::new(device, Duration::from_millis(100)));
        let (sink, _sink_rx) = create_sink_channel(16, metrics.clone());
        let (queue, _pool) = create_dispatch_pool(dispatcher, metrics.clone(), sink, 64, 1);
        let pool = Arc::new(WaitPool::new());
        let supervisor = TimeoutSupervisor::new(
            pool.clone(),
            Arc::new(BindingValidator::new()),
            queue,
            metrics.clone(),
        );
        Harness { supervisor, pool, metrics, _device_rx: device_rx }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclaimed_signal_times_out_once() {
        let h = harness();
        let settings = Config::default().correlation_settings();

        assert!(h.supervisor.admit(TriggerSignal::new(7, epoch_ms()), &settings));
        assert_eq!(h.pool.len(), 1);

        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert_eq!(h.metrics.decisions_total(Outcome::Timeout), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(h.pool.is_empty());
        assert_eq!(h.metrics.decisions_total(Outcome::Timeout), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claimed_signal_never_times_out() {
        let h = harness();
        let settings = Config::default().correlation_settings();

        h.supervisor.admit(TriggerSignal::new(7, epoch_ms()), &settings);
        let entry = h.pool.try_remove(SignalId(7)).unwrap();
        entry.cancel.cancel();

        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(h.metrics.decisions_total(Outcome::Timeout), 0);
    }

    #[tokio::test]
    async fn test_duplicate_admission_counted() {
        let h = harness();
        let settings = Config::default().correlation_settings();

        assert!(h.supervisor.admit(TriggerSignal::new(3, 100), &settings));
        assert!(!h.supervisor.admit(TriggerSignal::new(3, 150), &settings));
        assert_eq!(h.metrics.signals_admitted(), 1);
        assert_eq!(h.metrics.signals_duplicate(), 1);
    }

    #[tokio::test]
    async fn test_stale_generation_expiry_is_noop() {
        let h = harness();
        let settings = Config::default().correlation_settings();

        h.supervisor.admit(TriggerSignal::new(5, 100), &settings);
        let old = h.pool.try_remove(SignalId(5)).unwrap();
        h.supervisor.admit(TriggerSignal::new(5, 200), &settings);

        assert!(!h.supervisor.expire(old.signal, old.generation, 99, Duration::from_secs(2)));
        assert!(h.pool.contains(SignalId(5)));
        assert_eq!(h.metrics.decisions_total(Outcome::Timeout), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ingestion_admits_and_notifies() {
        let h = harness();
        let (signal_tx, signal_rx) = mpsc::channel(8);
        let (_settings_tx, settings_rx) = watch::channel(Config::default().correlation_settings());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let admitted = Arc::new(Notify::new());

        let task = tokio::spawn(run_signal_ingestion(
            signal_rx,
            h.supervisor.clone(),
            settings_rx,
            admitted.clone(),
            shutdown_rx,
        ));

        signal_tx.send(TriggerSignal::new(11, epoch_ms())).await.unwrap();
        admitted.notified().await;
        assert!(h.pool.contains(SignalId(11)));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
