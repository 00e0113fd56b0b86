//! Correlator - pairs each parcel event with the trigger signal of the same object
//!
//! Algorithm per parcel:
//! 1. Empty or no-read barcode -> NoRead to the exception chute, pool untouched
//! 2. Eligible signals: `min_lag <= parcel.arrived_at - signal.received_at <= max_lag`
//! 3. Earliest eligible signal wins (snapshot order breaks timestamp ties)
//! 4. Claim it; if a timeout claimed it first, retry once on a fresh snapshot
//! 5. Claimed -> cancel its timer, bind the barcode, look up the chute
//!
//! When `min_lag` is negative the signal may legitimately arrive after the
//! parcel. The correlation loop then holds an unmatched parcel for `|min_lag|`
//! and retries it whenever a new signal is admitted.

use crate::domain::types::{epoch_ms, Outcome, ParcelEvent, SignalId, SortDecision};
use crate::infra::config::CorrelationSettings;
use crate::infra::metrics::Metrics;
use crate::services::binding::{BindOutcome, BindingValidator};
use crate::services::dispatcher::DispatchQueue;
use crate::services::rules::ChuteRules;
use crate::services::wait_pool::{PendingSignal, WaitPool, WaitPoolEntry};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

/// Claim attempts per parcel before giving up on the pool
const CLAIM_ATTEMPTS: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("wait pool returned signal {got} for a claim of signal {requested}")]
    Invariant { requested: SignalId, got: SignalId },
}

/// Result of one correlation attempt
#[derive(Debug)]
pub enum Correlation {
    Decided(SortDecision),
    /// No signal in the window right now
    NoEligibleSignal,
}

/// Log invariant violation (cold path)
#[cold]
fn log_invariant_violation(barcode: &str, e: &CorrelationError) {
    error!(barcode = %barcode, error = %e, "correlation_invariant_violated");
}

/// Signed lag between a parcel and a signal, in ms
#[inline]
pub fn lag_ms(parcel_arrived_at_ms: u64, signal_received_at_ms: u64) -> i64 {
    parcel_arrived_at_ms as i64 - signal_received_at_ms as i64
}

pub struct Correlator {
    pool: Arc<WaitPool>,
    bindings: Arc<BindingValidator>,
    metrics: Arc<Metrics>,
    /// Replaces the configured rule table when set
    rules: Option<Arc<dyn ChuteRules>>,
}

impl Correlator {
    pub fn new(pool: Arc<WaitPool>, bindings: Arc<BindingValidator>, metrics: Arc<Metrics>) -> Self {
        Self { pool, bindings, metrics, rules: None }
    }

    /// Use an external rule source instead of the table in the settings
    pub fn with_rules(mut self, rules: Arc<dyn ChuteRules>) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Correlate one parcel against the current wait pool
    pub fn correlate(
        &self,
        parcel: &ParcelEvent,
        settings: &CorrelationSettings,
    ) -> Result<Correlation, CorrelationError> {
        if settings.is_noread(&parcel.barcode) {
            info!(barcode = %parcel.barcode, "parcel_no_read");
            return Ok(Correlation::Decided(SortDecision::new(
                None,
                settings.exception_chute,
                Outcome::NoRead,
                non_empty(&parcel.barcode),
                parcel.arrived_at_ms,
            )));
        }

        match self.claim_eligible(parcel, settings)? {
            Some(entry) => Ok(Correlation::Decided(self.decide_claimed(entry, parcel, settings))),
            None => Ok(Correlation::NoEligibleSignal),
        }
    }

    /// Correlate without holding: no eligible signal resolves to NoMatch immediately
    pub fn decide(
        &self,
        parcel: &ParcelEvent,
        settings: &CorrelationSettings,
    ) -> Result<SortDecision, CorrelationError> {
        match self.correlate(parcel, settings)? {
            Correlation::Decided(decision) => Ok(decision),
            Correlation::NoEligibleSignal => Ok(self.no_match(parcel, settings)),
        }
    }

    /// Exception decision for a parcel no signal could be found for
    pub fn no_match(&self, parcel: &ParcelEvent, settings: &CorrelationSettings) -> SortDecision {
        warn!(
            barcode = %parcel.barcode,
            arrived_at_ms = %parcel.arrived_at_ms,
            pending = %self.pool.len(),
            "parcel_no_match"
        );
        SortDecision::new(
            None,
            settings.exception_chute,
            Outcome::NoMatch,
            Some(parcel.barcode.clone()),
            parcel.arrived_at_ms,
        )
    }

    fn claim_eligible(
        &self,
        parcel: &ParcelEvent,
        settings: &CorrelationSettings,
    ) -> Result<Option<WaitPoolEntry>, CorrelationError> {
        self.claim_eligible_from(parcel, settings, |_| self.pool.snapshot())
    }

    /// Claim loop over snapshots taken by `snapshot(attempt)`
    fn claim_eligible_from<F>(
        &self,
        parcel: &ParcelEvent,
        settings: &CorrelationSettings,
        mut snapshot: F,
    ) -> Result<Option<WaitPoolEntry>, CorrelationError>
    where
        F: FnMut(usize) -> Vec<PendingSignal>,
    {
        for attempt in 0..CLAIM_ATTEMPTS {
            // Snapshot is oldest first, so the first eligible signal is the earliest
            let candidate = snapshot(attempt).into_iter().find(|pending| {
                settings.in_window(lag_ms(parcel.arrived_at_ms, pending.signal.received_at_ms))
            });

            let Some(candidate) = candidate else {
                return Ok(None);
            };

            match self.pool.try_claim(candidate.signal.id, candidate.generation) {
                Some(entry) if entry.signal.id == candidate.signal.id => return Ok(Some(entry)),
                Some(entry) => {
                    let e = CorrelationError::Invariant {
                        requested: candidate.signal.id,
                        got: entry.signal.id,
                    };
                    self.metrics.record_invariant_violation();
                    log_invariant_violation(&parcel.barcode, &e);
                    return Err(e);
                }
                None => {
                    debug!(
                        signal_id = %candidate.signal.id,
                        attempt = %attempt,
                        "correlation_claim_lost"
                    );
                }
            }
        }
        Ok(None)
    }

    fn decide_claimed(
        &self,
        entry: WaitPoolEntry,
        parcel: &ParcelEvent,
        settings: &CorrelationSettings,
    ) -> SortDecision {
        entry.cancel.cancel();
        self.metrics.set_pool_size(self.pool.len());

        let signal = entry.signal;
        let lag = lag_ms(parcel.arrived_at_ms, signal.received_at_ms);
        self.metrics.record_match_lag(lag);

        let barcode = Some(parcel.barcode.clone());
        let bound = self.bindings.bind(
            signal.id,
            &parcel.barcode,
            epoch_ms(),
            settings.binding_retention_ms,
        );

        let (chute, outcome) = match bound {
            Ok(bind) => {
                if bind == BindOutcome::Reconfirmed {
                    debug!(signal_id = %signal.id, barcode = %parcel.barcode, "binding_reconfirmed");
                }
                let chute = match &self.rules {
                    Some(rules) => rules.chute_for(&parcel.barcode),
                    None => settings.rules.chute_for(&parcel.barcode),
                };
                match chute {
                    Some(chute) => (chute, Outcome::Matched),
                    None => {
                        warn!(barcode = %parcel.barcode, signal_id = %signal.id, "parcel_no_rule");
                        (settings.exception_chute, Outcome::NoRule)
                    }
                }
            }
            Err(e) => {
                warn!(
                    signal_id = %signal.id,
                    barcode = %parcel.barcode,
                    error = %e,
                    "binding_conflict"
                );
                (settings.exception_chute, Outcome::BindingConflict)
            }
        };

        debug!(
            signal_id = %signal.id,
            barcode = %parcel.barcode,
            lag_ms = %lag,
            chute = %chute,
            outcome = %outcome.as_str(),
            "parcel_correlated"
        );

        SortDecision::new(Some(signal.id), chute, outcome, barcode, parcel.arrived_at_ms)
    }
}

fn non_empty(barcode: &str) -> Option<String> {
    let trimmed = barcode.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// A parcel waiting for a signal that may still arrive
struct HeldParcel {
    parcel: ParcelEvent,
    settings: Arc<CorrelationSettings>,
    deadline: tokio::time::Instant,
    received: Instant,
}

/// Single task that turns parcel events into decisions
pub struct CorrelationLoop {
    correlator: Correlator,
    dispatch: DispatchQueue,
    metrics: Arc<Metrics>,
    parcel_rx: mpsc::Receiver<ParcelEvent>,
    signal_admitted: Arc<Notify>,
    settings_rx: watch::Receiver<Arc<CorrelationSettings>>,
    held: VecDeque<HeldParcel>,
}

impl CorrelationLoop {
    pub fn new(
        correlator: Correlator,
        dispatch: DispatchQueue,
        metrics: Arc<Metrics>,
        parcel_rx: mpsc::Receiver<ParcelEvent>,
        signal_admitted: Arc<Notify>,
        settings_rx: watch::Receiver<Arc<CorrelationSettings>>,
    ) -> Self {
        Self {
            correlator,
            dispatch,
            metrics,
            parcel_rx,
            signal_admitted,
            settings_rx,
            held: VecDeque::new(),
        }
    }

    /// Process parcels until the channel closes or shutdown is signalled
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("correlation_loop_started");

        loop {
            let next_deadline = self.held.iter().map(|h| h.deadline).min();
            let hold_timer = async move {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.signal_admitted.notified() => {
                    self.retry_held();
                }
                parcel = self.parcel_rx.recv() => {
                    let Some(parcel) = parcel else {
                        break;
                    };
                    self.handle_parcel(parcel);
                }
                _ = hold_timer => {
                    self.expire_held(tokio::time::Instant::now());
                }
            }
        }

        // Nothing is left undecided
        while let Some(held) = self.held.pop_front() {
            let decision = self.correlator.no_match(&held.parcel, &held.settings);
            self.finish(decision, &held.settings, held.received);
        }
        self.metrics.set_held_parcels(0);

        info!("correlation_loop_stopped");
    }

    fn handle_parcel(&mut self, parcel: ParcelEvent) {
        let received = Instant::now();
        let settings = self.settings_rx.borrow().clone();

        // Older held parcels get first pick of any newly admitted signal
        self.retry_held();

        match self.correlator.correlate(&parcel, &settings) {
            Ok(Correlation::Decided(decision)) => self.finish(decision, &settings, received),
            Ok(Correlation::NoEligibleSignal) => match settings.late_signal_grace() {
                Some(grace) => {
                    debug!(
                        barcode = %parcel.barcode,
                        grace_ms = %grace.as_millis(),
                        "parcel_held_for_late_signal"
                    );
                    self.held.push_back(HeldParcel {
                        parcel,
                        settings,
                        deadline: tokio::time::Instant::now() + grace,
                        received,
                    });
                    self.metrics.set_held_parcels(self.held.len());
                }
                None => {
                    let decision = self.correlator.no_match(&parcel, &settings);
                    self.finish(decision, &settings, received);
                }
            },
            // Unit of work aborted; already logged and counted
            Err(_) => {}
        }
    }

    /// Retry every held parcel, oldest first
    fn retry_held(&mut self) {
        if self.held.is_empty() {
            return;
        }

        let mut still_held = VecDeque::with_capacity(self.held.len());
        while let Some(held) = self.held.pop_front() {
            match self.correlator.correlate(&held.parcel, &held.settings) {
                Ok(Correlation::Decided(decision)) => {
                    self.finish(decision, &held.settings, held.received)
                }
                Ok(Correlation::NoEligibleSignal) => still_held.push_back(held),
                Err(_) => {}
            }
        }
        self.held = still_held;
        self.metrics.set_held_parcels(self.held.len());
    }

    /// Resolve held parcels whose grace period is over
    fn expire_held(&mut self, now: tokio::time::Instant) {
        let mut still_held = VecDeque::with_capacity(self.held.len());
        while let Some(held) = self.held.pop_front() {
            if held.deadline > now {
                still_held.push_back(held);
                continue;
            }
            // One last look before giving up
            let decision = match self.correlator.decide(&held.parcel, &held.settings) {
                Ok(decision) => decision,
                Err(_) => continue,
            };
            self.finish(decision, &held.settings, held.received);
        }
        self.held = still_held;
        self.metrics.set_held_parcels(self.held.len());
    }

    fn finish(&self, decision: SortDecision, settings: &CorrelationSettings, received: Instant) {
        self.metrics.record_parcel_processed(received.elapsed().as_micros() as u64);
        self.dispatch.submit(decision, settings.signal_timeout());
    }
}
