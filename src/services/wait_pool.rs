//! Wait pool - trigger signals awaiting their parcel
//!
//! Holds every admitted signal until exactly one of two consumers claims it:
//! the correlator (matched) or the signal's timeout task (timed out). A claim
//! is removal under the pool lock, so at most one caller ever gets the entry.
//!
//! Each admission carries a generation number. Signal ids are 16-bit device
//! counters and wrap around; claiming by `(id, generation)` keeps a stale
//! timer or stale snapshot from taking a newer signal that reused the id.

use crate::domain::types::{SignalId, TriggerSignal};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A pending signal plus the handle that cancels its timeout
#[derive(Debug, Clone)]
pub struct WaitPoolEntry {
    pub signal: TriggerSignal,
    /// Admission sequence number, unique for the life of the pool
    pub generation: u64,
    /// Cancels the timeout task; cancelled state means the entry was claimed
    pub cancel: CancellationToken,
}

/// Read-only view of a pending signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSignal {
    pub signal: TriggerSignal,
    pub generation: u64,
}

#[derive(Default)]
struct PoolInner {
    entries: FxHashMap<SignalId, WaitPoolEntry>,
    next_generation: u64,
}

/// Concurrent map of pending signals
#[derive(Default)]
pub struct WaitPool {
    inner: Mutex<PoolInner>,
}

impl WaitPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a signal. Returns the new entry, or `None` if the id is already pending.
    pub fn admit(&self, signal: TriggerSignal) -> Option<WaitPoolEntry> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.entries.get(&signal.id) {
            warn!(
                signal_id = %signal.id,
                pending_since_ms = %existing.signal.received_at_ms,
                received_at_ms = %signal.received_at_ms,
                "signal_duplicate_discarded"
            );
            return None;
        }

        inner.next_generation += 1;
        let entry = WaitPoolEntry {
            signal,
            generation: inner.next_generation,
            cancel: CancellationToken::new(),
        };
        inner.entries.insert(signal.id, entry.clone());
        Some(entry)
    }

    /// Admit a signal, `false` if a signal with the same id is already pending
    pub fn add(&self, signal: TriggerSignal) -> bool {
        self.admit(signal).is_some()
    }

    /// Claim whatever entry currently holds `id`
    pub fn try_remove(&self, id: SignalId) -> Option<WaitPoolEntry> {
        self.inner.lock().entries.remove(&id)
    }

    /// Claim `id` only if it is still the admission identified by `generation`
    pub fn try_claim(&self, id: SignalId, generation: u64) -> Option<WaitPoolEntry> {
        let mut inner = self.inner.lock();
        match inner.entries.get(&id) {
            Some(entry) if entry.generation == generation => inner.entries.remove(&id),
            _ => None,
        }
    }

    /// Pending signals ordered by receive time, oldest first (ties by admission order)
    pub fn snapshot(&self) -> Vec<PendingSignal> {
        let mut pending: Vec<PendingSignal> = {
            let inner = self.inner.lock();
            inner
                .entries
                .values()
                .map(|e| PendingSignal { signal: e.signal, generation: e.generation })
                .collect()
        };
        pending.sort_unstable_by_key(|p| (p.signal.received_at_ms, p.generation));
        pending
    }

    pub fn contains(&self, id: SignalId) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_duplicate_id_is_discarded_not_overwritten() {
        let pool = WaitPool::new();
        assert!(pool.add(TriggerSignal::new(7, 1000)));
        assert!(!pool.add(TriggerSignal::new(7, 1500)));

        let entry = pool.try_remove(SignalId(7)).unwrap();
        assert_eq!(entry.signal.received_at_ms, 1000);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_remove_succeeds_once() {
        let pool = WaitPool::new();
        pool.add(TriggerSignal::new(3, 10));

        assert!(pool.try_remove(SignalId(3)).is_some());
        assert!(pool.try_remove(SignalId(3)).is_none());
    }

    #[test]
    fn test_claim_rejects_stale_generation() {
        let pool = WaitPool::new();
        let first = pool.admit(TriggerSignal::new(5, 100)).unwrap();
        pool.try_remove(SignalId(5));

        // id reused after wrap-around
        let second = pool.admit(TriggerSignal::new(5, 9000)).unwrap();
        assert_ne!(first.generation, second.generation);

        assert!(pool.try_claim(SignalId(5), first.generation).is_none());
        assert!(pool.contains(SignalId(5)));
        assert!(pool.try_claim(SignalId(5), second.generation).is_some());
    }

    #[test]
    fn test_snapshot_ordered_oldest_first() {
        let pool = WaitPool::new();
        pool.add(TriggerSignal::new(1, 300));
        pool.add(TriggerSignal::new(2, 100));
        pool.add(TriggerSignal::new(3, 200));
        pool.add(TriggerSignal::new(4, 100));

        let ids: Vec<u16> = pool.snapshot().iter().map(|p| p.signal.id.0).collect();
        assert_eq!(ids, vec![2, 4, 3, 1]);
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let pool = Arc::new(WaitPool::new());
        let entry = pool.admit(TriggerSignal::new(9, 0)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = pool.clone();
                let generation = entry.generation;
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        pool.try_claim(SignalId(9), generation).is_some()
                    } else {
                        pool.try_remove(SignalId(9)).is_some()
                    }
                })
            })
            .collect();

        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|&won| won).count();
        assert_eq!(winners, 1);
    }
}
