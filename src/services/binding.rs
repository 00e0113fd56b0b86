//! Binding validator - single assignment of signal id to barcode
//!
//! A signal id binds to at most one barcode, and a barcode bound to one id
//! cannot move to another while that binding is retained. Bindings are
//! pruned after the retention period so wrapped-around ids become usable.

use crate::domain::types::SignalId;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// First binding for this id
    Created,
    /// Same id and barcode seen again
    Reconfirmed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BindingError {
    #[error("signal {id} already bound to barcode {existing}")]
    SignalBound { id: SignalId, existing: String },
    #[error("barcode {barcode} already bound to signal {existing}")]
    BarcodeBound { barcode: String, existing: SignalId },
}

#[derive(Debug)]
struct Binding {
    barcode: String,
    bound_at_ms: u64,
}

#[derive(Default)]
struct BindingTable {
    by_signal: FxHashMap<SignalId, Binding>,
    by_barcode: FxHashMap<String, SignalId>,
}

impl BindingTable {
    fn prune(&mut self, now_ms: u64, retention_ms: u64) {
        let before = self.by_signal.len();
        let by_barcode = &mut self.by_barcode;
        self.by_signal.retain(|_, binding| {
            let keep = now_ms.saturating_sub(binding.bound_at_ms) < retention_ms;
            if !keep {
                by_barcode.remove(&binding.barcode);
            }
            keep
        });

        let pruned = before - self.by_signal.len();
        if pruned > 0 {
            debug!(pruned = %pruned, remaining = %self.by_signal.len(), "bindings_pruned");
        }
    }
}

/// Shared binding map
#[derive(Default)]
pub struct BindingValidator {
    table: Mutex<BindingTable>,
}

impl BindingValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `barcode` to `id`, or confirm an identical existing binding
    pub fn bind(
        &self,
        id: SignalId,
        barcode: &str,
        now_ms: u64,
        retention_ms: u64,
    ) -> Result<BindOutcome, BindingError> {
        let mut table = self.table.lock();
        table.prune(now_ms, retention_ms);

        if let Some(existing) = table.by_signal.get(&id) {
            if existing.barcode == barcode {
                return Ok(BindOutcome::Reconfirmed);
            }
            return Err(BindingError::SignalBound { id, existing: existing.barcode.clone() });
        }

        if let Some(&existing) = table.by_barcode.get(barcode) {
            return Err(BindingError::BarcodeBound { barcode: barcode.to_string(), existing });
        }

        table.by_signal.insert(id, Binding { barcode: barcode.to_string(), bound_at_ms: now_ms });
        table.by_barcode.insert(barcode.to_string(), id);
        Ok(BindOutcome::Created)
    }

    /// Drop any binding held for `id`. Returns whether one existed.
    pub fn release(&self, id: SignalId) -> bool {
        let mut table = self.table.lock();
        match table.by_signal.remove(&id) {
            Some(binding) => {
                table.by_barcode.remove(&binding.barcode);
                true
            }
            None => false,
        }
    }

    pub fn barcode_for(&self, id: SignalId) -> Option<String> {
        self.table.lock().by_signal.get(&id).map(|b| b.barcode.clone())
    }

    pub fn len(&self) -> usize {
        self.table.lock().by_signal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETENTION: u64 = 10_000;

    #[test]
    fn test_create_then_reconfirm() {
        let bindings = BindingValidator::new();
        assert_eq!(bindings.bind(SignalId(7), "ABC123", 0, RETENTION), Ok(BindOutcome::Created));
        assert_eq!(
            bindings.bind(SignalId(7), "ABC123", 50, RETENTION),
            Ok(BindOutcome::Reconfirmed)
        );
        assert_eq!(bindings.barcode_for(SignalId(7)).as_deref(), Some("ABC123"));
    }

    #[test]
    fn test_conflicting_barcode_rejected() {
        let bindings = BindingValidator::new();
        bindings.bind(SignalId(7), "ABC123", 0, RETENTION).unwrap();

        let err = bindings.bind(SignalId(7), "XYZ999", 10, RETENTION).unwrap_err();
        assert_eq!(
            err,
            BindingError::SignalBound { id: SignalId(7), existing: "ABC123".to_string() }
        );
        // Original binding untouched
        assert_eq!(bindings.barcode_for(SignalId(7)).as_deref(), Some("ABC123"));
    }

    #[test]
    fn test_barcode_cannot_move_to_other_signal() {
        let bindings = BindingValidator::new();
        bindings.bind(SignalId(7), "ABC123", 0, RETENTION).unwrap();

        let err = bindings.bind(SignalId(8), "ABC123", 10, RETENTION).unwrap_err();
        assert_eq!(
            err,
            BindingError::BarcodeBound { barcode: "ABC123".to_string(), existing: SignalId(7) }
        );
    }

    #[test]
    fn test_release_frees_both_directions() {
        let bindings = BindingValidator::new();
        bindings.bind(SignalId(7), "ABC123", 0, RETENTION).unwrap();

        assert!(bindings.release(SignalId(7)));
        assert!(!bindings.release(SignalId(7)));
        assert_eq!(bindings.bind(SignalId(8), "ABC123", 1, RETENTION), Ok(BindOutcome::Created));
    }

    #[test]
    fn test_expired_bindings_pruned() {
        let bindings = BindingValidator::new();
        bindings.bind(SignalId(7), "ABC123", 0, RETENTION).unwrap();

        assert_eq!(
            bindings.bind(SignalId(7), "NEW001", RETENTION, RETENTION),
            Ok(BindOutcome::Created)
        );
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings.barcode_for(SignalId(7)).as_deref(), Some("NEW001"));
    }
}
