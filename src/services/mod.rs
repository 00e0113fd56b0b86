//! Services - correlation logic and shared state
//!
//! This module contains the core services:
//! - `wait_pool` - Signals awaiting their parcel, claimed exactly once
//! - `timeout` - Per-signal timeout supervision and signal ingestion
//! - `binding` - Signal id to barcode single-assignment check
//! - `rules` - Barcode to chute lookup
//! - `correlator` - Windowed parcel/signal join and the correlation loop
//! - `dispatcher` - Sort command delivery via a worker pool

pub mod binding;
pub mod correlator;
pub mod dispatcher;
pub mod rules;
pub mod timeout;
pub mod wait_pool;

// Re-export commonly used types
pub use binding::{BindOutcome, BindingError, BindingValidator};
pub use correlator::{CorrelationError, CorrelationLoop, Correlator};
pub use dispatcher::{create_dispatch_pool, DispatchError, DispatchQueue, Dispatcher};
pub use rules::{ChuteRules, RuleTable};
pub use timeout::{run_signal_ingestion, TimeoutSupervisor};
pub use wait_pool::{WaitPool, WaitPoolEntry};
