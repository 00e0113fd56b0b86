//! Domain models - core business types
//!
//! This module contains the canonical data types used throughout the system:
//! - `TriggerSignal` - a physical object crossed the trigger point
//! - `ParcelEvent` - a capture report (barcode, weight, dimensions, time)
//! - `SortDecision` - the terminal artifact of one correlation
//! - `Outcome` - how a correlation ended

pub mod types;

pub use types::{
    epoch_ms, Dimensions, Outcome, ParcelEvent, SignalId, SortDecision, TriggerSignal,
};
