//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `frame` - 8-byte device frame codec
//! - `device` - TCP/serial link to the actuation unit (read, write, reconnect)
//! - `acquisition` - TCP listener for parcel events from the camera/scale subsystem
//! - `sink` - Bounded notification queue and JSONL decision log
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod acquisition;
pub mod device;
pub mod frame;
pub mod prometheus;
pub mod sink;

// Re-export commonly used types
pub use acquisition::{start_acquisition_listener, AcquisitionListenerConfig};
pub use device::{create_device_link, DeviceHandle, DeviceLink, TransportConnector};
pub use frame::{DeviceFrame, FrameDecoder, FrameError};
pub use sink::{create_sink_channel, run_sink, DecisionLog, SinkSender};
