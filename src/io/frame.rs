//! Device wire protocol (actuation unit <-> sorter core)
//!
//! Protocol:
//! - Fixed 8-byte frames: [Start][Function][IdHigh][IdLow][Rsv0][Rsv1][Payload][Checksum]
//! - Start code: 0xAA
//! - Functions: 0x01 signal report (device->core), 0x02 sort command (core->device),
//!   0x03 command feedback (device->core, Rsv0 = error code, Payload = chute executed)
//! - Checksum: constant 0x55 sentinel, not a computed CRC

use crate::domain::types::SignalId;
use bytes::{Buf, BytesMut};
use thiserror::Error;

pub const FRAME_LEN: usize = 8;
pub const START_CODE: u8 = 0xAA;
pub const CHECKSUM: u8 = 0x55;

pub const FN_SIGNAL_REPORT: u8 = 0x01;
pub const FN_SORT_COMMAND: u8 = 0x02;
pub const FN_FEEDBACK: u8 = 0x03;

/// Feedback error code meaning the command executed normally
pub const FEEDBACK_OK: u8 = 0x00;

/// Upper bound on buffered bytes while waiting for a start code
const MAX_BUFFERED: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid frame length {0}, expected 8")]
    Length(usize),
    #[error("invalid start code 0x{0:02X}")]
    StartCode(u8),
    #[error("invalid checksum byte 0x{0:02X}")]
    Checksum(u8),
    #[error("unknown function code 0x{0:02X}")]
    UnknownFunction(u8),
}

/// A decoded device frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFrame {
    /// A physical object crossed the trigger point
    SignalReport { id: SignalId },
    /// Divert the object carrying `id` to `chute`
    SortCommand { id: SignalId, chute: u8 },
    /// Result of a previously sent sort command
    Feedback { id: SignalId, error_code: u8, chute: u8 },
}

impl DeviceFrame {
    pub fn function_code(&self) -> u8 {
        match self {
            DeviceFrame::SignalReport { .. } => FN_SIGNAL_REPORT,
            DeviceFrame::SortCommand { .. } => FN_SORT_COMMAND,
            DeviceFrame::Feedback { .. } => FN_FEEDBACK,
        }
    }

    pub fn signal_id(&self) -> SignalId {
        match self {
            DeviceFrame::SignalReport { id }
            | DeviceFrame::SortCommand { id, .. }
            | DeviceFrame::Feedback { id, .. } => *id,
        }
    }

    /// Serialize into the fixed 8-byte wire layout
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let [id_high, id_low] = self.signal_id().0.to_be_bytes();
        let (reserved0, payload) = match *self {
            DeviceFrame::SignalReport { .. } => (0x00, 0x00),
            DeviceFrame::SortCommand { chute, .. } => (0x00, chute),
            DeviceFrame::Feedback { error_code, chute, .. } => (error_code, chute),
        };

        [START_CODE, self.function_code(), id_high, id_low, reserved0, 0x00, payload, CHECKSUM]
    }

    /// Parse exactly one frame
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() != FRAME_LEN {
            return Err(FrameError::Length(data.len()));
        }
        if data[0] != START_CODE {
            return Err(FrameError::StartCode(data[0]));
        }
        if data[7] != CHECKSUM {
            return Err(FrameError::Checksum(data[7]));
        }

        let id = SignalId(u16::from_be_bytes([data[2], data[3]]));
        match data[1] {
            FN_SIGNAL_REPORT => Ok(DeviceFrame::SignalReport { id }),
            FN_SORT_COMMAND => Ok(DeviceFrame::SortCommand { id, chute: data[6] }),
            FN_FEEDBACK => Ok(DeviceFrame::Feedback { id, error_code: data[4], chute: data[6] }),
            other => Err(FrameError::UnknownFunction(other)),
        }
    }
}

/// Streaming decoder that accumulates bytes across reads.
///
/// Serial and TCP transports both deliver frames in arbitrary chunks
/// (e.g. 5 bytes + 3 bytes), so partial data is kept for the next read.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(256) }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_BUFFERED {
            let excess = self.buf.len() - MAX_BUFFERED;
            tracing::debug!(discarded = excess, "frame_buffer_overflow");
            self.buf.advance(excess);
        }
    }

    /// Bytes waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next frame in the buffer.
    ///
    /// Returns `None` when more data is needed. A malformed frame yields
    /// `Some(Err(_))` and only its start byte is consumed so the decoder can
    /// resynchronise on a start code inside the bad bytes.
    pub fn next_frame(&mut self) -> Option<Result<DeviceFrame, FrameError>> {
        self.synchronize();

        if self.buf.len() < FRAME_LEN {
            return None;
        }

        match DeviceFrame::decode(&self.buf[..FRAME_LEN]) {
            Ok(frame) => {
                self.buf.advance(FRAME_LEN);
                Some(Ok(frame))
            }
            Err(e) => {
                self.buf.advance(1);
                Some(Err(e))
            }
        }
    }

    /// Discard any bytes before the first start code
    fn synchronize(&mut self) {
        if self.buf.is_empty() || self.buf[0] == START_CODE {
            return;
        }

        match self.buf.iter().position(|&b| b == START_CODE) {
            Some(start_idx) => {
                tracing::debug!(discarded = start_idx, "frame_sync_discarded_bytes");
                self.buf.advance(start_idx);
            }
            None => {
                tracing::debug!(discarded = self.buf.len(), "frame_sync_no_start_code");
                self.buf.clear();
            }
        }
    }
}
