// src/io/socketcan/codec.rs
//
// Classic CAN frame codec for the Linux raw socket transport.
//
// Wire layout is the kernel's 16-byte struct can_frame:
//   can_id(4, host order) + len(1) + pad(3) + data(8)

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// SocketCAN protocol constants
pub mod consts {
    /// Size of classic CAN frame (struct can_frame)
    pub const CLASSIC_FRAME_SIZE: usize = 16;
    /// Maximum classic CAN payload
    pub const MAX_DATA_LEN: usize = 8;
    /// Offset of the payload inside struct can_frame
    pub const DATA_OFFSET: usize = 8;
    /// Extended ID flag in can_id
    pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
    /// RTR flag in can_id
    pub const CAN_RTR_FLAG: u32 = 0x4000_0000;
    /// Mask for 29-bit extended ID
    pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;
}

/// Wire buffer exchanged with the raw socket.
pub type RawFrame = [u8; consts::CLASSIC_FRAME_SIZE];

// ============================================================================
// Frame
// ============================================================================

/// Classic CAN frame. Bytes past `len` are always zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FrameRepr")]
pub struct Frame {
    id: u32,
    len: u8,
    data: [u8; consts::MAX_DATA_LEN],
}

/// Unchecked wire shape of `Frame`, validated on the way in.
#[derive(Deserialize)]
struct FrameRepr {
    id: u32,
    len: u8,
    data: [u8; consts::MAX_DATA_LEN],
}

impl TryFrom<FrameRepr> for Frame {
    type Error = BridgeError;

    fn try_from(repr: FrameRepr) -> Result<Self, Self::Error> {
        let len = repr.len as usize;
        if len > consts::MAX_DATA_LEN {
            return Err(BridgeError::InvalidFrame(format!(
                "data too long: {} bytes (max {})",
                len,
                consts::MAX_DATA_LEN
            )));
        }
        Frame::new(repr.id, &repr.data[..len])
    }
}

impl Frame {
    /// Build a frame, rejecting payloads longer than 8 bytes.
    pub fn new(id: u32, payload: &[u8]) -> Result<Self, BridgeError> {
        if payload.len() > consts::MAX_DATA_LEN {
            return Err(BridgeError::InvalidFrame(format!(
                "data too long: {} bytes (max {})",
                payload.len(),
                consts::MAX_DATA_LEN
            )));
        }

        let mut data = [0u8; consts::MAX_DATA_LEN];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Frame {
            id,
            len: payload.len() as u8,
            data,
        })
    }

    /// Raw 32-bit can_id, flags included
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Meaningful payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn is_extended(&self) -> bool {
        (self.id & consts::CAN_EFF_FLAG) != 0
    }
}

// ============================================================================
// Encode / Decode
// ============================================================================

/// Encode a frame into the 16-byte transport buffer.
/// Padding and unused payload bytes are zero.
pub fn encode_frame(frame: &Frame) -> RawFrame {
    let mut buf = [0u8; consts::CLASSIC_FRAME_SIZE];
    buf[0..4].copy_from_slice(&frame.id.to_ne_bytes());
    buf[4] = frame.len;
    buf[consts::DATA_OFFSET..].copy_from_slice(&frame.data);
    buf
}

/// Decode a frame from a transport buffer of at least 16 bytes.
///
/// A length byte above 8 is clamped, and payload bytes past the length are
/// dropped so the result satisfies the `Frame` invariant.
pub fn decode_frame(raw: &[u8]) -> Result<Frame, BridgeError> {
    if raw.len() < consts::CLASSIC_FRAME_SIZE {
        return Err(BridgeError::InvalidFrame(format!(
            "frame too short: {} bytes, need at least {}",
            raw.len(),
            consts::CLASSIC_FRAME_SIZE
        )));
    }

    let id = u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let len = (raw[4] as usize).min(consts::MAX_DATA_LEN);
    let start = consts::DATA_OFFSET;
    Frame::new(id, &raw[start..start + len])
}

// ============================================================================
// Tests
// ============================================================================
