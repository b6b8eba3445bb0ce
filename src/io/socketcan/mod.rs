// src/io/socketcan/mod.rs
//
// SocketCAN transport for Linux native CAN interfaces.
//
// Requires the interface to be configured first:
//   sudo ip link set can0 up type can bitrate 500000
//
// The socket provider is only fully functional on Linux.

pub mod codec;
#[cfg(test)]
pub(crate) mod mock;
pub mod socket;

pub use codec::{consts, decode_frame, encode_frame, Frame, RawFrame};
pub use socket::{is_timeout, open_bound, CanSocket, RawSocketProvider, SocketProvider};
