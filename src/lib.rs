//! Sans-io implementation of a small serial command protocol.
//!
//! Every message on the wire is a frame:
//!
//! ```text
//! size: u16 LE | payload: [u8; size] | crc16(payload): u16 LE
//! ```
//!
//! The payload is `key ':' body`. A device side [`Node`] routes each body to
//! the [`Handler`] registered for its key. One handler ships with the crate,
//! [`RegisterAccess`], which reads and writes memory mapped registers on behalf
//! of a host. The host side lives in [`master`] (requires the `std` feature).
//!
//! A size field of `0xAA55` is not a frame but a resync marker, answered
//! with a raw `"OK"` after the node has restarted reception.
#![cfg_attr(not(feature = "std"), no_std)]

use crc::{Crc, CRC_16_XMODEM};

#[cfg(feature = "std")]
pub mod access_log;
mod buffer;
#[cfg(feature = "std")]
pub mod master;
mod nom_parser;
pub mod node;
pub mod peripheral;
pub mod regaccess;
pub mod registry;
pub mod types;

pub use node::{Node, ParseOutcome, Transmitter};
pub use peripheral::Peripheral;
pub use regaccess::{Instruction, MemoryAccess, RegisterAccess, Volatile};
pub use registry::{Handler, Registry};
pub use types::{Error, IntoKey, Key, Width};

/// Size field value that marks a resync request instead of a frame.
pub const SYNC_MARKER: u16 = 0xAA55;

/// What the master sends to recover a latched node: the marker, twice.
pub const SYNC_PATTERN: [u8; 4] = [0x55, 0xAA, 0x55, 0xAA];

/// Raw (unframed) acknowledgement of a resync.
pub const SYNC_ACK: &[u8; 2] = b"OK";

/// Bytes a frame adds around its payload: size field and CRC.
pub const FRAME_OVERHEAD: usize = 4;

/// Smallest legal payload.
pub const MIN_PAYLOAD: usize = 2;

/// Receive buffer size used when none is given.
pub const DEFAULT_RX_CAPACITY: usize = 1040;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// CRC-16/XMODEM (polynomial 0x1021, zero init), as computed by the
/// STM32 CRC unit configured for 16-bit output.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}
