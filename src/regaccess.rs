//! Register access: the built-in command that lets a host read and modify
//! device memory.
//!
//! The body of a register access frame starts with a little-endian 32-bit
//! word. Its upper 30 bits are the (4-byte aligned) address, the two low bits
//! select the operation together with the number of operand bytes that
//! follow:
//!
//! | operands | op | operation                                 | reply |
//! |----------|----|-------------------------------------------|-------|
//! | 0        | 0  | read 32 bits                              | 4     |
//! | 0        | 1  | read 8 bits                               | 1     |
//! | 0        | 2  | read 16 bits                              | 2     |
//! | 1        | 0  | set bit `n`                               |       |
//! | 1        | 1  | write 8 bits                              |       |
//! | 1        | 2  | clear bit `n`                             |       |
//! | 2        | 0  | write 16 bits                             |       |
//! | 4        | 0  | write 32 bits                             |       |
//! | 4        | 1  | OR with mask                              |       |
//! | 4        | 2  | AND with mask                             |       |
//! | 4        | 3  | write 32 bits                             |       |
//! | 8        | 0  | `(reg & !mask) \| value`                   |       |
//!
//! Anything else is ignored without a reply.

use arrayvec::ArrayVec;
use log::{debug, trace, warn};

use crate::node::Transmitter;
use crate::peripheral::Peripheral;
use crate::registry::Handler;
use crate::types::Width;

/// Key the register access handler is registered under.
pub const REGISTER_ACCESS_KEY: &str = "_";

const OP_MASK: u32 = 0b11;

/// Largest encoded instruction: address word, mask and value.
pub const MAX_INSTRUCTION_LEN: usize = 12;

/// An encoded instruction, ready to be put behind `"_:"`.
pub type Encoded = ArrayVec<u8, MAX_INSTRUCTION_LEN>;

/// Memory the register access handler operates on.
pub trait MemoryAccess {
    fn read_u8(&mut self, address: u32) -> u8;
    fn read_u16(&mut self, address: u32) -> u16;
    fn read_u32(&mut self, address: u32) -> u32;
    fn write_u8(&mut self, address: u32, value: u8);
    fn write_u16(&mut self, address: u32, value: u16);
    fn write_u32(&mut self, address: u32, value: u32);
}

/// Direct volatile access to the address space of the device.
#[derive(Debug)]
pub struct Volatile {
    _private: (),
}

impl Volatile {
    /// # Safety
    /// Every address a peer sends is dereferenced as is. The caller must
    /// make sure only trusted peers can reach the node and that every
    /// reachable address is valid for the access width used.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

macro_rules! volatile_access {
    ($read: ident, $write: ident, $t: ty) => {
        fn $read(&mut self, address: u32) -> $t {
            // SAFETY: guaranteed by the caller of `Volatile::new`.
            unsafe { core::ptr::read_volatile(address as usize as *const $t) }
        }

        fn $write(&mut self, address: u32, value: $t) {
            // SAFETY: guaranteed by the caller of `Volatile::new`.
            unsafe { core::ptr::write_volatile(address as usize as *mut $t, value) }
        }
    };
}

impl MemoryAccess for Volatile {
    volatile_access!(read_u8, write_u8, u8);
    volatile_access!(read_u16, write_u16, u16);
    volatile_access!(read_u32, write_u32, u32);
}

/// A decoded register access command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Instruction {
    Read { address: u32, width: Width },
    Write { address: u32, width: Width, value: u32 },
    SetBit { address: u32, bit: u8 },
    ClearBit { address: u32, bit: u8 },
    Or { address: u32, mask: u32 },
    And { address: u32, mask: u32 },
    /// `reg = (reg & !mask) | value`, `value` is not masked.
    Modify { address: u32, mask: u32, value: u32 },
}

fn le32(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .rev()
        .fold(0, |acc, b| acc << 8 | u32::from(*b))
}

fn bit_mask(bit: u8) -> Option<u32> {
    1u32.checked_shl(u32::from(bit))
}

impl Instruction {
    /// Decode a register access body. Returns `None` for combinations of
    /// operand length and op bits that have no meaning, and for bit indices
    /// above 31.
    pub fn decode(body: &[u8]) -> Option<Self> {
        let word = le32(body.get(..4)?);
        let operands = &body[4..];
        let address = word & !OP_MASK;

        let instruction = match (operands.len(), word & OP_MASK) {
            (0, 0) => Self::Read {
                address,
                width: Width::Word,
            },
            (0, 1) => Self::Read {
                address,
                width: Width::Byte,
            },
            (0, 2) => Self::Read {
                address,
                width: Width::Half,
            },
            (1, 0) => Self::SetBit {
                address,
                bit: operands[0],
            },
            (1, 1) => Self::Write {
                address,
                width: Width::Byte,
                value: operands[0].into(),
            },
            (1, 2) => Self::ClearBit {
                address,
                bit: operands[0],
            },
            (2, 0) => Self::Write {
                address,
                width: Width::Half,
                value: le32(operands),
            },
            (4, 0) | (4, 3) => Self::Write {
                address,
                width: Width::Word,
                value: le32(operands),
            },
            (4, 1) => Self::Or {
                address,
                mask: le32(operands),
            },
            (4, 2) => Self::And {
                address,
                mask: le32(operands),
            },
            (8, 0) => Self::Modify {
                address,
                mask: le32(&operands[..4]),
                value: le32(&operands[4..]),
            },
            _ => return None,
        };

        match instruction {
            Self::SetBit { bit, .. } | Self::ClearBit { bit, .. } if bit_mask(bit).is_none() => {
                None
            }
            _ => Some(instruction),
        }
    }

    /// Encode the instruction as a register access body. The address is
    /// truncated to 4-byte alignment.
    pub fn encode(&self) -> Encoded {
        let op = match *self {
            Self::Read {
                width: Width::Byte, ..
            }
            | Self::Write {
                width: Width::Byte, ..
            }
            | Self::Or { .. } => 1,
            Self::Read {
                width: Width::Half, ..
            }
            | Self::ClearBit { .. }
            | Self::And { .. } => 2,
            _ => 0,
        };

        let mut out = Encoded::new();
        let mut push = |bytes: &[u8]| out.extend(bytes.iter().copied());
        push(&((self.address() & !OP_MASK) | op).to_le_bytes());
        match *self {
            Self::Read { .. } => (),
            Self::Write { width, value, .. } => push(&value.to_le_bytes()[..width.bytes()]),
            Self::SetBit { bit, .. } | Self::ClearBit { bit, .. } => push(&[bit]),
            Self::Or { mask, .. } | Self::And { mask, .. } => push(&mask.to_le_bytes()),
            Self::Modify { mask, value, .. } => {
                push(&mask.to_le_bytes());
                push(&value.to_le_bytes());
            }
        }
        out
    }

    /// Pick the cheapest instruction that sets the bits of `mask` in the
    /// register at `address` to the ones in `value`. `None` if `mask` is
    /// empty, there is nothing to do then.
    pub fn for_masked_write(address: u32, mask: u32, value: u32) -> Option<Self> {
        let set = value & mask;
        let clear = mask & !value;
        let instruction = if mask == 0 {
            return None;
        } else if mask == u32::MAX {
            Self::Write {
                address,
                width: Width::Word,
                value,
            }
        } else if clear == 0 && set.count_ones() == 1 {
            Self::SetBit {
                address,
                bit: set.trailing_zeros() as u8,
            }
        } else if set == 0 && clear.count_ones() == 1 {
            Self::ClearBit {
                address,
                bit: clear.trailing_zeros() as u8,
            }
        } else if clear == 0 {
            Self::Or { address, mask: set }
        } else if set == 0 {
            Self::And {
                address,
                mask: !clear,
            }
        } else {
            Self::Modify {
                address,
                mask,
                value: set,
            }
        };
        Some(instruction)
    }

    pub const fn address(&self) -> u32 {
        match *self {
            Self::Read { address, .. }
            | Self::Write { address, .. }
            | Self::SetBit { address, .. }
            | Self::ClearBit { address, .. }
            | Self::Or { address, .. }
            | Self::And { address, .. }
            | Self::Modify { address, .. } => address,
        }
    }

    /// Number of payload bytes the node replies with.
    pub const fn reply_len(&self) -> usize {
        match *self {
            Self::Read { width, .. } => width.bytes(),
            _ => 0,
        }
    }

    /// Run the instruction against `memory`, returning the value read for
    /// [`Instruction::Read`].
    pub fn execute<M: MemoryAccess + ?Sized>(&self, memory: &mut M) -> Option<u32> {
        match *self {
            Self::Read { address, width } => {
                return Some(match width {
                    Width::Byte => memory.read_u8(address).into(),
                    Width::Half => memory.read_u16(address).into(),
                    Width::Word => memory.read_u32(address),
                })
            }
            Self::Write {
                address,
                width,
                value,
            } => match width {
                Width::Byte => memory.write_u8(address, value as u8),
                Width::Half => memory.write_u16(address, value as u16),
                Width::Word => memory.write_u32(address, value),
            },
            Self::SetBit { address, bit } => {
                if let Some(mask) = bit_mask(bit) {
                    let reg = memory.read_u32(address);
                    memory.write_u32(address, reg | mask);
                }
            }
            Self::ClearBit { address, bit } => {
                if let Some(mask) = bit_mask(bit) {
                    let reg = memory.read_u32(address);
                    memory.write_u32(address, reg & !mask);
                }
            }
            Self::Or { address, mask } => {
                let reg = memory.read_u32(address);
                memory.write_u32(address, reg | mask);
            }
            Self::And { address, mask } => {
                let reg = memory.read_u32(address);
                memory.write_u32(address, reg & mask);
            }
            Self::Modify {
                address,
                mask,
                value,
            } => {
                let reg = memory.read_u32(address);
                memory.write_u32(address, (reg & !mask) | value);
            }
        }
        None
    }
}

/// Command handler executing [`Instruction`]s on a [`MemoryAccess`].
///
/// Reads are answered with the value, little-endian, in as many bytes as
/// were read. Everything else is silent.
#[derive(Debug)]
pub struct RegisterAccess<M> {
    memory: M,
}

impl<M: MemoryAccess> RegisterAccess<M> {
    pub const fn new(memory: M) -> Self {
        Self { memory }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    pub fn into_inner(self) -> M {
        self.memory
    }
}

impl<M: MemoryAccess, P: Peripheral> Handler<P> for RegisterAccess<M> {
    fn handle(&mut self, body: &[u8], tx: &mut Transmitter<'_, P>) {
        let instruction = match Instruction::decode(body) {
            Some(instruction) => instruction,
            None => {
                trace!("Ignoring register access body of {} bytes", body.len());
                return;
            }
        };
        debug!("Register access: {:x?}", instruction);

        if let Some(value) = instruction.execute(&mut self.memory) {
            let reply = value.to_le_bytes();
            if let Err(err) = tx.transmit(&reply[..instruction.reply_len()]) {
                warn!("Register access reply failed: {}", err);
            }
        }
    }
}
