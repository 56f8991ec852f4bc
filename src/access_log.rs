//! Recording of register accesses as C statements.
//!
//! A [`Master`](crate::master::Master) with logging enabled records every
//! register read, write and wait it performs. [`AccessLog::render()`] turns
//! the recording into C code for the same sequence of accesses, ready to be
//! `#include`d in firmware. Consecutive 32-bit writes to one register are
//! merged into the smallest statement that has the combined effect. Loops
//! and branches of the host program are not recorded.
//!
//! ```text
//! *(volatile uint32_t*)0x40021018 |= 1u << 2; // RCC.APB2ENR.IOPAEN = 0b1
//! volatile uint32_t* _reg = (volatile uint32_t*)0x40010800;
//! *_reg = (*_reg & ~0x000000F0) | 0x00000030; // GPIOA.CRL.MODE1 = 0b0011
//! ```

use std::io::{self, Write};

use crate::master::extract_bits;
use crate::regaccess::Instruction;
use crate::types::Width;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Access {
    Read {
        address: u32,
        width: Width,
        comment: String,
    },
    Write {
        address: u32,
        mask: u32,
        value: u32,
        width: Width,
        comment: String,
    },
    Wait {
        address: u32,
        mask: u32,
        value: u32,
        comment: String,
    },
    Barrier,
}

/// Accesses recorded by a [`Master`](crate::master::Master).
#[derive(Debug, Default, Clone)]
pub struct AccessLog {
    accesses: Vec<Access>,
    label: Option<String>,
    waiting: bool,
}

fn hex(value: u32) -> String {
    format!("0x{:08X}", value)
}

/// Field value as written in comments: decimal for whole registers, binary
/// with one digit per mask bit for fields.
fn field_repr(value: u32, mask: u32) -> String {
    if mask == u32::MAX {
        value.to_string()
    } else {
        format!(
            "0b{:0width$b}",
            extract_bits(value, mask),
            width = mask.count_ones() as usize
        )
    }
}

const fn bits(width: Width) -> usize {
    width.bytes() * 8
}

/// Builds the output, one statement and comment per line.
#[derive(Default)]
struct Code {
    lines: Vec<(String, String)>,
    declared: bool,
}

impl Code {
    fn push(&mut self, statement: String, comment: String) {
        self.lines.push((statement, comment));
    }

    /// Point `_reg` at `address`, declaring it the first time.
    fn point_reg(&mut self, address: u32) {
        let decl = if self.declared { "" } else { "volatile uint32_t* " };
        self.declared = true;
        self.push(
            format!("{}_reg = (volatile uint32_t*){};", decl, hex(address)),
            String::new(),
        );
    }

    /// Emit a merged 32-bit write, with the comments of every write it covers.
    fn masked_write(&mut self, address: u32, mask: u32, value: u32, comments: Vec<String>) {
        let reg = format!("*(volatile uint32_t*){}", hex(address));
        let statement = match Instruction::for_masked_write(address, mask, value) {
            Some(Instruction::Write { value, .. }) => format!("{} = {};", reg, value),
            Some(Instruction::SetBit { bit, .. }) => format!("{} |= 1u << {};", reg, bit),
            Some(Instruction::ClearBit { bit, .. }) => format!("{} &= ~(1u << {});", reg, bit),
            Some(Instruction::Or { mask, .. }) => format!("{} |= {};", reg, hex(mask)),
            Some(Instruction::And { mask, .. }) => format!("{} &= ~{};", reg, hex(!mask)),
            Some(Instruction::Modify { mask, value, .. }) => {
                self.point_reg(address);
                format!("*_reg = (*_reg & ~{}) | {};", hex(mask), hex(value))
            }
            Some(Instruction::Read { .. }) | None => return,
        };

        let mut comments = comments.into_iter();
        self.push(statement, comments.next().unwrap_or_default());
        for comment in comments {
            self.push(String::new(), comment);
        }
    }

    fn write_to<W: Write>(&self, mut out: W) -> io::Result<()> {
        let width = self
            .lines
            .iter()
            .filter(|(_, comment)| !comment.is_empty())
            .map(|(statement, _)| statement.len())
            .max()
            .unwrap_or(0);

        for (statement, comment) in &self.lines {
            if comment.is_empty() {
                writeln!(out, "{}", statement)?;
            } else {
                writeln!(out, "{:width$} // {}", statement, comment, width = width)?;
            }
        }
        Ok(())
    }
}

/// A 32-bit write waiting to be merged with the next ones.
struct Pending {
    address: u32,
    mask: u32,
    value: u32,
    comments: Vec<String>,
}

impl AccessLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the register or field of the next access. The name shows up in
    /// the comment of the generated statement.
    pub fn label(&mut self, name: impl Into<String>) {
        self.label = Some(name.into());
    }

    /// Stop merging writes across this point.
    pub fn barrier(&mut self) {
        self.accesses.push(Access::Barrier);
    }

    pub fn len(&self) -> usize {
        self.accesses
            .iter()
            .filter(|access| **access != Access::Barrier)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_label(&mut self) -> String {
        self.label.take().unwrap_or_default()
    }

    pub(crate) fn read(&mut self, address: u32, width: Width) {
        if self.waiting {
            return;
        }
        let comment = self.take_label();
        self.accesses.push(Access::Read {
            address,
            width,
            comment,
        });
    }

    /// Record a write of `value` to the bits of `mask`. Only the whole
    /// register mask is meaningful for byte and half word writes.
    pub(crate) fn write(&mut self, address: u32, mask: u32, value: u32, width: Width) {
        let comment = match self.take_label() {
            label if label.is_empty() => label,
            label => format!("{} = {}", label, field_repr(value, mask)),
        };
        self.accesses.push(Access::Write {
            address,
            mask,
            value,
            width,
            comment,
        });
    }

    /// Reads done while polling are not recorded one by one.
    pub(crate) fn begin_wait(&mut self) {
        self.waiting = true;
    }

    /// Record a finished wait for the bits of `mask` to equal `value`
    /// (in place, not right aligned).
    pub(crate) fn end_wait(&mut self, address: u32, mask: u32, value: u32) {
        self.waiting = false;
        let comment = match self.take_label() {
            label if label.is_empty() => label,
            label => format!("{} != {}", label, field_repr(value, mask)),
        };
        self.accesses.push(Access::Wait {
            address,
            mask,
            value,
            comment,
        });
    }

    pub(crate) fn abort_wait(&mut self) {
        self.waiting = false;
        self.label = None;
    }

    /// Write the recording as C statements, one per line.
    pub fn render<W: Write>(&self, out: W) -> io::Result<()> {
        let mut code = Code::default();
        let mut pending: Option<Pending> = None;

        let flush = |code: &mut Code, pending: &mut Option<Pending>| {
            if let Some(p) = pending.take() {
                code.masked_write(p.address, p.mask, p.value, p.comments);
            }
        };

        for access in &self.accesses {
            match access {
                Access::Write {
                    address,
                    mask,
                    value,
                    width: Width::Word,
                    comment,
                } => {
                    if pending.as_ref().map_or(false, |p| p.address != *address) {
                        flush(&mut code, &mut pending);
                    }
                    let p = pending.get_or_insert_with(|| Pending {
                        address: *address,
                        mask: 0,
                        value: 0,
                        comments: Vec::new(),
                    });
                    p.value = (p.value & !mask) | (value & mask);
                    p.mask |= mask;
                    if !comment.is_empty() {
                        p.comments.push(comment.clone());
                    }
                }
                Access::Write {
                    address,
                    value,
                    width,
                    comment,
                    ..
                } => {
                    flush(&mut code, &mut pending);
                    code.push(
                        format!(
                            "*(volatile uint{}_t*){} = {};",
                            bits(*width),
                            hex(*address),
                            value
                        ),
                        comment.clone(),
                    );
                }
                Access::Read {
                    address,
                    width,
                    comment,
                } => {
                    flush(&mut code, &mut pending);
                    code.push(
                        format!("(void) *(volatile uint{}_t*){};", bits(*width), hex(*address)),
                        comment.clone(),
                    );
                }
                Access::Wait {
                    address,
                    mask,
                    value,
                    comment,
                } => {
                    flush(&mut code, &mut pending);
                    code.point_reg(*address);
                    code.push(
                        format!("while ((*_reg & {}) != {});", hex(*mask), hex(*value)),
                        comment.clone(),
                    );
                }
                Access::Barrier => flush(&mut code, &mut pending),
            }
        }
        flush(&mut code, &mut pending);

        code.write_to(out)
    }
}
