//! Byte layout of a flagged instruction stream
//!
//! Sizes follow the encoding the flags select: elided instructions take no
//! space, `SHORT_FORM` picks the short opcode, and `TAIL_CALL` adds the
//! `tail.` prefix. Offsets are indexed by stream position with one extra
//! slot for the end of the stream, so a label at an elided instruction lands
//! on the next kept one.

use crate::program::Entry;
use stackil_bytecode::core::instructions::Op;
use stackil_bytecode::core::opcodes::{InstructionFlags, Opcode, TAIL_PREFIX_SIZE};

/// Opcode an entry is encoded with under its current flags
pub fn form(op: &Op, flags: InstructionFlags) -> Opcode {
    let long = op.opcode();
    if flags.contains(InstructionFlags::SHORT_FORM) {
        long.short_form().unwrap_or(long)
    } else {
        long
    }
}

pub fn encoded_size(entry: &Entry) -> u32 {
    if entry.is(InstructionFlags::ELIDED) {
        return 0;
    }
    let op = &entry.instruction.op;
    let targets = match op {
        Op::Switch(targets) => targets.len(),
        _ => 0,
    };
    let prefix = if entry.is(InstructionFlags::TAIL_CALL) {
        TAIL_PREFIX_SIZE
    } else {
        0
    };
    prefix + form(op, entry.flags).size(targets)
}

/// Size of a branch in its short encoding
pub fn short_size(op: &Op) -> Option<u32> {
    op.opcode().short_form().map(|short| short.size(0))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    offsets: Vec<u32>,
    sizes: Vec<u32>,
}

impl Layout {
    pub fn compute(entries: &[Entry]) -> Self {
        let mut offsets = Vec::with_capacity(entries.len() + 1);
        let mut sizes = Vec::with_capacity(entries.len());
        let mut offset = 0u32;
        for entry in entries {
            let size = encoded_size(entry);
            offsets.push(offset);
            sizes.push(size);
            offset += size;
        }
        offsets.push(offset);
        Self { offsets, sizes }
    }

    /// Offset of stream position `at`; `at == len` is the end of the code
    pub fn offset(&self, at: usize) -> u32 {
        self.offsets[at]
    }

    pub fn size(&self, at: usize) -> u32 {
        self.sizes[at]
    }

    pub fn code_size(&self) -> u32 {
        self.offsets.last().copied().unwrap_or(0)
    }
}
