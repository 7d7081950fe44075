//! Label resolution and the backend boundary
//!
//! [`Program::resolve`] drops elided instructions, picks each instruction's
//! encoded form from its flags, and resolves every label to an instruction
//! index, byte offset and displacement. The resulting [`FinalizedStream`]
//! is everything a [`TargetBackend`] needs; no bytes are produced here.

use crate::layout::{self, Layout};
use crate::program::Program;
use crate::regions::HandlerKind;
use stackil_bytecode::core::handles::Label;
use stackil_bytecode::core::instructions::Op;
use stackil_bytecode::core::metadata::{CallSignature, FieldRef, MethodRef, MethodSignature, TypeRef};
use stackil_bytecode::core::opcodes::{InstructionFlags, Opcode};
use stackil_bytecode::core::types::VerificationType;
use std::panic::Location;
use std::sync::Arc;
use tracing::debug;

/// A branch target after resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub label: String,
    /// Index into [`FinalizedStream::instructions`]
    pub index: usize,
    pub offset: u32,
    /// Relative to the end of the branching instruction
    pub displacement: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(Arc<str>),
    Local(u16),
    Argument(u16),
    Field(FieldRef),
    Type(VerificationType),
    Class(TypeRef),
    Method(MethodRef),
    Signature(CallSignature),
    Branch(ResolvedTarget),
    Switch(Vec<ResolvedTarget>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInstruction {
    /// Position in the verified stream before elision
    pub source: usize,
    /// Encoded form chosen by the optimizer
    pub opcode: Opcode,
    pub operand: Operand,
    pub offset: u32,
    pub size: u32,
    pub flags: InstructionFlags,
    pub location: &'static Location<'static>,
}

impl ResolvedInstruction {
    pub fn is_tail_call(&self) -> bool {
        self.flags.contains(InstructionFlags::TAIL_CALL)
    }

    pub fn targets(&self) -> Vec<&ResolvedTarget> {
        match &self.operand {
            Operand::Branch(target) => vec![target],
            Operand::Switch(targets) => targets.iter().collect(),
            _ => Vec::new(),
        }
    }
}

/// Handler table row in finalized instruction indices (exclusive ends) and
/// byte offsets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHandler {
    pub kind: HandlerKind,
    pub try_start: usize,
    pub try_end: usize,
    pub handler_start: usize,
    pub handler_end: usize,
    pub try_offset: u32,
    pub try_length: u32,
    pub handler_offset: u32,
    pub handler_length: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedStream {
    pub instructions: Vec<ResolvedInstruction>,
    /// Innermost handlers first
    pub handlers: Vec<ResolvedHandler>,
    /// Declared type of each local slot
    pub locals: Vec<VerificationType>,
    pub signature: MethodSignature,
    pub max_stack: usize,
    pub code_size: u32,
}

impl FinalizedStream {
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Index of the instruction starting at byte `offset`
    pub fn index_at_offset(&self, offset: u32) -> Option<usize> {
        self.instructions
            .binary_search_by_key(&offset, |instruction| instruction.offset)
            .ok()
    }
}

/// Consumer of a finalized stream: an encoder, a loader, an interpreter
pub trait TargetBackend {
    type Output;
    type Error: std::error::Error + Send + Sync + 'static;

    fn emit(&mut self, stream: &FinalizedStream) -> Result<Self::Output, Self::Error>;
}

impl Program {
    /// Resolve labels against the current flags
    pub fn resolve(&self) -> FinalizedStream {
        let layout = Layout::compute(&self.entries);

        // kept[p] is the finalized index of the first kept instruction at or
        // after stream position p.
        let mut kept = Vec::with_capacity(self.entries.len() + 1);
        let mut count = 0;
        for entry in &self.entries {
            kept.push(count);
            if !entry.is(InstructionFlags::ELIDED) {
                count += 1;
            }
        }
        kept.push(count);

        let target = |label: Label, end: u32| -> ResolvedTarget {
            let at = self.label_position(label).unwrap_or(self.entries.len());
            let offset = layout.offset(at);
            ResolvedTarget {
                label: self.label_name(label).to_string(),
                index: kept[at],
                offset,
                displacement: (i64::from(offset) - i64::from(end)) as i32,
            }
        };

        let mut instructions = Vec::with_capacity(count);
        let mut max_stack = 0;
        for (source, entry) in self.entries.iter().enumerate() {
            if entry.is(InstructionFlags::ELIDED) {
                continue;
            }
            max_stack = max_stack
                .max(entry.stack_before.len())
                .max(entry.stack_after.len());

            let offset = layout.offset(source);
            let size = layout.size(source);
            let end = offset + size;
            let op = &entry.instruction.op;
            let operand = match op {
                Op::Branch { target: label, .. } | Op::Leave(label) => {
                    Operand::Branch(target(*label, end))
                }
                Op::Switch(labels) => {
                    Operand::Switch(labels.iter().map(|&label| target(label, end)).collect())
                }
                _ => self.operand(op),
            };
            instructions.push(ResolvedInstruction {
                source,
                opcode: layout::form(op, entry.flags),
                operand,
                offset,
                size,
                flags: entry.flags,
                location: entry.instruction.location,
            });
        }

        let handlers = self
            .handlers
            .iter()
            .map(|record| ResolvedHandler {
                kind: record.kind.clone(),
                try_start: kept[record.try_start],
                try_end: kept[record.try_end],
                handler_start: kept[record.handler_start],
                handler_end: kept[record.handler_end],
                try_offset: layout.offset(record.try_start),
                try_length: layout.offset(record.try_end) - layout.offset(record.try_start),
                handler_offset: layout.offset(record.handler_start),
                handler_length: layout.offset(record.handler_end)
                    - layout.offset(record.handler_start),
            })
            .collect();

        debug!(
            instructions = instructions.len(),
            code_size = layout.code_size(),
            max_stack,
            "resolved stream"
        );
        FinalizedStream {
            instructions,
            handlers,
            locals: self.slot_types.clone(),
            signature: self.signature.clone(),
            max_stack,
            code_size: layout.code_size(),
        }
    }

    fn operand(&self, op: &Op) -> Operand {
        match op {
            Op::LdcI4(value) => Operand::Int32(*value),
            Op::LdcI8(value) => Operand::Int64(*value),
            Op::LdcR4(value) => Operand::Float32(*value),
            Op::LdcR8(value) => Operand::Float64(*value),
            Op::LdStr(text) => Operand::String(text.clone()),
            Op::LdLoc(local) | Op::StLoc(local) | Op::LdLocA(local) => {
                let slot = self
                    .locals
                    .get(local.index())
                    .map(|info| info.slot)
                    .unwrap_or_default();
                Operand::Local(slot)
            }
            Op::LdArg(index) | Op::StArg(index) | Op::LdArgA(index) => Operand::Argument(*index),
            Op::LdFld(field) | Op::StFld(field) | Op::LdSFld(field) | Op::StSFld(field) => {
                Operand::Field(field.clone())
            }
            Op::NewArr(ty) | Op::LdElem(ty) | Op::StElem(ty) | Op::LdInd(ty) | Op::StInd(ty) => {
                Operand::Type(ty.clone())
            }
            Op::CastClass(ty)
            | Op::IsInst(ty)
            | Op::Box(ty)
            | Op::UnboxAny(ty)
            | Op::InitObj(ty) => Operand::Class(ty.clone()),
            Op::NewObj(method) | Op::Call(method) | Op::CallVirt(method) | Op::LdFtn(method) => {
                Operand::Method(method.clone())
            }
            Op::CallIndirect(sig) => Operand::Signature(sig.clone()),
            Op::Nop
            | Op::LdNull
            | Op::Dup
            | Op::Pop
            | Op::Binary(_)
            | Op::Bitwise(_)
            | Op::Shift(_)
            | Op::Neg
            | Op::Not
            | Op::Compare(_)
            | Op::Convert(_)
            | Op::Branch { .. }
            | Op::Switch(_)
            | Op::Leave(_)
            | Op::Ret
            | Op::Throw
            | Op::Rethrow
            | Op::EndFinally
            | Op::LdLen => Operand::None,
        }
    }
}
