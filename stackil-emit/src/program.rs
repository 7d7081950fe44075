//! Verified instruction stream
//!
//! A [`Program`] is what an [`Emitter`](crate::Emitter) hands over once every
//! deferred check has passed. Its entries never change again; the optimizer
//! only toggles their [`InstructionFlags`], and [`Program::resolve`] turns the
//! current flags into a [`FinalizedStream`](crate::FinalizedStream).

use crate::cfg::Cfg;
use crate::config::OptimizerConfig;
use crate::optimizer::{self, OptimizationReport};
use crate::regions::{HandlerKind, HandlerRecord, ScopeId};
use crate::stack::StackState;
use stackil_bytecode::core::handles::Label;
use stackil_bytecode::core::instructions::Instruction;
use stackil_bytecode::core::metadata::{MethodSignature, TypeProvider};
use stackil_bytecode::core::opcodes::InstructionFlags;
use stackil_bytecode::core::types::VerificationType;
use std::fmt;
use std::sync::Arc;

/// One appended instruction with the state it was verified against
#[derive(Debug, Clone)]
pub struct Entry {
    pub instruction: Instruction,
    pub flags: InstructionFlags,
    /// Region scope the instruction was placed in
    pub scope: ScopeId,
    pub stack_before: StackState,
    /// Stack handed to the successors; branch targets receive the same
    /// state, `leave` and `endfinally` hand over an empty stack
    pub stack_after: StackState,
}

impl Entry {
    pub fn is(&self, flag: InstructionFlags) -> bool {
        self.flags.contains(flag)
    }

    /// `true` when the next instruction may run after this one
    pub fn falls_through(&self) -> bool {
        !self.instruction.op.is_unconditional_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramLabel {
    pub name: String,
    pub position: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramLocal {
    pub name: String,
    pub slot: u16,
    pub ty: VerificationType,
}

#[derive(Clone)]
pub struct Program {
    pub(crate) entries: Vec<Entry>,
    pub(crate) labels: Vec<ProgramLabel>,
    pub(crate) handlers: Vec<HandlerRecord>,
    pub(crate) locals: Vec<ProgramLocal>,
    pub(crate) slot_types: Vec<VerificationType>,
    pub(crate) signature: MethodSignature,
    pub(crate) types: Arc<dyn TypeProvider>,
}

impl Program {
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn labels(&self) -> &[ProgramLabel] {
        &self.labels
    }

    pub fn label_position(&self, label: Label) -> Option<usize> {
        self.labels.get(label.index()).and_then(|info| info.position)
    }

    pub fn label_name(&self, label: Label) -> &str {
        self.labels
            .get(label.index())
            .map(|info| info.name.as_str())
            .unwrap_or("?")
    }

    pub fn handlers(&self) -> &[HandlerRecord] {
        &self.handlers
    }

    pub fn locals(&self) -> &[ProgramLocal] {
        &self.locals
    }

    /// Declared type of every local slot
    pub fn slot_types(&self) -> &[VerificationType] {
        &self.slot_types
    }

    pub fn signature(&self) -> &MethodSignature {
        &self.signature
    }

    pub fn types(&self) -> &dyn TypeProvider {
        &*self.types
    }

    pub fn cfg(&self) -> Cfg {
        let roots = self.handlers.iter().map(|handler| handler.handler_start);
        Cfg::build(&self.entries, |label| self.label_position(label), roots)
    }

    /// Initial stack of every handler entry point
    pub(crate) fn handler_entries(&self) -> impl Iterator<Item = (usize, StackState)> + '_ {
        self.handlers.iter().map(|handler| {
            let stack = match &handler.kind {
                HandlerKind::Catch(filter) => {
                    StackState::from_top([VerificationType::Object(filter.clone())])
                }
                HandlerKind::Finally => StackState::new(),
            };
            (handler.handler_start, stack)
        })
    }

    /// Number of instructions the finalized stream will contain
    pub fn kept_len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| !entry.is(InstructionFlags::ELIDED))
            .count()
    }

    /// Run the optimizer passes `config` enables. Every pass recomputes its
    /// flag from scratch, so optimizing again yields the same flags.
    pub fn optimize(&mut self, config: &OptimizerConfig) -> OptimizationReport {
        optimizer::run(self, config)
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("entries", &self.entries)
            .field("labels", &self.labels)
            .field("handlers", &self.handlers)
            .field("locals", &self.locals)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}
