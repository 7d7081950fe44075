//! Verifying instruction emitter
//!
//! [`Emitter`] is the build context for one method body. Every append runs
//! the instruction's stack-effect rule against the tracked stack, records
//! branch shapes against their labels, and enforces the exception-region
//! rules before the instruction is kept. The first verification failure
//! poisons the emitter; ownership, released-local and argument-range errors
//! are reported eagerly and leave it usable.
//!
//! ```ignore
//! let mut il = Emitter::new(MethodSignature::new([], Some(VerificationType::Int32)), types);
//! il.ldc_i4(1)?.ldc_i4(2)?.add()?.ret()?;
//! let stream = il.finalize()?;
//! ```

use crate::cfg::Cfg;
use crate::config::EmitterConfig;
use crate::diagnostics;
use crate::error::{BadPath, EmitError, FailureContext, RegionRule, Result};
use crate::finalize::{FinalizedStream, TargetBackend};
use crate::labels::{BranchGraph, BranchKind, LabelFault};
use crate::locals::LocalArena;
use crate::program::{Entry, Program, ProgramLabel, ProgramLocal};
use crate::regions::{HandlerKind, Phase, RegionManager, ScopeId, ScopeKind};
use crate::stack::{ShapeDivergence, StackFault, StackState};
use crate::verifier::{self, Fault, VerifyEnv};
use stackil_bytecode::core::handles::{BuilderId, ExceptionBlock, Label, Local};
use stackil_bytecode::core::instructions::{
    BinaryOp, BitwiseOp, BranchCondition, CompareOp, ConvertOp, Instruction, Op, ShiftOp,
};
use stackil_bytecode::core::metadata::{
    CallSignature, FieldRef, MethodRef, MethodSignature, TypeProvider, TypeRef,
};
use stackil_bytecode::core::opcodes::InstructionFlags;
use stackil_bytecode::core::types::VerificationType;
use std::panic::Location;
use std::sync::Arc;
use tracing::{debug, trace};

type CallSite = &'static Location<'static>;

/// Slot indices up to this value use the short local/argument encodings
const SHORT_SLOT_MAX: u16 = u8::MAX as u16;

macro_rules! simple_ops {
    ($($name:ident => $op:expr;)*) => {
        $(
            #[track_caller]
            pub fn $name(&mut self) -> Result<&mut Self> {
                self.emit($op)
            }
        )*
    };
}

macro_rules! branch_ops {
    ($($name:ident => $cond:ident;)*) => {
        $(
            #[track_caller]
            pub fn $name(&mut self, target: Label) -> Result<&mut Self> {
                self.emit(Op::Branch {
                    cond: BranchCondition::$cond,
                    target,
                })
            }
        )*
    };
}

pub struct Emitter {
    id: BuilderId,
    config: EmitterConfig,
    signature: MethodSignature,
    arguments: Vec<VerificationType>,
    types: Arc<dyn TypeProvider>,
    entries: Vec<Entry>,
    labels: BranchGraph,
    regions: RegionManager,
    locals: LocalArena,
    /// Stack at the append point; `None` when the point is unreachable
    current: Option<StackState>,
    poisoned: bool,
}

impl Emitter {
    pub fn new(signature: MethodSignature, types: Arc<dyn TypeProvider>) -> Self {
        Self::with_config(signature, types, EmitterConfig::default())
    }

    pub fn with_config(
        signature: MethodSignature,
        types: Arc<dyn TypeProvider>,
        config: EmitterConfig,
    ) -> Self {
        let id = BuilderId::fresh();
        Self {
            id,
            arguments: signature.argument_types(),
            signature,
            config,
            types,
            entries: Vec::new(),
            labels: BranchGraph::new(id),
            regions: RegionManager::new(),
            locals: LocalArena::new(id),
            current: Some(StackState::new()),
            poisoned: false,
        }
    }

    pub fn id(&self) -> BuilderId {
        self.id
    }

    pub fn config(&self) -> &EmitterConfig {
        &self.config
    }

    pub fn signature(&self) -> &MethodSignature {
        &self.signature
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tracked stack at the append point, or `None` if it is unreachable
    pub fn stack(&self) -> Option<&StackState> {
        self.current.as_ref()
    }

    pub fn is_reachable(&self) -> bool {
        self.current.is_some()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Append one instruction
    #[track_caller]
    pub fn emit(&mut self, op: Op) -> Result<&mut Self> {
        self.append(op, Location::caller(), InstructionFlags::empty())?;
        Ok(self)
    }

    simple_ops! {
        nop => Op::Nop;
        ldnull => Op::LdNull;
        dup => Op::Dup;
        pop => Op::Pop;
        add => Op::Binary(BinaryOp::Add);
        sub => Op::Binary(BinaryOp::Sub);
        mul => Op::Binary(BinaryOp::Mul);
        div => Op::Binary(BinaryOp::Div);
        rem => Op::Binary(BinaryOp::Rem);
        and => Op::Bitwise(BitwiseOp::And);
        or => Op::Bitwise(BitwiseOp::Or);
        xor => Op::Bitwise(BitwiseOp::Xor);
        shl => Op::Shift(ShiftOp::Shl);
        shr => Op::Shift(ShiftOp::Shr);
        shr_un => Op::Shift(ShiftOp::ShrUn);
        neg => Op::Neg;
        not => Op::Not;
        ceq => Op::Compare(CompareOp::Ceq);
        cgt => Op::Compare(CompareOp::Cgt);
        clt => Op::Compare(CompareOp::Clt);
        conv_i4 => Op::Convert(ConvertOp::ToI4);
        conv_i8 => Op::Convert(ConvertOp::ToI8);
        conv_i => Op::Convert(ConvertOp::ToI);
        conv_r4 => Op::Convert(ConvertOp::ToR4);
        conv_r8 => Op::Convert(ConvertOp::ToR8);
        ret => Op::Ret;
        throw => Op::Throw;
        rethrow => Op::Rethrow;
        ldlen => Op::LdLen;
    }

    branch_ops! {
        br => Always;
        brtrue => True;
        brfalse => False;
        beq => Eq;
        bne => Ne;
        blt => Lt;
        ble => Le;
        bgt => Gt;
        bge => Ge;
    }

    #[track_caller]
    pub fn ldc_i4(&mut self, value: i32) -> Result<&mut Self> {
        self.emit(Op::LdcI4(value))
    }

    #[track_caller]
    pub fn ldc_i8(&mut self, value: i64) -> Result<&mut Self> {
        self.emit(Op::LdcI8(value))
    }

    #[track_caller]
    pub fn ldc_r4(&mut self, value: f32) -> Result<&mut Self> {
        self.emit(Op::LdcR4(value))
    }

    #[track_caller]
    pub fn ldc_r8(&mut self, value: f64) -> Result<&mut Self> {
        self.emit(Op::LdcR8(value))
    }

    #[track_caller]
    pub fn ldstr(&mut self, text: &str) -> Result<&mut Self> {
        self.emit(Op::LdStr(Arc::from(text)))
    }

    #[track_caller]
    pub fn switch(&mut self, targets: &[Label]) -> Result<&mut Self> {
        self.emit(Op::Switch(targets.iter().copied().collect()))
    }

    /// Exit an exception region towards `target`
    #[track_caller]
    pub fn leave(&mut self, target: Label) -> Result<&mut Self> {
        self.emit(Op::Leave(target))
    }

    #[track_caller]
    pub fn ldloc(&mut self, local: Local) -> Result<&mut Self> {
        self.emit(Op::LdLoc(local))
    }

    #[track_caller]
    pub fn stloc(&mut self, local: Local) -> Result<&mut Self> {
        self.emit(Op::StLoc(local))
    }

    #[track_caller]
    pub fn ldloca(&mut self, local: Local) -> Result<&mut Self> {
        self.emit(Op::LdLocA(local))
    }

    #[track_caller]
    pub fn ldarg(&mut self, index: u16) -> Result<&mut Self> {
        self.emit(Op::LdArg(index))
    }

    #[track_caller]
    pub fn starg(&mut self, index: u16) -> Result<&mut Self> {
        self.emit(Op::StArg(index))
    }

    #[track_caller]
    pub fn ldarga(&mut self, index: u16) -> Result<&mut Self> {
        self.emit(Op::LdArgA(index))
    }

    #[track_caller]
    pub fn ldfld(&mut self, field: &FieldRef) -> Result<&mut Self> {
        self.emit(Op::LdFld(field.clone()))
    }

    #[track_caller]
    pub fn stfld(&mut self, field: &FieldRef) -> Result<&mut Self> {
        self.emit(Op::StFld(field.clone()))
    }

    #[track_caller]
    pub fn ldsfld(&mut self, field: &FieldRef) -> Result<&mut Self> {
        self.emit(Op::LdSFld(field.clone()))
    }

    #[track_caller]
    pub fn stsfld(&mut self, field: &FieldRef) -> Result<&mut Self> {
        self.emit(Op::StSFld(field.clone()))
    }

    #[track_caller]
    pub fn newarr(&mut self, element: VerificationType) -> Result<&mut Self> {
        self.emit(Op::NewArr(element))
    }

    #[track_caller]
    pub fn ldelem(&mut self, element: VerificationType) -> Result<&mut Self> {
        self.emit(Op::LdElem(element))
    }

    #[track_caller]
    pub fn stelem(&mut self, element: VerificationType) -> Result<&mut Self> {
        self.emit(Op::StElem(element))
    }

    #[track_caller]
    pub fn ldind(&mut self, ty: VerificationType) -> Result<&mut Self> {
        self.emit(Op::LdInd(ty))
    }

    #[track_caller]
    pub fn stind(&mut self, ty: VerificationType) -> Result<&mut Self> {
        self.emit(Op::StInd(ty))
    }

    #[track_caller]
    pub fn newobj(&mut self, ctor: &MethodRef) -> Result<&mut Self> {
        self.emit(Op::NewObj(ctor.clone()))
    }

    #[track_caller]
    pub fn castclass(&mut self, ty: &TypeRef) -> Result<&mut Self> {
        self.emit(Op::CastClass(ty.clone()))
    }

    #[track_caller]
    pub fn isinst(&mut self, ty: &TypeRef) -> Result<&mut Self> {
        self.emit(Op::IsInst(ty.clone()))
    }

    #[track_caller]
    pub fn box_value(&mut self, ty: &TypeRef) -> Result<&mut Self> {
        self.emit(Op::Box(ty.clone()))
    }

    #[track_caller]
    pub fn unbox_any(&mut self, ty: &TypeRef) -> Result<&mut Self> {
        self.emit(Op::UnboxAny(ty.clone()))
    }

    #[track_caller]
    pub fn initobj(&mut self, ty: &TypeRef) -> Result<&mut Self> {
        self.emit(Op::InitObj(ty.clone()))
    }

    #[track_caller]
    pub fn call(&mut self, method: &MethodRef) -> Result<&mut Self> {
        self.emit(Op::Call(method.clone()))
    }

    #[track_caller]
    pub fn callvirt(&mut self, method: &MethodRef) -> Result<&mut Self> {
        self.emit(Op::CallVirt(method.clone()))
    }

    #[track_caller]
    pub fn calli(&mut self, signature: CallSignature) -> Result<&mut Self> {
        self.emit(Op::CallIndirect(signature))
    }

    #[track_caller]
    pub fn ldftn(&mut self, method: &MethodRef) -> Result<&mut Self> {
        self.emit(Op::LdFtn(method.clone()))
    }

    // Labels

    pub fn define_label(&mut self) -> Label {
        self.labels.define(None)
    }

    pub fn define_named_label(&mut self, name: impl Into<String>) -> Label {
        self.labels.define(Some(name.into()))
    }

    /// Name of a label this emitter owns
    pub fn label_name(&self, label: Label) -> Option<&str> {
        self.labels.owns(label).then(|| self.labels.name(label))
    }

    /// Bind `label` to the next instruction
    #[track_caller]
    pub fn mark_label(&mut self, label: Label) -> Result<&mut Self> {
        const OPERATION: &str = "MarkLabel";
        let location = Location::caller();
        self.ensure_usable()?;
        self.check_label(OPERATION, label)?;

        let at = self.entries.len();
        if let Err(rule) = self.regions.check_placement() {
            return Err(self.region_error(OPERATION, rule, at, location));
        }
        let marked = self.labels.mark(
            label,
            self.current.as_ref(),
            at,
            self.config.label_policy,
            &self.regions,
            &*self.types,
        );
        match marked {
            Ok(shape) => {
                self.current = Some(shape);
                Ok(self)
            }
            Err(fault) => {
                let error = self.label_error(OPERATION, label, fault, at, location);
                Err(self.fail(error))
            }
        }
    }

    // Locals

    #[track_caller]
    pub fn declare_local(&mut self, ty: VerificationType) -> Result<Local> {
        self.declare(ty, None, Location::caller())
    }

    #[track_caller]
    pub fn declare_named_local(
        &mut self,
        ty: VerificationType,
        name: impl Into<String>,
    ) -> Result<Local> {
        self.declare(ty, Some(name.into()), Location::caller())
    }

    /// Retire `local`; its slot becomes available to later declarations of
    /// the same type
    pub fn release_local(&mut self, local: Local) -> Result<()> {
        self.ensure_usable()?;
        self.check_local("ReleaseLocal", local)?;
        self.locals.release(local);
        trace!(%local, "release local");
        Ok(())
    }

    fn declare(
        &mut self,
        ty: VerificationType,
        name: Option<String>,
        location: CallSite,
    ) -> Result<Local> {
        self.ensure_usable()?;
        let declared = self
            .locals
            .declare(ty.clone(), name)
            .ok_or_else(|| EmitError::InvalidOperand {
                operation: "DeclareLocal",
                reason: "no local slot index is left".to_string(),
            })?;
        trace!(local = %declared.local, ty = %ty, reused = declared.reused, "declare local");

        if declared.reused && self.config.reinit_reused_locals && self.current.is_some() {
            for op in default_store(declared.local, &ty) {
                self.append(op, location, InstructionFlags::IMPLICIT)?;
            }
        }
        Ok(declared.local)
    }

    // Exception regions

    #[track_caller]
    pub fn begin_exception_block(&mut self) -> Result<ExceptionBlock> {
        const OPERATION: &str = "BeginExceptionBlock";
        let location = Location::caller();
        self.ensure_usable()?;

        let at = self.entries.len();
        if let Err(rule) = self.regions.check_placement() {
            return Err(self.region_error(OPERATION, rule, at, location));
        }
        self.require_empty_stack(OPERATION, "exception block entry", location)?;

        let block = ExceptionBlock::new(self.id, self.regions.region_count() as u32);
        let end_label = self.labels.define(None);
        self.regions.begin(block, end_label, at);
        trace!(%block, at, "begin exception block");
        Ok(block)
    }

    #[track_caller]
    pub fn begin_catch_block(&mut self, block: ExceptionBlock, filter: &TypeRef) -> Result<&mut Self> {
        const OPERATION: &str = "BeginCatchBlock";
        let location = Location::caller();
        self.ensure_usable()?;
        self.check_block(OPERATION, block)?;
        if filter.is_value_type() {
            return Err(self.fail(EmitError::InvalidOperand {
                operation: OPERATION,
                reason: format!("catch filter {filter} is a value type"),
            }));
        }

        let phase = match self.regions.check_begin_catch(block) {
            Ok(phase) => phase,
            Err(rule) => return Err(self.region_error(OPERATION, rule, self.entries.len(), location)),
        };
        self.close_protected(block, phase, OPERATION, location)?;

        let at = self.entries.len();
        self.regions
            .enter_handler(block, HandlerKind::Catch(filter.clone()), at);
        self.current = Some(StackState::from_top([VerificationType::Object(
            filter.clone(),
        )]));
        trace!(%block, at, %filter, "begin catch");
        Ok(self)
    }

    #[track_caller]
    pub fn end_catch_block(&mut self, block: ExceptionBlock) -> Result<&mut Self> {
        const OPERATION: &str = "EndCatchBlock";
        let location = Location::caller();
        self.ensure_usable()?;
        self.check_block(OPERATION, block)?;
        if let Err(rule) = self.regions.check_end_catch(block) {
            return Err(self.region_error(OPERATION, rule, self.entries.len(), location));
        }

        if self.current.is_some() {
            if let Some(end_label) = self.end_label(block) {
                self.append(Op::Leave(end_label), location, InstructionFlags::IMPLICIT)?;
            }
        }
        self.regions.exit_handler(block, self.entries.len());
        self.current = None;
        Ok(self)
    }

    #[track_caller]
    pub fn begin_finally_block(&mut self, block: ExceptionBlock) -> Result<&mut Self> {
        const OPERATION: &str = "BeginFinallyBlock";
        let location = Location::caller();
        self.ensure_usable()?;
        self.check_block(OPERATION, block)?;

        let phase = match self.regions.check_begin_finally(block) {
            Ok(phase) => phase,
            Err(rule) => return Err(self.region_error(OPERATION, rule, self.entries.len(), location)),
        };
        self.close_protected(block, phase, OPERATION, location)?;

        let at = self.entries.len();
        self.regions.enter_handler(block, HandlerKind::Finally, at);
        self.current = Some(StackState::new());
        trace!(%block, at, "begin finally");
        Ok(self)
    }

    #[track_caller]
    pub fn end_finally_block(&mut self, block: ExceptionBlock) -> Result<&mut Self> {
        const OPERATION: &str = "EndFinallyBlock";
        let location = Location::caller();
        self.ensure_usable()?;
        self.check_block(OPERATION, block)?;
        if let Err(rule) = self.regions.check_end_finally(block) {
            return Err(self.region_error(OPERATION, rule, self.entries.len(), location));
        }

        if self.current.is_some() {
            self.append(Op::EndFinally, location, InstructionFlags::IMPLICIT)?;
        }
        self.regions.exit_handler(block, self.entries.len());
        self.current = None;
        Ok(self)
    }

    #[track_caller]
    pub fn end_exception_block(&mut self, block: ExceptionBlock) -> Result<&mut Self> {
        const OPERATION: &str = "EndExceptionBlock";
        let location = Location::caller();
        self.ensure_usable()?;
        self.check_block(OPERATION, block)?;

        let at = self.entries.len();
        if let Err(rule) = self.regions.check_end(block) {
            return Err(self.region_error(OPERATION, rule, at, location));
        }
        let end_label = self.regions.end(block).end_label;

        // Code after the block is reachable only if something leaves to it.
        if self.labels.info(end_label).branched {
            let marked = self.labels.mark(
                end_label,
                None,
                at,
                self.config.label_policy,
                &self.regions,
                &*self.types,
            );
            match marked {
                Ok(shape) => self.current = Some(shape),
                Err(fault) => {
                    let error = self.label_error(OPERATION, end_label, fault, at, location);
                    return Err(self.fail(error));
                }
            }
        } else {
            self.labels
                .place(end_label, at, self.regions.current_scope());
            self.current = None;
        }
        trace!(%block, at, reachable = self.current.is_some(), "end exception block");
        Ok(self)
    }

    // Finalization

    /// Run the deferred whole-stream checks and hand over the verified
    /// stream
    #[track_caller]
    pub fn verify(self) -> Result<Program> {
        if self.poisoned {
            return Err(EmitError::Poisoned);
        }
        let at = self.entries.len();
        if self.regions.unended().is_some() {
            return Err(EmitError::RegionDisciplineViolation {
                opcode: "Finalize",
                rule: RegionRule::UnendedRegion,
                context: Box::new(FailureContext::new(at, Location::caller(), self.current.clone())),
            });
        }
        if self.entries.is_empty() {
            return Err(EmitError::EmptyStream);
        }
        if let Some(info) = self.labels.first_unmarked() {
            return Err(EmitError::UnmarkedLabel {
                label: info.name.clone(),
            });
        }
        // A trailing mark nothing branches to does not make the end reachable.
        let runs_off = self.entries.last().is_some_and(|entry| entry.falls_through())
            || self
                .labels
                .labels()
                .any(|(_, info)| info.branched && info.position == Some(at));
        if self.current.is_some() && runs_off {
            return Err(EmitError::FallsThroughEnd);
        }

        let reachable = self.cfg().reachable();
        if let Some(index) = reachable.iter().position(|reached| !reached) {
            let entry = &self.entries[index];
            return Err(EmitError::UnreachableCode {
                opcode: entry.instruction.name(),
                index,
                context: Box::new(FailureContext::new(
                    index,
                    entry.instruction.location,
                    Some(entry.stack_before.clone()),
                )),
            });
        }

        let Emitter {
            mut entries,
            labels,
            regions,
            locals,
            signature,
            types,
            ..
        } = self;

        for (_, info) in labels.labels() {
            if let Some(at) = info.position.filter(|&at| info.branched && at < entries.len()) {
                entries[at].flags.insert(InstructionFlags::BRANCH_TARGET);
            }
        }
        let program_labels = labels
            .labels()
            .map(|(_, info)| ProgramLabel {
                name: info.name.clone(),
                position: info.position,
            })
            .collect();
        let program_locals = locals
            .iter()
            .map(|info| ProgramLocal {
                name: info.name.clone(),
                slot: info.slot,
                ty: info.ty.clone(),
            })
            .collect();

        debug!(
            instructions = entries.len(),
            handlers = regions.handler_table().len(),
            "verified stream"
        );
        Ok(Program {
            entries,
            labels: program_labels,
            handlers: regions.handler_table(),
            locals: program_locals,
            slot_types: locals.slot_types(),
            signature,
            types,
        })
    }

    /// Verify, optimize with the configured passes, and resolve
    #[track_caller]
    pub fn finalize(self) -> Result<FinalizedStream> {
        let optimizer = self.config.optimizer.clone();
        let mut program = self.verify()?;
        let report = program.optimize(&optimizer);
        let stream = program.resolve();
        debug!(
            instructions = stream.len(),
            elided = report.elided_casts,
            tail_calls = report.tail_calls,
            short_branches = report.short_branches,
            "finalized stream"
        );
        Ok(stream)
    }

    /// Finalize and hand the stream to `backend`
    #[track_caller]
    pub fn finalize_into<B: TargetBackend>(self, backend: &mut B) -> Result<B::Output> {
        let stream = self.finalize()?;
        backend
            .emit(&stream)
            .map_err(|error| EmitError::Backend(Box::new(error)))
    }

    // Internals

    fn append(&mut self, op: Op, location: CallSite, flags: InstructionFlags) -> Result<usize> {
        self.ensure_usable()?;
        self.check_operands(&op)?;

        let opcode = op.name();
        let index = self.entries.len();
        let Some(before) = self.current.clone() else {
            let context = self.context(index, location);
            return Err(self.fail(EmitError::UnreachableCode {
                opcode,
                index,
                context,
            }));
        };
        let scope = self.regions.current_scope();
        if let Err(rule) = self.check_region_rules(&op, scope) {
            return Err(self.region_error(opcode, rule, index, location));
        }

        let mut after = before.clone();
        let applied = {
            let env = VerifyEnv {
                types: &*self.types,
                signature: &self.signature,
                arguments: &self.arguments,
                locals: &self.locals,
            };
            verifier::apply(&op, &mut after, &env)
        };
        if let Err(fault) = applied {
            let error = self.fault_error(opcode, fault, index, location);
            return Err(self.fail(error));
        }

        let kind = match op {
            Op::Leave(_) => BranchKind::Leave,
            _ => BranchKind::Ordinary,
        };
        for target in op.branch_targets() {
            let recorded = self.labels.record_branch(
                target,
                &after,
                index,
                scope,
                kind,
                &self.regions,
                &*self.types,
            );
            if let Err(fault) = recorded {
                let error = self.label_error(opcode, target, fault, index, location);
                return Err(self.fail(error));
            }
        }

        let mut flags = flags;
        if self.short_slot(&op) {
            flags.insert(InstructionFlags::SHORT_FORM);
        }
        trace!(index, op = %op, stack = %after, "append");

        let falls_through = !op.is_unconditional_terminal();
        self.entries.push(Entry {
            instruction: Instruction::new(op, location),
            flags,
            scope,
            stack_before: before,
            stack_after: after.clone(),
        });
        self.current = falls_through.then_some(after);
        Ok(index)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned {
            Err(EmitError::Poisoned)
        } else {
            Ok(())
        }
    }

    fn fail(&mut self, error: EmitError) -> EmitError {
        if error.poisons() {
            self.poisoned = true;
        }
        error
    }

    fn context(&self, index: usize, location: CallSite) -> Box<FailureContext> {
        Box::new(FailureContext::new(index, location, self.current.clone()))
    }

    fn region_error(
        &mut self,
        opcode: &'static str,
        rule: RegionRule,
        index: usize,
        location: CallSite,
    ) -> EmitError {
        let context = self.context(index, location);
        self.fail(EmitError::RegionDisciplineViolation {
            opcode,
            rule,
            context,
        })
    }

    fn check_label(&self, operation: &'static str, label: Label) -> Result<()> {
        if self.labels.owns(label) {
            Ok(())
        } else {
            Err(EmitError::OwnershipViolation {
                operation,
                handle: label.to_string(),
            })
        }
    }

    fn check_local(&self, operation: &'static str, local: Local) -> Result<()> {
        if !self.locals.owns(local) {
            return Err(EmitError::OwnershipViolation {
                operation,
                handle: local.to_string(),
            });
        }
        let info = self.locals.info(local);
        if info.released {
            return Err(EmitError::UseAfterRelease {
                operation,
                local: info.name.clone(),
            });
        }
        Ok(())
    }

    fn check_block(&self, operation: &'static str, block: ExceptionBlock) -> Result<()> {
        if block.owner() == self.id && block.index() < self.regions.region_count() {
            Ok(())
        } else {
            Err(EmitError::OwnershipViolation {
                operation,
                handle: block.to_string(),
            })
        }
    }

    /// Checks that never poison the emitter
    fn check_operands(&self, op: &Op) -> Result<()> {
        let operation = op.name();
        for label in op.branch_targets() {
            self.check_label(operation, label)?;
        }
        if let Some(local) = op.local() {
            self.check_local(operation, local)?;
        }
        if let Op::LdArg(index) | Op::StArg(index) | Op::LdArgA(index) = op {
            if usize::from(*index) >= self.arguments.len() {
                return Err(EmitError::ArgumentOutOfRange {
                    operation,
                    index: *index,
                    count: self.arguments.len(),
                });
            }
        }
        Ok(())
    }

    fn check_region_rules(&self, op: &Op, scope: ScopeId) -> std::result::Result<(), RegionRule> {
        self.regions.check_placement()?;
        match op {
            Op::Ret if scope != ScopeId::ROOT => Err(RegionRule::ReturnInsideRegion),
            Op::Rethrow if self.regions.kind(scope) != ScopeKind::Catch => {
                Err(RegionRule::RethrowOutsideCatch)
            }
            Op::EndFinally if self.regions.kind(scope) != ScopeKind::Finally => {
                Err(RegionRule::EndFinallyOutsideFinally)
            }
            Op::Leave(_) => self.regions.check_leave_source(scope),
            _ => Ok(()),
        }
    }

    fn short_slot(&self, op: &Op) -> bool {
        match op {
            Op::LdLoc(local) | Op::StLoc(local) | Op::LdLocA(local) => {
                self.locals.info(*local).slot <= SHORT_SLOT_MAX
            }
            Op::LdArg(index) | Op::StArg(index) | Op::LdArgA(index) => *index <= SHORT_SLOT_MAX,
            _ => false,
        }
    }

    fn require_empty_stack(
        &mut self,
        opcode: &'static str,
        at: &str,
        location: CallSite,
    ) -> Result<()> {
        let index = self.entries.len();
        let error = match &self.current {
            Some(stack) if stack.is_empty() => return Ok(()),
            Some(stack) => EmitError::StackShapeMismatch {
                opcode,
                at: at.to_string(),
                expected: StackState::new(),
                found: stack.clone(),
                divergence: ShapeDivergence::Depth {
                    expected: 0,
                    found: stack.len(),
                },
                context: self.context(index, location),
            },
            None => EmitError::UnreachableCode {
                opcode,
                index,
                context: self.context(index, location),
            },
        };
        Err(self.fail(error))
    }

    /// End the protected body when the first handler begins
    fn close_protected(
        &mut self,
        block: ExceptionBlock,
        phase: Phase,
        opcode: &'static str,
        location: CallSite,
    ) -> Result<()> {
        if phase != Phase::Protected || self.current.is_none() {
            return Ok(());
        }
        self.require_empty_stack(opcode, "end of protected region", location)?;
        if let Some(end_label) = self.end_label(block) {
            self.append(Op::Leave(end_label), location, InstructionFlags::IMPLICIT)?;
        }
        Ok(())
    }

    fn end_label(&self, block: ExceptionBlock) -> Option<Label> {
        self.regions.region(block).map(|region| region.end_label)
    }

    fn cfg(&self) -> Cfg {
        let roots: Vec<usize> = self.regions.handler_starts().map(|(start, _)| start).collect();
        Cfg::build(&self.entries, |label| self.labels.position(label), roots)
    }

    /// Instructions that transfer control to stream position `at`
    fn arrivals(&self, at: usize) -> Vec<usize> {
        let mut arrivals = Vec::new();
        if let Some(previous) = at.checked_sub(1).and_then(|i| self.entries.get(i)) {
            if previous.falls_through() {
                arrivals.push(at - 1);
            }
        }
        for info in self.labels.marked_at(at) {
            arrivals.extend(info.sources.iter().copied());
        }
        arrivals
    }

    fn bad_paths(&self, label: Label, at: usize) -> Vec<BadPath> {
        let mut arrivals = self.arrivals(at);
        let info = self.labels.info(label);
        match info.position {
            Some(position) if position != at => arrivals.extend(self.arrivals(position)),
            _ => arrivals.extend(info.sources.iter().copied()),
        }
        arrivals.retain(|&arrival| arrival < self.entries.len());
        arrivals.sort_unstable();
        arrivals.dedup();
        diagnostics::bad_paths(
            &self.entries,
            &self.cfg(),
            &arrivals,
            self.config.max_bad_paths,
        )
    }

    fn fault_error(
        &self,
        opcode: &'static str,
        fault: Fault,
        index: usize,
        location: CallSite,
    ) -> EmitError {
        let context = self.context(index, location);
        match fault {
            Fault::Stack(StackFault::Underflow { expected }) => EmitError::StackUnderflow {
                opcode,
                expected,
                context,
            },
            Fault::Stack(StackFault::Mismatch {
                expected,
                found,
                position,
            }) => EmitError::TypeMismatch {
                opcode,
                expected: expected.with_article(),
                found,
                position,
                context,
            },
            Fault::Shape {
                at,
                expected,
                found,
                divergence,
            } => EmitError::StackShapeMismatch {
                opcode,
                at: at.to_string(),
                expected,
                found,
                divergence,
                context,
            },
            Fault::Operand(reason) => EmitError::InvalidOperand {
                operation: opcode,
                reason,
            },
        }
    }

    fn label_error(
        &self,
        opcode: &'static str,
        label: Label,
        fault: LabelFault,
        index: usize,
        location: CallSite,
    ) -> EmitError {
        let name = self.labels.name(label).to_string();
        match fault {
            LabelFault::AlreadyMarked => EmitError::LabelAlreadyMarked { label: name },
            LabelFault::Region(rule) => EmitError::RegionDisciplineViolation {
                opcode,
                rule,
                context: self.context(index, location),
            },
            LabelFault::Shape {
                expected,
                found,
                divergence,
            } => {
                let context = FailureContext::new(index, location, self.current.clone())
                    .with_bad_paths(self.bad_paths(label, index));
                EmitError::StackShapeMismatch {
                    opcode,
                    at: format!("label {name}"),
                    expected,
                    found,
                    divergence,
                    context: Box::new(context),
                }
            }
        }
    }
}

/// Instructions that store the default value of `ty` into `local`
fn default_store(local: Local, ty: &VerificationType) -> Vec<Op> {
    let value = match ty {
        VerificationType::Int32 => vec![Op::LdcI4(0)],
        VerificationType::Int64 => vec![Op::LdcI8(0)],
        VerificationType::NativeInt => vec![Op::LdcI4(0), Op::Convert(ConvertOp::ToI)],
        VerificationType::Float32 => vec![Op::LdcR4(0.0)],
        VerificationType::Float64 => vec![Op::LdcR8(0.0)],
        VerificationType::Null | VerificationType::Object(_) => vec![Op::LdNull],
        VerificationType::Value(ty) => return vec![Op::LdLocA(local), Op::InitObj(ty.clone())],
        VerificationType::ManagedPtr(_) | VerificationType::UnmanagedPtr(_) => return Vec::new(),
    };
    value.into_iter().chain([Op::StLoc(local)]).collect()
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("id", &self.id)
            .field("entries", &self.entries.len())
            .field("current", &self.current)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}
