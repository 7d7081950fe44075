//! Instruction representation
//!
//! [`Op`] is a closed tagged union: one variant per opcode family, each
//! carrying its operands. The verifier and every optimizer pass match on it
//! exhaustively. An [`Instruction`] pairs an `Op` with the caller location
//! that appended it; it is never mutated after it has been recorded.

use crate::core::handles::{Label, Local};
use crate::core::metadata::{CallSignature, FieldRef, MethodRef, TypeRef};
use crate::core::opcodes::Opcode;
use crate::core::types::VerificationType;
use smallvec::SmallVec;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitwiseOp {
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftOp {
    Shl,
    Shr,
    ShrUn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Ceq,
    Cgt,
    Clt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvertOp {
    ToI4,
    ToI8,
    ToI,
    ToR4,
    ToR8,
}

impl ConvertOp {
    pub fn result_type(self) -> VerificationType {
        match self {
            ConvertOp::ToI4 => VerificationType::Int32,
            ConvertOp::ToI8 => VerificationType::Int64,
            ConvertOp::ToI => VerificationType::NativeInt,
            ConvertOp::ToR4 => VerificationType::Float32,
            ConvertOp::ToR8 => VerificationType::Float64,
        }
    }
}

/// Condition under which a branch is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchCondition {
    Always,
    /// Top of stack is non-zero / non-null
    True,
    /// Top of stack is zero / null
    False,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BranchCondition {
    /// Number of operands the condition consumes
    pub fn arity(self) -> usize {
        match self {
            BranchCondition::Always => 0,
            BranchCondition::True | BranchCondition::False => 1,
            _ => 2,
        }
    }
}

pub type Targets = SmallVec<[Label; 4]>;

/// One opcode family with its operands
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Nop,

    // Constants
    LdcI4(i32),
    LdcI8(i64),
    LdcR4(f32),
    LdcR8(f64),
    LdNull,
    LdStr(Arc<str>),

    // Stack manipulation
    Dup,
    Pop,

    // Arithmetic and comparison
    Binary(BinaryOp),
    Bitwise(BitwiseOp),
    Shift(ShiftOp),
    Neg,
    Not,
    Compare(CompareOp),
    Convert(ConvertOp),

    // Control flow
    Branch { cond: BranchCondition, target: Label },
    Switch(Targets),
    /// Boundary exit out of a protected region or catch handler
    Leave(Label),
    Ret,
    Throw,
    Rethrow,
    EndFinally,

    // Locals and arguments
    LdLoc(Local),
    StLoc(Local),
    LdLocA(Local),
    LdArg(u16),
    StArg(u16),
    LdArgA(u16),

    // Fields
    LdFld(FieldRef),
    StFld(FieldRef),
    LdSFld(FieldRef),
    StSFld(FieldRef),

    // Arrays
    NewArr(VerificationType),
    LdLen,
    LdElem(VerificationType),
    StElem(VerificationType),

    // Indirect access through pointers
    LdInd(VerificationType),
    StInd(VerificationType),

    // Objects
    NewObj(MethodRef),
    CastClass(TypeRef),
    IsInst(TypeRef),
    Box(TypeRef),
    UnboxAny(TypeRef),
    InitObj(TypeRef),

    // Calls
    Call(MethodRef),
    CallVirt(MethodRef),
    CallIndirect(CallSignature),
    LdFtn(MethodRef),
}

impl Op {
    /// Human-readable operation name used in diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Op::Nop => "Nop",
            Op::LdcI4(_) => "LdcI4",
            Op::LdcI8(_) => "LdcI8",
            Op::LdcR4(_) => "LdcR4",
            Op::LdcR8(_) => "LdcR8",
            Op::LdNull => "LdNull",
            Op::LdStr(_) => "LdStr",
            Op::Dup => "Dup",
            Op::Pop => "Pop",
            Op::Binary(BinaryOp::Add) => "Add",
            Op::Binary(BinaryOp::Sub) => "Sub",
            Op::Binary(BinaryOp::Mul) => "Mul",
            Op::Binary(BinaryOp::Div) => "Div",
            Op::Binary(BinaryOp::Rem) => "Rem",
            Op::Bitwise(BitwiseOp::And) => "And",
            Op::Bitwise(BitwiseOp::Or) => "Or",
            Op::Bitwise(BitwiseOp::Xor) => "Xor",
            Op::Shift(ShiftOp::Shl) => "Shl",
            Op::Shift(ShiftOp::Shr) => "Shr",
            Op::Shift(ShiftOp::ShrUn) => "ShrUn",
            Op::Neg => "Neg",
            Op::Not => "Not",
            Op::Compare(CompareOp::Ceq) => "Ceq",
            Op::Compare(CompareOp::Cgt) => "Cgt",
            Op::Compare(CompareOp::Clt) => "Clt",
            Op::Convert(ConvertOp::ToI4) => "ConvI4",
            Op::Convert(ConvertOp::ToI8) => "ConvI8",
            Op::Convert(ConvertOp::ToI) => "ConvI",
            Op::Convert(ConvertOp::ToR4) => "ConvR4",
            Op::Convert(ConvertOp::ToR8) => "ConvR8",
            Op::Branch { cond, .. } => match cond {
                BranchCondition::Always => "Br",
                BranchCondition::True => "BrTrue",
                BranchCondition::False => "BrFalse",
                BranchCondition::Eq => "Beq",
                BranchCondition::Ne => "BneUn",
                BranchCondition::Lt => "Blt",
                BranchCondition::Le => "Ble",
                BranchCondition::Gt => "Bgt",
                BranchCondition::Ge => "Bge",
            },
            Op::Switch(_) => "Switch",
            Op::Leave(_) => "Leave",
            Op::Ret => "Ret",
            Op::Throw => "Throw",
            Op::Rethrow => "Rethrow",
            Op::EndFinally => "EndFinally",
            Op::LdLoc(_) => "LdLoc",
            Op::StLoc(_) => "StLoc",
            Op::LdLocA(_) => "LdLocA",
            Op::LdArg(_) => "LdArg",
            Op::StArg(_) => "StArg",
            Op::LdArgA(_) => "LdArgA",
            Op::LdFld(_) => "LdFld",
            Op::StFld(_) => "StFld",
            Op::LdSFld(_) => "LdSFld",
            Op::StSFld(_) => "StSFld",
            Op::NewArr(_) => "NewArr",
            Op::LdLen => "LdLen",
            Op::LdElem(_) => "LdElem",
            Op::StElem(_) => "StElem",
            Op::LdInd(_) => "LdInd",
            Op::StInd(_) => "StInd",
            Op::NewObj(_) => "NewObj",
            Op::CastClass(_) => "CastClass",
            Op::IsInst(_) => "IsInst",
            Op::Box(_) => "Box",
            Op::UnboxAny(_) => "UnboxAny",
            Op::InitObj(_) => "InitObj",
            Op::Call(_) => "Call",
            Op::CallVirt(_) => "CallVirt",
            Op::CallIndirect(_) => "CallIndirect",
            Op::LdFtn(_) => "LdFtn",
        }
    }

    /// Long-form opcode. Short forms are chosen at finalize time.
    pub fn opcode(&self) -> Opcode {
        match self {
            Op::Nop => Opcode::NOP,
            Op::LdcI4(_) => Opcode::LDC_I4,
            Op::LdcI8(_) => Opcode::LDC_I8,
            Op::LdcR4(_) => Opcode::LDC_R4,
            Op::LdcR8(_) => Opcode::LDC_R8,
            Op::LdNull => Opcode::LDNULL,
            Op::LdStr(_) => Opcode::LDSTR,
            Op::Dup => Opcode::DUP,
            Op::Pop => Opcode::POP,
            Op::Binary(op) => match op {
                BinaryOp::Add => Opcode::ADD,
                BinaryOp::Sub => Opcode::SUB,
                BinaryOp::Mul => Opcode::MUL,
                BinaryOp::Div => Opcode::DIV,
                BinaryOp::Rem => Opcode::REM,
            },
            Op::Bitwise(op) => match op {
                BitwiseOp::And => Opcode::AND,
                BitwiseOp::Or => Opcode::OR,
                BitwiseOp::Xor => Opcode::XOR,
            },
            Op::Shift(op) => match op {
                ShiftOp::Shl => Opcode::SHL,
                ShiftOp::Shr => Opcode::SHR,
                ShiftOp::ShrUn => Opcode::SHR_UN,
            },
            Op::Neg => Opcode::NEG,
            Op::Not => Opcode::NOT,
            Op::Compare(op) => match op {
                CompareOp::Ceq => Opcode::CEQ,
                CompareOp::Cgt => Opcode::CGT,
                CompareOp::Clt => Opcode::CLT,
            },
            Op::Convert(op) => match op {
                ConvertOp::ToI4 => Opcode::CONV_I4,
                ConvertOp::ToI8 => Opcode::CONV_I8,
                ConvertOp::ToI => Opcode::CONV_I,
                ConvertOp::ToR4 => Opcode::CONV_R4,
                ConvertOp::ToR8 => Opcode::CONV_R8,
            },
            Op::Branch { cond, .. } => match cond {
                BranchCondition::Always => Opcode::BR,
                BranchCondition::True => Opcode::BRTRUE,
                BranchCondition::False => Opcode::BRFALSE,
                BranchCondition::Eq => Opcode::BEQ,
                BranchCondition::Ne => Opcode::BNE_UN,
                BranchCondition::Lt => Opcode::BLT,
                BranchCondition::Le => Opcode::BLE,
                BranchCondition::Gt => Opcode::BGT,
                BranchCondition::Ge => Opcode::BGE,
            },
            Op::Switch(_) => Opcode::SWITCH,
            Op::Leave(_) => Opcode::LEAVE,
            Op::Ret => Opcode::RET,
            Op::Throw => Opcode::THROW,
            Op::Rethrow => Opcode::RETHROW,
            Op::EndFinally => Opcode::ENDFINALLY,
            Op::LdLoc(_) => Opcode::LDLOC,
            Op::StLoc(_) => Opcode::STLOC,
            Op::LdLocA(_) => Opcode::LDLOCA,
            Op::LdArg(_) => Opcode::LDARG,
            Op::StArg(_) => Opcode::STARG,
            Op::LdArgA(_) => Opcode::LDARGA,
            Op::LdFld(_) => Opcode::LDFLD,
            Op::StFld(_) => Opcode::STFLD,
            Op::LdSFld(_) => Opcode::LDSFLD,
            Op::StSFld(_) => Opcode::STSFLD,
            Op::NewArr(_) => Opcode::NEWARR,
            Op::LdLen => Opcode::LDLEN,
            Op::LdElem(_) => Opcode::LDELEM,
            Op::StElem(_) => Opcode::STELEM,
            Op::LdInd(_) => Opcode::LDOBJ,
            Op::StInd(_) => Opcode::STOBJ,
            Op::NewObj(_) => Opcode::NEWOBJ,
            Op::CastClass(_) => Opcode::CASTCLASS,
            Op::IsInst(_) => Opcode::ISINST,
            Op::Box(_) => Opcode::BOX,
            Op::UnboxAny(_) => Opcode::UNBOX_ANY,
            Op::InitObj(_) => Opcode::INITOBJ,
            Op::Call(_) => Opcode::CALL,
            Op::CallVirt(_) => Opcode::CALLVIRT,
            Op::CallIndirect(_) => Opcode::CALLI,
            Op::LdFtn(_) => Opcode::LDFTN,
        }
    }

    /// Labels this instruction may transfer control to
    pub fn branch_targets(&self) -> Targets {
        match self {
            Op::Branch { target, .. } | Op::Leave(target) => smallvec::smallvec![*target],
            Op::Switch(targets) => targets.clone(),
            _ => Targets::new(),
        }
    }

    /// `true` when control never falls through to the next instruction
    pub fn is_unconditional_terminal(&self) -> bool {
        matches!(
            self,
            Op::Branch {
                cond: BranchCondition::Always,
                ..
            } | Op::Leave(_)
                | Op::Ret
                | Op::Throw
                | Op::Rethrow
                | Op::EndFinally
        )
    }

    /// `true` for instructions that encode a label displacement eligible
    /// for a short form
    pub fn is_shortenable_branch(&self) -> bool {
        matches!(self, Op::Branch { .. } | Op::Leave(_))
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Op::Call(_) | Op::CallVirt(_) | Op::CallIndirect(_))
    }

    /// Local referenced by a local-access instruction
    pub fn local(&self) -> Option<Local> {
        match self {
            Op::LdLoc(local) | Op::StLoc(local) | Op::LdLocA(local) => Some(*local),
            _ => None,
        }
    }

    /// Encoded size in the long form
    pub fn long_size(&self) -> u32 {
        let targets = match self {
            Op::Switch(targets) => targets.len(),
            _ => 0,
        };
        self.opcode().size(targets)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mnemonic = self.opcode().mnemonic();
        match self {
            Op::LdcI4(v) => write!(f, "{mnemonic} {v}"),
            Op::LdcI8(v) => write!(f, "{mnemonic} {v}"),
            Op::LdcR4(v) => write!(f, "{mnemonic} {v}"),
            Op::LdcR8(v) => write!(f, "{mnemonic} {v}"),
            Op::LdStr(s) => write!(f, "{mnemonic} {s:?}"),
            Op::Branch { target, .. } | Op::Leave(target) => write!(f, "{mnemonic} {target}"),
            Op::Switch(targets) => {
                write!(f, "{mnemonic} (")?;
                for (i, target) in targets.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{target}")?;
                }
                write!(f, ")")
            }
            Op::LdLoc(local) | Op::StLoc(local) | Op::LdLocA(local) => {
                write!(f, "{mnemonic} {local}")
            }
            Op::LdArg(index) | Op::StArg(index) | Op::LdArgA(index) => {
                write!(f, "{mnemonic} {index}")
            }
            Op::LdFld(field) | Op::StFld(field) | Op::LdSFld(field) | Op::StSFld(field) => {
                write!(f, "{mnemonic} {field}")
            }
            Op::NewArr(ty) | Op::LdElem(ty) | Op::StElem(ty) | Op::LdInd(ty) | Op::StInd(ty) => {
                write!(f, "{mnemonic} {ty}")
            }
            Op::CastClass(ty)
            | Op::IsInst(ty)
            | Op::Box(ty)
            | Op::UnboxAny(ty)
            | Op::InitObj(ty) => write!(f, "{mnemonic} {ty}"),
            Op::NewObj(method) | Op::Call(method) | Op::CallVirt(method) | Op::LdFtn(method) => {
                write!(f, "{mnemonic} {method}")
            }
            Op::CallIndirect(sig) => {
                write!(f, "{mnemonic} ")?;
                match &sig.ret {
                    Some(ret) => write!(f, "{ret}")?,
                    None => write!(f, "void")?,
                }
                write!(f, "(")?;
                for (i, param) in sig.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{param}")?;
                }
                write!(f, ")")
            }
            _ => write!(f, "{mnemonic}"),
        }
    }
}

/// An appended instruction and the call site that appended it
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: Op,
    pub location: &'static Location<'static>,
}

impl Instruction {
    pub fn new(op: Op, location: &'static Location<'static>) -> Self {
        Self { op, location }
    }

    /// Record `op` with the location of the caller
    #[track_caller]
    pub fn here(op: Op) -> Self {
        Self::new(op, Location::caller())
    }

    pub fn name(&self) -> &'static str {
        self.op.name()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::handles::BuilderId;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_op_names_and_opcodes() {
        assert_eq!(Op::Binary(BinaryOp::Add).name(), "Add");
        assert_eq!(Op::Binary(BinaryOp::Add).opcode(), Opcode::ADD);
        assert_eq!(Op::Compare(CompareOp::Clt).opcode(), Opcode::CLT);
        assert_eq!(Op::LdInd(VerificationType::Int32).opcode(), Opcode::LDOBJ);
    }

    #[test]
    fn test_branch_targets_and_terminals() {
        let owner = BuilderId::fresh();
        let l0 = Label::new(owner, 0);
        let l1 = Label::new(owner, 1);

        let br = Op::Branch {
            cond: BranchCondition::Always,
            target: l0,
        };
        assert!(br.is_unconditional_terminal());
        assert_eq!(br.branch_targets().as_slice(), &[l0]);

        let switch = Op::Switch(smallvec::smallvec![l0, l1]);
        assert!(!switch.is_unconditional_terminal());
        assert_eq!(switch.branch_targets().len(), 2);
        assert_eq!(switch.long_size(), 1 + 4 + 8);

        assert!(Op::Rethrow.is_unconditional_terminal());
        assert!(Op::Nop.branch_targets().is_empty());
    }

    #[test]
    fn test_instruction_display() {
        let owner = BuilderId::fresh();
        assert_eq!(Op::LdcI4(7).to_string(), "ldc.i4 7");
        assert_eq!(
            Op::Branch {
                cond: BranchCondition::Lt,
                target: Label::new(owner, 2)
            }
            .to_string(),
            "blt L2"
        );
        assert_eq!(Op::LdStr("hi".into()).to_string(), "ldstr \"hi\"");
    }

    #[test]
    fn test_instruction_records_caller() {
        let instruction = Instruction::here(Op::Ret);
        assert!(instruction.location.file().ends_with("instructions.rs"));
        assert_eq!(instruction.name(), "Ret");
    }
}
