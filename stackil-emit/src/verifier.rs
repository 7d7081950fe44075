//! Per-opcode stack-effect rules
//!
//! [`apply`] matches the instruction exhaustively, checks the operands it
//! consumes against their required classes (top of stack first), and pushes
//! its results. Handle ownership, released locals and argument ranges are
//! checked by the emitter before an instruction gets here.

use crate::locals::LocalArena;
use crate::stack::{ShapeDivergence, StackFault, StackState, StackTracker};
use stackil_bytecode::core::instructions::{BranchCondition, CompareOp, Op};
use stackil_bytecode::core::metadata::{MethodKind, MethodSignature, TypeProvider, TypeRef};
use stackil_bytecode::core::types::{TypeClass, VerificationType};

/// Everything a stack-effect rule may consult besides the stack
pub struct VerifyEnv<'a> {
    pub types: &'a dyn TypeProvider,
    pub signature: &'a MethodSignature,
    pub arguments: &'a [VerificationType],
    pub locals: &'a LocalArena,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Stack(StackFault),
    /// The whole stack has the wrong shape (e.g. extra values at `ret`)
    Shape {
        at: &'static str,
        expected: StackState,
        found: StackState,
        divergence: ShapeDivergence,
    },
    Operand(String),
}

impl From<StackFault> for Fault {
    fn from(fault: StackFault) -> Self {
        Fault::Stack(fault)
    }
}

/// Apply `op` to `stack`
pub fn apply(op: &Op, stack: &mut StackState, env: &VerifyEnv<'_>) -> Result<(), Fault> {
    let mut t = StackTracker::new(stack, env.types);
    match op {
        Op::Nop => {}

        Op::LdcI4(_) => t.push(VerificationType::Int32),
        Op::LdcI8(_) => t.push(VerificationType::Int64),
        Op::LdcR4(_) => t.push(VerificationType::Float32),
        Op::LdcR8(_) => t.push(VerificationType::Float64),
        Op::LdNull => t.push(VerificationType::Null),
        Op::LdStr(_) => t.push(VerificationType::Object(TypeRef::string())),

        Op::Dup => {
            t.require(1)?;
            let top = t.peek(0)?.clone();
            t.push(top);
        }
        Op::Pop => {
            t.require(1)?;
            t.pop(&TypeClass::Any)?;
        }

        Op::Binary(_) => {
            let result = numeric_pair(&mut t)?;
            t.push(result);
        }
        Op::Bitwise(_) => {
            t.require(2)?;
            let lhs = t.check(1, &TypeClass::Integer)?.clone();
            let partner = match lhs {
                VerificationType::Int64 => TypeClass::Int64,
                _ => TypeClass::Int32OrNativeInt,
            };
            let rhs = t.pop(&partner)?;
            t.pop(&TypeClass::Any)?;
            t.push(combine(&lhs, &rhs, &partner)?);
        }
        Op::Shift(_) => {
            t.require(2)?;
            t.pop(&TypeClass::Int32OrNativeInt)?;
            let value = t.pop(&TypeClass::Integer)?;
            t.push(value);
        }
        Op::Neg => {
            t.require(1)?;
            let value = t.pop(&TypeClass::Numeric)?;
            t.push(value);
        }
        Op::Not => {
            t.require(1)?;
            let value = t.pop(&TypeClass::Integer)?;
            t.push(value);
        }
        Op::Compare(CompareOp::Ceq) => {
            equality_pair(&mut t)?;
            t.push(VerificationType::Int32);
        }
        Op::Compare(_) => {
            numeric_pair(&mut t)?;
            t.push(VerificationType::Int32);
        }
        Op::Convert(conversion) => {
            t.require(1)?;
            t.pop(&TypeClass::Numeric)?;
            t.push(conversion.result_type());
        }

        Op::Branch { cond, .. } => match cond {
            BranchCondition::Always => {}
            BranchCondition::True | BranchCondition::False => {
                t.require(1)?;
                t.pop(&TypeClass::Condition)?;
            }
            BranchCondition::Eq | BranchCondition::Ne => equality_pair(&mut t)?,
            _ => {
                numeric_pair(&mut t)?;
            }
        },
        Op::Switch(_) => {
            t.require(1)?;
            t.pop(&TypeClass::Int32OrNativeInt)?;
        }
        // Leaving a region empties the evaluation stack.
        Op::Leave(_) | Op::EndFinally => t.clear(),
        Op::Ret => {
            let before = t.state().clone();
            let expected = match &env.signature.ret {
                Some(ret) => {
                    t.require(1)?;
                    t.pop(&TypeClass::AssignableTo(ret.clone()))?;
                    StackState::from_top([ret.clone()])
                }
                None => StackState::new(),
            };
            if !t.state().is_empty() {
                return Err(Fault::Shape {
                    at: "return",
                    divergence: ShapeDivergence::Depth {
                        expected: expected.len(),
                        found: before.len(),
                    },
                    expected,
                    found: before,
                });
            }
        }
        Op::Throw => {
            t.require(1)?;
            t.pop(&TypeClass::AssignableTo(VerificationType::Object(
                TypeRef::exception(),
            )))?;
        }
        Op::Rethrow => {}

        Op::LdLoc(local) => t.push(env.locals.info(*local).ty.clone()),
        Op::StLoc(local) => {
            t.require(1)?;
            t.pop(&TypeClass::AssignableTo(env.locals.info(*local).ty.clone()))?;
        }
        Op::LdLocA(local) => t.push(VerificationType::managed_ptr(
            env.locals.info(*local).ty.clone(),
        )),
        Op::LdArg(index) => t.push(argument(env, *index)?),
        Op::StArg(index) => {
            let ty = argument(env, *index)?;
            t.require(1)?;
            t.pop(&TypeClass::AssignableTo(ty))?;
        }
        Op::LdArgA(index) => {
            let ty = argument(env, *index)?;
            t.push(VerificationType::managed_ptr(ty));
        }

        Op::LdFld(field) => {
            if field.is_static() {
                return Err(Fault::Operand(format!("{field} is static; use LdSFld")));
            }
            t.require(1)?;
            t.pop(&TypeClass::AssignableTo(field.owner_operand()))?;
            t.push(field.field_type().clone());
        }
        Op::StFld(field) => {
            if field.is_static() {
                return Err(Fault::Operand(format!("{field} is static; use StSFld")));
            }
            t.require(2)?;
            t.pop(&TypeClass::AssignableTo(field.field_type().clone()))?;
            t.pop(&TypeClass::AssignableTo(field.owner_operand()))?;
        }
        Op::LdSFld(field) => {
            if !field.is_static() {
                return Err(Fault::Operand(format!("{field} is an instance field")));
            }
            t.push(field.field_type().clone());
        }
        Op::StSFld(field) => {
            if !field.is_static() {
                return Err(Fault::Operand(format!("{field} is an instance field")));
            }
            t.require(1)?;
            t.pop(&TypeClass::AssignableTo(field.field_type().clone()))?;
        }

        Op::NewArr(element) => {
            t.require(1)?;
            t.pop(&TypeClass::Int32OrNativeInt)?;
            t.push(array_of(element));
        }
        Op::LdLen => {
            t.require(1)?;
            t.pop(&TypeClass::Array)?;
            t.push(VerificationType::NativeInt);
        }
        Op::LdElem(element) => {
            t.require(2)?;
            t.pop(&TypeClass::Int32OrNativeInt)?;
            t.pop(&TypeClass::AssignableTo(array_of(element)))?;
            t.push(element.clone());
        }
        Op::StElem(element) => {
            t.require(3)?;
            t.pop(&TypeClass::AssignableTo(element.clone()))?;
            t.pop(&TypeClass::Int32OrNativeInt)?;
            t.pop(&TypeClass::AssignableTo(array_of(element)))?;
        }

        Op::LdInd(ty) => {
            t.require(1)?;
            pointer_to(&mut t, ty)?;
            t.push(ty.clone());
        }
        Op::StInd(ty) => {
            t.require(2)?;
            t.pop(&TypeClass::AssignableTo(ty.clone()))?;
            pointer_to(&mut t, ty)?;
        }

        Op::NewObj(ctor) => {
            if ctor.kind() != MethodKind::Constructor {
                return Err(Fault::Operand(format!("{ctor} is not a constructor")));
            }
            t.pop_arguments(ctor.params())?;
            t.push(VerificationType::of_type(ctor.declaring_type()));
        }
        Op::CastClass(ty) | Op::IsInst(ty) => {
            reference_type(ty)?;
            t.require(1)?;
            t.pop(&TypeClass::Reference)?;
            t.push(VerificationType::Object(ty.clone()));
        }
        Op::Box(ty) => {
            t.require(1)?;
            t.pop(&TypeClass::AssignableTo(VerificationType::of_type(ty)))?;
            t.push(VerificationType::Object(ty.clone()));
        }
        Op::UnboxAny(ty) => {
            t.require(1)?;
            t.pop(&TypeClass::Reference)?;
            t.push(VerificationType::of_type(ty));
        }
        Op::InitObj(ty) => {
            if !ty.is_value_type() {
                return Err(Fault::Operand(format!("{ty} is not a value type")));
            }
            t.require(1)?;
            t.pop(&TypeClass::AssignableTo(VerificationType::managed_ptr(
                VerificationType::Value(ty.clone()),
            )))?;
        }

        Op::Call(method) => {
            t.pop_arguments(&method.argument_types())?;
            if let Some(ret) = method.return_type() {
                t.push(ret.clone());
            }
        }
        Op::CallVirt(method) => {
            if !matches!(method.kind(), MethodKind::Instance | MethodKind::Virtual) {
                return Err(Fault::Operand(format!("{method} has no receiver")));
            }
            t.pop_arguments(&method.argument_types())?;
            if let Some(ret) = method.return_type() {
                t.push(ret.clone());
            }
        }
        Op::CallIndirect(sig) => {
            t.require(sig.params.len() + 1)?;
            t.pop(&TypeClass::NativeInt)?;
            t.pop_arguments(&sig.params)?;
            if let Some(ret) = &sig.ret {
                t.push(ret.clone());
            }
        }
        Op::LdFtn(_) => t.push(VerificationType::NativeInt),
    }
    Ok(())
}

/// Number of values `op` pushes. `Dup` counts as one push of a copy.
pub fn pushes(op: &Op) -> usize {
    match op {
        Op::LdcI4(_)
        | Op::LdcI8(_)
        | Op::LdcR4(_)
        | Op::LdcR8(_)
        | Op::LdNull
        | Op::LdStr(_)
        | Op::Dup
        | Op::Binary(_)
        | Op::Bitwise(_)
        | Op::Shift(_)
        | Op::Neg
        | Op::Not
        | Op::Compare(_)
        | Op::Convert(_)
        | Op::LdLoc(_)
        | Op::LdLocA(_)
        | Op::LdArg(_)
        | Op::LdArgA(_)
        | Op::LdFld(_)
        | Op::LdSFld(_)
        | Op::NewArr(_)
        | Op::LdLen
        | Op::LdElem(_)
        | Op::LdInd(_)
        | Op::NewObj(_)
        | Op::CastClass(_)
        | Op::IsInst(_)
        | Op::Box(_)
        | Op::UnboxAny(_)
        | Op::LdFtn(_) => 1,
        Op::Call(method) | Op::CallVirt(method) => usize::from(method.return_type().is_some()),
        Op::CallIndirect(sig) => usize::from(sig.ret.is_some()),
        Op::Nop
        | Op::Pop
        | Op::Branch { .. }
        | Op::Switch(_)
        | Op::Leave(_)
        | Op::Ret
        | Op::Throw
        | Op::Rethrow
        | Op::EndFinally
        | Op::StLoc(_)
        | Op::StArg(_)
        | Op::StFld(_)
        | Op::StSFld(_)
        | Op::StElem(_)
        | Op::StInd(_)
        | Op::InitObj(_) => 0,
    }
}

fn numeric_pair(t: &mut StackTracker<'_>) -> Result<VerificationType, Fault> {
    t.require(2)?;
    let lhs = t.check(1, &TypeClass::Numeric)?.clone();
    let partner = lhs.binary_partner();
    let rhs = t.pop(&partner)?;
    t.pop(&TypeClass::Any)?;
    combine(&lhs, &rhs, &partner)
}

fn equality_pair(t: &mut StackTracker<'_>) -> Result<(), Fault> {
    t.require(2)?;
    let lhs = t.peek(1)?.clone();
    let partner = if lhs.is_numeric() {
        lhs.binary_partner()
    } else if lhs.is_reference() {
        TypeClass::Reference
    } else if lhs.is_pointer() {
        TypeClass::AssignableTo(lhs.clone())
    } else {
        return Err(Fault::Stack(StackFault::Mismatch {
            expected: TypeClass::Condition,
            found: lhs,
            position: 1,
        }));
    };
    t.pop(&partner)?;
    t.pop(&TypeClass::Any)?;
    Ok(())
}

fn combine(
    lhs: &VerificationType,
    rhs: &VerificationType,
    partner: &TypeClass,
) -> Result<VerificationType, Fault> {
    VerificationType::binary_numeric(lhs, rhs).ok_or_else(|| {
        Fault::Stack(StackFault::Mismatch {
            expected: partner.clone(),
            found: rhs.clone(),
            position: 0,
        })
    })
}

fn pointer_to(t: &mut StackTracker<'_>, ty: &VerificationType) -> Result<(), Fault> {
    let pointer = t.pop(&TypeClass::Pointer)?;
    let referent = match &pointer {
        VerificationType::ManagedPtr(referent) | VerificationType::UnmanagedPtr(referent) => {
            referent
        }
        _ => return Ok(()),
    };
    if referent.is_assignable_to(ty, t.types()) && ty.is_assignable_to(referent, t.types()) {
        Ok(())
    } else {
        Err(Fault::Stack(StackFault::Mismatch {
            expected: TypeClass::AssignableTo(VerificationType::managed_ptr(ty.clone())),
            found: pointer,
            position: 0,
        }))
    }
}

fn argument(env: &VerifyEnv<'_>, index: u16) -> Result<VerificationType, Fault> {
    env.arguments
        .get(index as usize)
        .cloned()
        .ok_or_else(|| Fault::Operand(format!("argument {index} is out of range")))
}

fn array_of(element: &VerificationType) -> VerificationType {
    VerificationType::Object(TypeRef::array_of(element.clone()))
}

fn reference_type(ty: &TypeRef) -> Result<(), Fault> {
    if ty.is_value_type() {
        Err(Fault::Operand(format!("{ty} is a value type")))
    } else {
        Ok(())
    }
}
