//! Tail-call legality marking

use crate::config::{CallKind, TailCallPolicy};
use crate::program::{Entry, Program};
use crate::regions::ScopeId;
use stackil_bytecode::core::instructions::Op;
use stackil_bytecode::core::metadata::{CallingConvention, TypeProvider};
use stackil_bytecode::core::opcodes::InstructionFlags;
use stackil_bytecode::core::types::VerificationType;
use tracing::debug;

/// Kind of a call instruction as the policy sees it
pub fn call_kind(op: &Op) -> Option<CallKind> {
    let (kind, convention) = match op {
        Op::Call(method) => (CallKind::Direct, method.convention()),
        Op::CallVirt(method) => (CallKind::Virtual, method.convention()),
        Op::CallIndirect(sig) => (CallKind::Indirect, sig.convention),
        _ => return None,
    };
    Some(match convention {
        CallingConvention::VarArgs => CallKind::VarArgs,
        CallingConvention::Default => kind,
    })
}

/// Flag every call that may reuse the caller's frame; returns the count
pub fn mark_tail_calls(program: &mut Program, policy: &TailCallPolicy) -> usize {
    for entry in &mut program.entries {
        entry.flags.remove(InstructionFlags::TAIL_CALL);
    }

    let ret = program.signature.ret.clone();
    let eligible: Vec<usize> = (0..program.entries.len())
        .filter(|&index| {
            is_eligible(
                &program.entries,
                index,
                ret.as_ref(),
                policy,
                program.types(),
            )
        })
        .collect();

    for &index in &eligible {
        program.entries[index]
            .flags
            .insert(InstructionFlags::TAIL_CALL);
    }
    debug!(marked = eligible.len(), "marked tail calls");
    eligible.len()
}

fn is_eligible(
    entries: &[Entry],
    index: usize,
    ret: Option<&VerificationType>,
    policy: &TailCallPolicy,
    types: &dyn TypeProvider,
) -> bool {
    let entry = &entries[index];
    let Some(kind) = call_kind(&entry.instruction.op) else {
        return false;
    };
    if !policy.allows(kind) || entry.scope != ScopeId::ROOT {
        return false;
    }

    let followed_by_ret = entries[index + 1..]
        .iter()
        .find(|next| !next.is(InstructionFlags::ELIDED) && next.instruction.op != Op::Nop)
        .is_some_and(|next| next.instruction.op == Op::Ret);
    if !followed_by_ret {
        return false;
    }

    let (arguments, callee_ret) = match &entry.instruction.op {
        Op::Call(method) | Op::CallVirt(method) => {
            (method.argument_types().len(), method.return_type().cloned())
        }
        Op::CallIndirect(sig) => (sig.params.len() + 1, sig.ret.clone()),
        _ => return false,
    };
    // Nothing of the caller's may stay on the stack below the arguments.
    if entry.stack_before.len() != arguments {
        return false;
    }
    if entry
        .stack_before
        .iter()
        .any(|ty| matches!(ty, VerificationType::ManagedPtr(_)))
    {
        return false;
    }

    match (callee_ret.as_ref(), ret) {
        (None, None) => true,
        (Some(from), Some(to)) => from.is_assignable_to(to, types),
        _ => false,
    }
}
